//! Plan parsing, validation, and field normalization.
//!
//! A plan file is a YAML mapping. Top-level keys whose names start with
//! `parallel` introduce a group of steps that run concurrently before the
//! sequential list; every other key is a sequential step. Each step carries
//! the four required tags (`input`, `model`, `action`, `output`, with the
//! sentinel `NA` meaning "none") plus the optional specialized fields.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

/// Sentinel meaning "none" for any required tag.
pub const NA: &str = "NA";

/// Input sentinel resolving to the previous step's output.
pub const STDIN: &str = "STDIN";

/// Output sentinel routing the response to the progress sink or stdout.
pub const STDOUT: &str = "STDOUT";

/// Input sentinel capturing the primary display.
pub const SCREENSHOT: &str = "screenshot";

/// The one specialized step type currently supported.
pub const RESPONSES_STEP_TYPE: &str = "openai-responses";

const PARALLEL_KEY_PREFIX: &str = "parallel";

const REQUIRED_TAGS: &[&str] = &["input", "model", "action", "output"];

/// A polymorphic step field: scalar, sequence, or keyed record.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Scalar(String),
    List(Vec<FieldValue>),
    Record(BTreeMap<String, serde_yaml::Value>),
}

/// Batch handling for steps with multiple file inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    Combined,
    #[default]
    Individual,
}

/// One step's configuration record.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StepConfig {
    pub input: Option<FieldValue>,
    pub model: Option<FieldValue>,
    pub action: Option<FieldValue>,
    pub output: Option<FieldValue>,

    #[serde(rename = "type")]
    pub step_type: Option<String>,
    pub batch_mode: Option<BatchMode>,
    pub skip_errors: Option<bool>,

    // Fields for the responses variant.
    pub instructions: Option<String>,
    pub tools: Option<serde_json::Value>,
    pub previous_response_id: Option<String>,
    pub max_output_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stream: Option<bool>,
    pub response_format: Option<serde_json::Value>,
}

impl StepConfig {
    pub fn batch_mode(&self) -> BatchMode {
        self.batch_mode.unwrap_or_default()
    }

    pub fn skip_errors(&self) -> bool {
        self.skip_errors.unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub config: StepConfig,
}

#[derive(Debug, Clone)]
pub struct ParallelGroup {
    pub name: String,
    pub steps: Vec<Step>,
}

/// A validated plan: named parallel groups followed by sequential steps.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub parallel_groups: Vec<ParallelGroup>,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn all_steps(&self) -> impl Iterator<Item = &Step> {
        self.parallel_groups
            .iter()
            .flat_map(|g| g.steps.iter())
            .chain(self.steps.iter())
    }
}

/// One entry of a normalized field: a plain string, or a keyed record that
/// carries semantic content (url / database inputs, database outputs).
#[derive(Debug, Clone, PartialEq)]
pub enum SpecEntry {
    Value(String),
    Record(BTreeMap<String, serde_yaml::Value>),
}

// --- Parser ---

pub fn parse_plan_file(path: &Path) -> Result<Plan> {
    let content = fs::read_to_string(path).map_err(|e| {
        EngineError::PlanValidation(format!("cannot read plan file '{}': {}", path.display(), e))
    })?;
    parse_plan_str(&content)
}

pub fn parse_plan_str(content: &str) -> Result<Plan> {
    let document: serde_yaml::Mapping = serde_yaml::from_str(content)
        .map_err(|e| EngineError::PlanValidation(format!("invalid plan document: {}", e)))?;

    let mut plan = Plan::default();
    for (key, value) in document {
        let name = key_string(&key)?;
        if name.to_ascii_lowercase().starts_with(PARALLEL_KEY_PREFIX) {
            let serde_yaml::Value::Mapping(group_map) = value else {
                return Err(EngineError::PlanValidation(format!(
                    "parallel group '{}' must be a mapping of steps",
                    name
                )));
            };
            let mut steps = Vec::new();
            for (step_key, step_value) in group_map {
                let step_name = key_string(&step_key)?;
                let config = parse_step_config(&step_name, step_value)?;
                steps.push(Step {
                    name: step_name,
                    config,
                });
            }
            plan.parallel_groups.push(ParallelGroup { name, steps });
        } else {
            let config = parse_step_config(&name, value)?;
            plan.steps.push(Step { name, config });
        }
    }

    validate_plan(&plan)?;
    Ok(plan)
}

fn key_string(key: &serde_yaml::Value) -> Result<String> {
    key.as_str().map(|s| s.to_string()).ok_or_else(|| {
        EngineError::PlanValidation("step and group names must be strings".to_string())
    })
}

fn parse_step_config(step: &str, value: serde_yaml::Value) -> Result<StepConfig> {
    let serde_yaml::Value::Mapping(ref mapping) = value else {
        return Err(EngineError::PlanValidation(format!(
            "step '{}' must be a mapping",
            step
        )));
    };

    // Required tags are checked on the raw mapping so that an explicit null
    // still counts as present (it normalizes to an empty sequence).
    let missing: Vec<&str> = REQUIRED_TAGS
        .iter()
        .filter(|tag| !mapping.contains_key(&serde_yaml::Value::String(tag.to_string())))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(EngineError::PlanValidation(format!(
            "step '{}' is missing required tags: {}",
            step,
            missing.join(", ")
        )));
    }

    serde_yaml::from_value(value).map_err(|e| {
        EngineError::PlanValidation(format!("step '{}' has an invalid shape: {}", step, e))
    })
}

// --- Validation ---

pub fn validate_plan(plan: &Plan) -> Result<()> {
    let mut seen = HashSet::new();
    for step in plan.all_steps() {
        if !seen.insert(step.name.as_str()) {
            return Err(EngineError::PlanValidation(format!(
                "duplicate step name '{}'",
                step.name
            )));
        }
    }

    for step in plan.all_steps() {
        validate_step(step)?;
    }
    for group in &plan.parallel_groups {
        for step in &group.steps {
            validate_parallel_step(&group.name, step)?;
        }
    }
    Ok(())
}

fn validate_step(step: &Step) -> Result<()> {
    if let Some(step_type) = &step.config.step_type {
        if step_type != RESPONSES_STEP_TYPE {
            return Err(EngineError::PlanValidation(format!(
                "step '{}' has unknown type '{}'",
                step.name, step_type
            )));
        }
    }

    // Records are meaningful for input/output only.
    for (field, value) in [("model", &step.config.model), ("action", &step.config.action)] {
        for entry in normalize_field(value.as_ref()) {
            if matches!(entry, SpecEntry::Record(_)) {
                return Err(EngineError::PlanValidation(format!(
                    "step '{}' has an unsupported record in its '{}' field",
                    step.name, field
                )));
            }
        }
    }
    Ok(())
}

/// Parallel siblings share nothing but the (read-only) variable map, so
/// STDIN reads and `as $var` bindings are rejected inside groups.
fn validate_parallel_step(group: &str, step: &Step) -> Result<()> {
    for entry in normalize_field(step.config.input.as_ref()) {
        if let SpecEntry::Value(value) = &entry {
            let (base, var) = split_var_binding(value);
            if base == STDIN {
                return Err(EngineError::PlanValidation(format!(
                    "step '{}' in parallel group '{}' cannot read STDIN",
                    step.name, group
                )));
            }
            if var.is_some() {
                return Err(EngineError::PlanValidation(format!(
                    "step '{}' in parallel group '{}' cannot bind variables",
                    step.name, group
                )));
            }
        }
    }
    for entry in normalize_field(step.config.output.as_ref()) {
        if let SpecEntry::Value(value) = &entry {
            if split_var_binding(value).1.is_some() {
                return Err(EngineError::PlanValidation(format!(
                    "step '{}' in parallel group '{}' cannot bind variables",
                    step.name, group
                )));
            }
        }
    }
    Ok(())
}

// --- Normalization ---

/// Normalizes a polymorphic field to an ordered entry sequence. A map with
/// the single key `filename` lifts to its value, a `filenames:`-prefixed
/// string splits on commas, a bare scalar becomes one entry, and null
/// becomes empty. Normalizing a normalized sequence is a no-op.
pub fn normalize_field(field: Option<&FieldValue>) -> Vec<SpecEntry> {
    let mut entries = Vec::new();
    if let Some(field) = field {
        push_normalized(field, &mut entries);
    }
    entries
}

fn push_normalized(field: &FieldValue, entries: &mut Vec<SpecEntry>) {
    match field {
        FieldValue::Scalar(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return;
            }
            if let Some(rest) = trimmed.strip_prefix("filenames:") {
                for part in rest.split(',') {
                    let part = part.trim();
                    if !part.is_empty() {
                        entries.push(SpecEntry::Value(part.to_string()));
                    }
                }
            } else {
                entries.push(SpecEntry::Value(trimmed.to_string()));
            }
        }
        FieldValue::List(items) => {
            for item in items {
                push_normalized(item, entries);
            }
        }
        FieldValue::Record(map) => {
            if map.len() == 1 {
                if let Some(value) = map.get("filename") {
                    if let Some(lifted) = yaml_scalar_to_string(value) {
                        entries.push(SpecEntry::Value(lifted));
                        return;
                    }
                }
            }
            entries.push(SpecEntry::Record(map.clone()));
        }
    }
}

pub fn yaml_scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Splits the `X as $name` suffix off an entry, returning the bare entry
/// and the variable name, if any.
pub fn split_var_binding(entry: &str) -> (&str, Option<&str>) {
    if let Some((base, var)) = entry.rsplit_once(" as $") {
        let var = var.trim();
        if !var.is_empty()
            && var
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return (base.trim_end(), Some(var));
        }
    }
    (entry, None)
}

/// The model a step runs against: the first entry of the normalized model
/// list. Additional entries are reserved.
pub fn first_model(config: &StepConfig) -> Option<String> {
    normalize_field(config.model.as_ref())
        .into_iter()
        .find_map(|e| match e {
            SpecEntry::Value(v) => Some(v),
            SpecEntry::Record(_) => None,
        })
}

/// The step's action text: normalized entries joined with newlines, with
/// the `NA` sentinel yielding an empty action.
pub fn action_text(config: &StepConfig) -> String {
    let parts: Vec<String> = normalize_field(config.action.as_ref())
        .into_iter()
        .filter_map(|e| match e {
            SpecEntry::Value(v) if v != NA => Some(v),
            _ => None,
        })
        .collect();
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(s: &str) -> SpecEntry {
        SpecEntry::Value(s.to_string())
    }

    #[test]
    fn normalizes_bare_scalar_to_one_entry() {
        let field = FieldValue::Scalar("notes.txt".to_string());
        assert_eq!(normalize_field(Some(&field)), vec![value("notes.txt")]);
    }

    #[test]
    fn normalizes_filenames_prefix_by_splitting_on_commas() {
        let field = FieldValue::Scalar("filenames: a.txt, b.txt ,c.txt".to_string());
        assert_eq!(
            normalize_field(Some(&field)),
            vec![value("a.txt"), value("b.txt"), value("c.txt")]
        );
    }

    #[test]
    fn lifts_single_filename_record() {
        let mut map = BTreeMap::new();
        map.insert(
            "filename".to_string(),
            serde_yaml::Value::String("doc.md".to_string()),
        );
        let field = FieldValue::Record(map);
        assert_eq!(normalize_field(Some(&field)), vec![value("doc.md")]);
    }

    #[test]
    fn keeps_url_record_as_record() {
        let mut map = BTreeMap::new();
        map.insert(
            "url".to_string(),
            serde_yaml::Value::String("https://example.com".to_string()),
        );
        let field = FieldValue::Record(map.clone());
        assert_eq!(
            normalize_field(Some(&field)),
            vec![SpecEntry::Record(map)]
        );
    }

    #[test]
    fn absent_field_normalizes_to_empty() {
        assert!(normalize_field(None).is_empty());
        let blank = FieldValue::Scalar("   ".to_string());
        assert!(normalize_field(Some(&blank)).is_empty());
    }

    #[test]
    fn normalization_is_idempotent() {
        let field = FieldValue::Scalar("filenames: a.txt,b.txt".to_string());
        let once = normalize_field(Some(&field));
        let rebuilt = FieldValue::List(
            once.iter()
                .map(|e| match e {
                    SpecEntry::Value(v) => FieldValue::Scalar(v.clone()),
                    SpecEntry::Record(m) => FieldValue::Record(m.clone()),
                })
                .collect(),
        );
        assert_eq!(normalize_field(Some(&rebuilt)), once);
    }

    #[test]
    fn missing_tags_are_reported_together() {
        let plan = parse_plan_str("summarize:\n  input: notes.txt\n");
        let err = plan.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("summarize"), "{}", message);
        assert!(message.contains("model"), "{}", message);
        assert!(message.contains("action"), "{}", message);
        assert!(message.contains("output"), "{}", message);
        assert!(!message.contains("input,"), "{}", message);
    }

    #[test]
    fn null_tag_counts_as_present() {
        let plan = parse_plan_str(
            "hello:\n  input:\n  model: NA\n  action: say hello\n  output: STDOUT\n",
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert!(normalize_field(plan.steps[0].config.input.as_ref()).is_empty());
    }

    #[test]
    fn parses_parallel_groups_before_sequential_steps() {
        let plan = parse_plan_str(
            r#"
parallel-fetch:
  left:
    input: NA
    model: NA
    action: left
    output: left.txt
  right:
    input: NA
    model: NA
    action: right
    output: right.txt
merge:
  input: "filenames: left.txt, right.txt"
  model: NA
  action: merge
  output: STDOUT
"#,
        )
        .unwrap();
        assert_eq!(plan.parallel_groups.len(), 1);
        assert_eq!(plan.parallel_groups[0].name, "parallel-fetch");
        assert_eq!(plan.parallel_groups[0].steps.len(), 2);
        assert_eq!(plan.parallel_groups[0].steps[0].name, "left");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].name, "merge");
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let err = parse_plan_str(
            r#"
parallel-a:
  work:
    input: NA
    model: NA
    action: one
    output: STDOUT
work:
  input: NA
  model: NA
  action: two
  output: STDOUT
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate step name 'work'"));
    }

    #[test]
    fn rejects_stdin_and_bindings_in_parallel_groups() {
        let stdin = parse_plan_str(
            r#"
parallel-a:
  bad:
    input: STDIN
    model: NA
    action: x
    output: STDOUT
"#,
        );
        assert!(stdin.unwrap_err().to_string().contains("cannot read STDIN"));

        let binding = parse_plan_str(
            r#"
parallel-a:
  bad:
    input: NA
    model: NA
    action: x
    output: out.txt as $result
"#,
        );
        assert!(binding
            .unwrap_err()
            .to_string()
            .contains("cannot bind variables"));
    }

    #[test]
    fn splits_variable_bindings() {
        assert_eq!(split_var_binding("STDIN as $prev"), ("STDIN", Some("prev")));
        assert_eq!(split_var_binding("plain.txt"), ("plain.txt", None));
        assert_eq!(
            split_var_binding("weird as $not a name"),
            ("weird as $not a name", None)
        );
    }

    #[test]
    fn first_model_and_action_text() {
        let plan = parse_plan_str(
            "s:\n  input: NA\n  model: [gpt-4o, claude-3]\n  action: [one, two]\n  output: STDOUT\n",
        )
        .unwrap();
        let config = &plan.steps[0].config;
        assert_eq!(first_model(config).unwrap(), "gpt-4o");
        assert_eq!(action_text(config), "one\ntwo");
    }

    #[test]
    fn rejects_unknown_step_type() {
        let err = parse_plan_str(
            "s:\n  type: magic\n  input: NA\n  model: NA\n  action: x\n  output: STDOUT\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown type"));
    }
}
