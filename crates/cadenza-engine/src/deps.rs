//! File-dependency analysis across the whole plan.
//!
//! Builds the producer map from declared output paths to producing steps,
//! enforces the two in-group rules (no shared output path, no read of a
//! sibling's output), and rejects cycles in the cross-plan producer graph.
//! Forward references are tolerated: the resolver consults the producer map
//! to relax its path-must-exist check for declared future outputs.

use crate::error::{EngineError, Result};
use crate::plan::{self, Plan, SpecEntry, Step, NA, SCREENSHOT, STDIN, STDOUT};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct DependencyReport {
    producers: HashMap<String, String>,
}

impl DependencyReport {
    pub fn producer_of(&self, path: &str) -> Option<&str> {
        self.producers.get(path).map(|s| s.as_str())
    }

    pub fn is_declared_output(&self, path: &str) -> bool {
        self.producers.contains_key(path)
    }
}

fn output_paths(step: &Step) -> Vec<String> {
    plan::normalize_field(step.config.output.as_ref())
        .into_iter()
        .filter_map(|entry| match entry {
            SpecEntry::Value(value) => {
                let (base, _) = plan::split_var_binding(&value);
                if base == STDOUT || base == NA {
                    None
                } else {
                    Some(base.to_string())
                }
            }
            SpecEntry::Record(_) => None,
        })
        .collect()
}

fn input_paths(step: &Step) -> Vec<String> {
    plan::normalize_field(step.config.input.as_ref())
        .into_iter()
        .filter_map(|entry| match entry {
            SpecEntry::Value(value) => {
                let (base, _) = plan::split_var_binding(&value);
                if base == NA
                    || base == STDIN
                    || base == SCREENSHOT
                    || base.starts_with("http://")
                    || base.starts_with("https://")
                {
                    None
                } else {
                    Some(base.to_string())
                }
            }
            SpecEntry::Record(_) => None,
        })
        .collect()
}

pub fn analyze(plan: &Plan) -> Result<DependencyReport> {
    // In-group conflicts.
    for group in &plan.parallel_groups {
        let mut group_outputs: HashMap<String, &str> = HashMap::new();
        for step in &group.steps {
            for path in output_paths(step) {
                if let Some(previous) = group_outputs.insert(path.clone(), &step.name) {
                    return Err(EngineError::DependencyValidation(format!(
                        "steps '{}' and '{}' in parallel group '{}' both write '{}'",
                        previous, step.name, group.name, path
                    )));
                }
            }
        }
        for step in &group.steps {
            for path in input_paths(step) {
                if let Some(producer) = group_outputs.get(&path) {
                    if *producer != step.name {
                        return Err(EngineError::DependencyValidation(format!(
                            "step '{}' in parallel group '{}' reads '{}' produced by sibling '{}'",
                            step.name, group.name, path, producer
                        )));
                    }
                }
            }
        }
    }

    // Producer map across the whole plan.
    let mut report = DependencyReport::default();
    for step in plan.all_steps() {
        for path in output_paths(step) {
            report.producers.insert(path, step.name.clone());
        }
    }

    // Cycle detection over the producer graph.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for step in plan.all_steps() {
        graph.add_node(step.name.as_str());
    }
    for step in plan.all_steps() {
        for path in input_paths(step) {
            if let Some(producer) = report.producers.get(&path) {
                if producer != &step.name {
                    graph.add_edge(producer.as_str(), step.name.as_str(), ());
                }
            }
        }
    }
    if let Err(cycle) = toposort(&graph, None) {
        return Err(EngineError::DependencyValidation(format!(
            "circular file dependency involving step '{}'",
            cycle.node_id()
        )));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::parse_plan_str;

    #[test]
    fn builds_producer_map() {
        let plan = parse_plan_str(
            r#"
write:
  input: NA
  model: NA
  action: x
  output: a.txt
read:
  input: a.txt
  model: NA
  action: y
  output: STDOUT
"#,
        )
        .unwrap();
        let report = analyze(&plan).unwrap();
        assert_eq!(report.producer_of("a.txt").unwrap(), "write");
        assert!(report.is_declared_output("a.txt"));
        assert!(!report.is_declared_output("b.txt"));
    }

    #[test]
    fn rejects_shared_output_in_group() {
        let plan = parse_plan_str(
            r#"
parallel-work:
  one:
    input: NA
    model: NA
    action: x
    output: x.txt
  two:
    input: NA
    model: NA
    action: y
    output: x.txt
"#,
        )
        .unwrap();
        let err = analyze(&plan).unwrap_err();
        assert!(err.to_string().contains("both write 'x.txt'"), "{}", err);
    }

    #[test]
    fn stdout_outputs_never_conflict() {
        let plan = parse_plan_str(
            r#"
parallel-work:
  one:
    input: NA
    model: NA
    action: x
    output: STDOUT
  two:
    input: NA
    model: NA
    action: y
    output: STDOUT
"#,
        )
        .unwrap();
        assert!(analyze(&plan).is_ok());
    }

    #[test]
    fn rejects_reading_a_sibling_output() {
        let plan = parse_plan_str(
            r#"
parallel-work:
  producer:
    input: NA
    model: NA
    action: x
    output: shared.txt
  consumer:
    input: shared.txt
    model: NA
    action: y
    output: STDOUT
"#,
        )
        .unwrap();
        let err = analyze(&plan).unwrap_err();
        assert!(err.to_string().contains("produced by sibling"), "{}", err);
    }

    #[test]
    fn rejects_cycles_naming_a_step() {
        let plan = parse_plan_str(
            r#"
first:
  input: b.txt
  model: NA
  action: x
  output: a.txt
second:
  input: a.txt
  model: NA
  action: y
  output: b.txt
"#,
        )
        .unwrap();
        let err = analyze(&plan).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("circular file dependency"), "{}", message);
        assert!(
            message.contains("first") || message.contains("second"),
            "{}",
            message
        );
    }

    #[test]
    fn tolerates_forward_references() {
        let plan = parse_plan_str(
            r#"
early:
  input: later.txt
  model: NA
  action: x
  output: STDOUT
late:
  input: NA
  model: NA
  action: y
  output: later.txt
"#,
        )
        .unwrap();
        let report = analyze(&plan).unwrap();
        assert_eq!(report.producer_of("later.txt").unwrap(), "late");
    }
}
