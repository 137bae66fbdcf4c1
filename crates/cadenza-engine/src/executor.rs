//! Step execution: prompt assembly, provider invocation, output routing.
//!
//! A step moves through input-resolving, provider-configured, invoking, and
//! output-routing before completing; any stage can fail it. The `NA` model
//! sentinel skips invocation and yields the substituted action, which keeps
//! side-effect-free plans runnable without any provider.

use crate::deps::DependencyReport;
use crate::error::{EngineError, Result};
use crate::input::{required_capabilities, Collaborators, InputItem, InputResolver};
use crate::plan::{self, BatchMode, SpecEntry, Step, NA, RESPONSES_STEP_TYPE, STDOUT};
use crate::progress::{PerformanceMetrics, ProgressSender, Update};
use crate::registry::ModelRouter;
use crate::responses;
use cadenza_core::database::{self, SqlKind};
use cadenza_core::providers::{FileAttachment, Provider};
use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Run-wide execution options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub verbose: bool,
    pub server_data_dir: Option<PathBuf>,
    pub runtime_dir: Option<String>,
}

impl RunOptions {
    /// The directory declared output paths resolve under, when configured.
    pub fn output_base(&self) -> Option<PathBuf> {
        self.server_data_dir.as_ref().map(|data_dir| {
            match &self.runtime_dir {
                Some(runtime) => data_dir.join(runtime),
                None => data_dir.clone(),
            }
        })
    }
}

#[derive(Debug)]
pub struct StepOutcome {
    pub text: String,
    pub metrics: PerformanceMetrics,
}

/// Everything a worker needs to run one step. Cloned into each parallel
/// worker thread; the heavyweight pieces are shared through Arcs.
#[derive(Clone)]
pub struct StepRunner {
    pub report: Arc<DependencyReport>,
    pub router: Arc<ModelRouter>,
    pub collaborators: Arc<Collaborators>,
    pub options: RunOptions,
    pub progress: Option<ProgressSender>,
    pub cancel: Arc<AtomicBool>,
}

impl StepRunner {
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn emit(&self, update: Update) {
        if let Some(sender) = &self.progress {
            // A closed progress channel cancels the run.
            if sender.send(update).is_err() {
                self.cancel.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn run_step(
        &self,
        step: &Step,
        last_output: Option<&str>,
        vars: &mut HashMap<String, String>,
        group: Option<&str>,
    ) -> Result<StepOutcome> {
        if self.cancelled() {
            return Err(EngineError::Cancelled);
        }

        let model = plan::first_model(&step.config).unwrap_or_else(|| NA.to_string());
        let action_raw = plan::action_text(&step.config);
        self.emit(Update::step(
            &step.name,
            Some(&model),
            &action_raw,
            step.config.instructions.as_deref(),
            group,
        ));

        let started = Instant::now();
        let mut metrics = PerformanceMetrics::default();

        // The resolver (and its temp files) must outlive invocation and
        // output routing.
        let input_started = Instant::now();
        let entries = plan::normalize_field(step.config.input.as_ref());
        let mut resolver =
            InputResolver::new(&step.name, &self.report, &self.collaborators, &self.options)?;
        let items = resolver.resolve(&entries, last_output, vars)?;
        metrics.input_ms = elapsed_ms(input_started);

        if self.cancelled() {
            return Err(EngineError::Cancelled);
        }

        let action_started = Instant::now();
        let action = substitute_variables(&action_raw, vars);
        metrics.action_ms = elapsed_ms(action_started);

        let model_started = Instant::now();
        let text = self.invoke(step, &model, &items, &action, vars)?;
        metrics.model_ms = elapsed_ms(model_started);

        let output_started = Instant::now();
        self.route_outputs(step, &model, &text, &metrics, vars)?;
        metrics.output_ms = elapsed_ms(output_started);
        metrics.total_ms = elapsed_ms(started);

        self.emit(Update::complete(&step.name, metrics.clone(), group));
        Ok(StepOutcome { text, metrics })
    }

    fn invoke(
        &self,
        step: &Step,
        model: &str,
        items: &[InputItem],
        action: &str,
        vars: &mut HashMap<String, String>,
    ) -> Result<String> {
        if model == NA {
            return Ok(action.to_string());
        }

        let capabilities = required_capabilities(items);
        let provider = self
            .router
            .provider_for_step(&step.name, model, &capabilities)?;

        if step.config.step_type.as_deref() == Some(RESPONSES_STEP_TYPE) {
            return responses::run_responses_step(step, items, action, vars, provider.as_ref(), model);
        }

        let file_items: Vec<&InputItem> = items.iter().filter(|i| i.is_file()).collect();
        let inline_items: Vec<&InputItem> = items.iter().filter(|i| !i.is_file()).collect();

        // Inline content rides along in the action when files are present.
        let action = if !inline_items.is_empty() && !file_items.is_empty() {
            format!("Input:\n{}\n\n{}", joined_contents(&inline_items), action)
        } else {
            action.to_string()
        };

        if file_items.is_empty() {
            let prompt = if inline_items.is_empty() {
                action
            } else {
                format!(
                    "Input:\n{}\n\nAction: {}",
                    joined_contents(&inline_items),
                    action
                )
            };
            self.check_prompt_budget(&step.name, provider.as_ref(), &prompt)?;
            return provider
                .send_prompt(model, &prompt)
                .map_err(|e| invocation_error(&step.name, e));
        }

        if file_items.len() == 1 {
            let item = file_items[0];
            let attachment = FileAttachment {
                path: item.path().expect("file item has a path"),
                mime: item.mime().expect("file item has a mime"),
            };
            self.check_prompt_budget(&step.name, provider.as_ref(), &action)?;
            return provider
                .send_prompt_with_file(model, &action, &attachment)
                .map_err(|e| invocation_error(&step.name, e));
        }

        match step.config.batch_mode() {
            BatchMode::Combined => {
                let prompt = build_combined_prompt(&file_items, &action);
                self.check_prompt_budget(&step.name, provider.as_ref(), &prompt)?;
                provider
                    .send_prompt(model, &prompt)
                    .map_err(|e| invocation_error(&step.name, e))
            }
            BatchMode::Individual => {
                self.invoke_individual(step, model, provider.as_ref(), &file_items, &action)
            }
        }
    }

    /// One call per file. Failures never abort the surviving files; they
    /// accumulate into a trailing block whose tone follows `skip_errors`.
    fn invoke_individual(
        &self,
        step: &Step,
        model: &str,
        provider: &dyn Provider,
        file_items: &[&InputItem],
        action: &str,
    ) -> Result<String> {
        let prompt = format!("For this file: {}", action);
        let mut successes = Vec::new();
        let mut failures = Vec::new();

        for item in file_items {
            if self.cancelled() {
                return Err(EngineError::Cancelled);
            }
            let attachment = FileAttachment {
                path: item.path().expect("file item has a path"),
                mime: item.mime().expect("file item has a mime"),
            };
            match provider.send_prompt_with_file(model, &prompt, &attachment) {
                Ok(result) => {
                    successes.push(format!("File: {}\n{}", item.display_path(), result))
                }
                Err(e) => failures.push((item.display_path(), e.to_string())),
            }
        }

        if successes.is_empty() && !failures.is_empty() {
            let details: Vec<String> = failures
                .iter()
                .map(|(path, error)| format!("{}: {}", path, error))
                .collect();
            return Err(EngineError::Invocation {
                step: step.name.clone(),
                message: format!("all {} files failed: {}", failures.len(), details.join("; ")),
            });
        }

        let mut output = successes.join("\n\n");
        if !failures.is_empty() {
            let header = if step.config.skip_errors() {
                "Warnings"
            } else {
                "Errors"
            };
            output.push_str(&format!("\n\n{}:\n", header));
            for (path, error) in &failures {
                output.push_str(&format!("- {}: {}\n", path, error));
            }
        }
        Ok(output)
    }

    fn check_prompt_budget(&self, step: &str, provider: &dyn Provider, prompt: &str) -> Result<()> {
        if let Some(budget) = provider.max_prompt_chars() {
            if prompt.len() > budget {
                return Err(EngineError::Invocation {
                    step: step.to_string(),
                    message: format!(
                        "prompt is {} characters, over the provider budget of {}",
                        prompt.len(),
                        budget
                    ),
                });
            }
        }
        Ok(())
    }

    fn route_outputs(
        &self,
        step: &Step,
        model: &str,
        text: &str,
        metrics: &PerformanceMetrics,
        vars: &mut HashMap<String, String>,
    ) -> Result<()> {
        for entry in plan::normalize_field(step.config.output.as_ref()) {
            match entry {
                SpecEntry::Value(raw) => {
                    let (base, var) = plan::split_var_binding(&raw);
                    if let Some(name) = var {
                        vars.insert(name.to_string(), text.to_string());
                    }
                    if base == NA {
                        continue;
                    }
                    if base == STDOUT {
                        self.route_stdout(step, model, text, metrics);
                    } else {
                        self.write_output_file(&step.name, base, text)?;
                    }
                }
                SpecEntry::Record(map) => {
                    if !map.contains_key("database") {
                        return Err(EngineError::OutputRouting {
                            step: step.name.clone(),
                            message: format!(
                                "unknown output record with keys [{}]",
                                map.keys().cloned().collect::<Vec<_>>().join(", ")
                            ),
                        });
                    }
                    self.route_database(step, &map, vars)?;
                }
            }
        }
        Ok(())
    }

    fn route_stdout(&self, step: &Step, model: &str, text: &str, metrics: &PerformanceMetrics) {
        if let Some(sender) = &self.progress {
            let update = Update::output(&step.name, model, text);
            if sender.send(update).is_err() {
                self.cancel.store(true, Ordering::SeqCst);
            }
        } else {
            println!("Response from {}:\n{}", model, text);
            if self.options.verbose {
                println!("[{}]", metrics.summary());
            }
        }
    }

    fn route_database(
        &self,
        step: &Step,
        map: &std::collections::BTreeMap<String, serde_yaml::Value>,
        vars: &HashMap<String, String>,
    ) -> Result<()> {
        let db = map
            .get("database")
            .and_then(plan::yaml_scalar_to_string)
            .ok_or_else(|| EngineError::OutputRouting {
                step: step.name.clone(),
                message: "database record has no database name".to_string(),
            })?;
        let sql = map
            .get("sql")
            .and_then(plan::yaml_scalar_to_string)
            .ok_or_else(|| EngineError::OutputRouting {
                step: step.name.clone(),
                message: "database record has no sql".to_string(),
            })?;
        let sql = substitute_variables(&sql, vars);

        database::validate_operation(&sql, SqlKind::Write).map_err(|e| {
            EngineError::OutputRouting {
                step: step.name.clone(),
                message: e.to_string(),
            }
        })?;
        self.collaborators
            .database
            .execute_write(&db, &sql)
            .map_err(|e| EngineError::OutputRouting {
                step: step.name.clone(),
                message: format!("database write failed: {}", e),
            })?;
        Ok(())
    }

    fn write_output_file(&self, step: &str, declared: &str, text: &str) -> Result<()> {
        let path = self.resolve_output_path(declared);
        let routing_error = |message: String| EngineError::OutputRouting {
            step: step.to_string(),
            message,
        };

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => {
                fs::create_dir_all(p)
                    .map_err(|e| routing_error(format!("cannot create '{}': {}", p.display(), e)))?;
                p
            }
            _ => Path::new("."),
        };

        // Write-then-rename keeps readers from seeing a partial file.
        let mut staged = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| routing_error(format!("cannot stage output file: {}", e)))?;
        staged
            .write_all(text.as_bytes())
            .map_err(|e| routing_error(format!("cannot write output: {}", e)))?;
        staged
            .persist(&path)
            .map_err(|e| routing_error(format!("cannot persist '{}': {}", path.display(), e)))?;
        Ok(())
    }

    fn resolve_output_path(&self, declared: &str) -> PathBuf {
        let declared_path = Path::new(declared);
        if declared_path.is_absolute() {
            return declared_path.to_path_buf();
        }
        match self.options.output_base() {
            Some(base) => base.join(declared_path),
            None => declared_path.to_path_buf(),
        }
    }
}

/// Literal `$name` replacement, longer names first so `$prev` never
/// clobbers `$preview`. No shell-style quoting.
pub fn substitute_variables(text: &str, vars: &HashMap<String, String>) -> String {
    let mut names: Vec<&String> = vars.keys().collect();
    names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    let mut result = text.to_string();
    for name in names {
        result = result.replace(&format!("${}", name), &vars[name]);
    }
    result
}

fn build_combined_prompt(file_items: &[&InputItem], action: &str) -> String {
    let mut prompt = String::new();
    for (index, item) in file_items.iter().enumerate() {
        let content = item
            .text_content()
            .unwrap_or_else(|| "(binary file)".to_string());
        prompt.push_str(&format!(
            "File {} ({}):\n{}\n\n",
            index + 1,
            item.display_path(),
            content
        ));
    }
    prompt.push_str(&format!("Action: {}", action));
    prompt
}

fn joined_contents(items: &[&InputItem]) -> String {
    items
        .iter()
        .filter_map(|i| i.text_content())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn invocation_error(step: &str, error: anyhow::Error) -> EngineError {
    EngineError::Invocation {
        step: step.to_string(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{InputItem, InputKind};

    #[test]
    fn substitution_is_literal_and_prefers_longer_names() {
        let mut vars = HashMap::new();
        vars.insert("prev".to_string(), "42".to_string());
        vars.insert("preview".to_string(), "thumbnail".to_string());
        assert_eq!(
            substitute_variables("compare $prev with $preview", &vars),
            "compare 42 with thumbnail"
        );
        assert_eq!(substitute_variables("no vars here", &vars), "no vars here");
    }

    #[test]
    fn combined_prompt_numbers_files_and_appends_action() {
        let a = InputItem {
            kind: InputKind::Text {
                path: PathBuf::from("a.txt"),
                mime: "text/plain".to_string(),
                bytes: b"alpha".to_vec(),
            },
            metadata: HashMap::new(),
        };
        let b = InputItem {
            kind: InputKind::Text {
                path: PathBuf::from("b.txt"),
                mime: "text/plain".to_string(),
                bytes: b"beta".to_vec(),
            },
            metadata: HashMap::new(),
        };
        let prompt = build_combined_prompt(&[&a, &b], "summarize");
        assert!(prompt.starts_with("File 1 (a.txt):\nalpha\n\n"));
        assert!(prompt.contains("File 2 (b.txt):\nbeta\n\n"));
        assert!(prompt.ends_with("Action: summarize"));
    }

    #[test]
    fn output_paths_resolve_under_data_and_runtime_dirs() {
        let runner_options = RunOptions {
            verbose: false,
            server_data_dir: Some(PathBuf::from("/data")),
            runtime_dir: Some("run-1".to_string()),
        };
        assert_eq!(
            runner_options.output_base().unwrap(),
            PathBuf::from("/data/run-1")
        );

        let bare = RunOptions::default();
        assert!(bare.output_base().is_none());
    }
}
