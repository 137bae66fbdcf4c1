//! End-to-end engine tests against a registered mock provider.

use cadenza_core::environment::{Environment, Mode, ModelConfig, ProviderConfig};
use cadenza_core::providers::{FileAttachment, Provider};
use cadenza_engine::registry::{register_factory, ProviderFactory};
use cadenza_engine::{parse_plan_str, EngineError, Orchestrator, RunOptions};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

/// Echoes prompts back, failing on any file whose content contains "boom".
struct EchoProvider;

impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn supports_model(&self, model: &str) -> bool {
        model.starts_with("mock-")
    }
    fn configure(&mut self, _credential: &str) -> anyhow::Result<()> {
        Ok(())
    }
    fn send_prompt(&self, _model: &str, prompt: &str) -> anyhow::Result<String> {
        Ok(format!("echo[{}]", prompt))
    }
    fn send_prompt_with_file(
        &self,
        _model: &str,
        prompt: &str,
        file: &FileAttachment,
    ) -> anyhow::Result<String> {
        let content = String::from_utf8_lossy(&fs::read(file.path)?).to_string();
        if content.contains("boom") {
            anyhow::bail!("simulated failure reading {}", file.path.display());
        }
        Ok(format!("echo[{} :: {}]", prompt, content.trim()))
    }
    fn set_verbose(&mut self, _verbose: bool) {}
}

struct EchoFactory;

impl ProviderFactory for EchoFactory {
    fn name(&self) -> &'static str {
        "mock"
    }
    fn display_name(&self) -> &'static str {
        "Mock"
    }
    fn version(&self) -> &'static str {
        "test"
    }
    fn prefixes(&self) -> &'static [&'static str] {
        &["mock-"]
    }
    fn priority(&self) -> i32 {
        50
    }
    fn create(&self) -> Box<dyn Provider> {
        Box::new(EchoProvider)
    }
}

fn mock_environment() -> Environment {
    register_factory(Arc::new(EchoFactory));
    let mut env = Environment::default();
    env.providers.insert(
        "mock".to_string(),
        ProviderConfig {
            api_key: "test-key".to_string(),
            models: vec![
                ModelConfig {
                    name: "mock-echo".to_string(),
                    modes: vec![Mode::Multi],
                },
                ModelConfig {
                    name: "mock-text".to_string(),
                    modes: vec![Mode::Text],
                },
            ],
        },
    );
    env
}

#[test]
fn single_file_input_reaches_the_provider() {
    let env = mock_environment();
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("notes.txt"), "remember the milk").unwrap();

    let plan = parse_plan_str(&format!(
        r#"
summarize:
  input: {}/notes.txt
  model: mock-echo
  action: summarize
  output: STDOUT
"#,
        dir.path().display()
    ))
    .unwrap();

    let mut orchestrator = Orchestrator::new(plan, env, RunOptions::default());
    let result = orchestrator.execute().unwrap();
    assert!(result.contains("summarize"), "{}", result);
    assert!(result.contains("remember the milk"), "{}", result);
}

#[test]
fn individual_mode_accumulates_warnings_with_skip_errors() {
    let env = mock_environment();
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.md"), "alpha").unwrap();
    fs::write(dir.path().join("b.md"), "boom").unwrap();
    fs::write(dir.path().join("c.md"), "gamma").unwrap();

    let plan = parse_plan_str(&format!(
        r#"
digest:
  input: "{}/*.md"
  model: mock-echo
  action: summarize
  output: STDOUT
  batch_mode: individual
  skip_errors: true
"#,
        dir.path().display()
    ))
    .unwrap();

    let mut orchestrator = Orchestrator::new(plan, env, RunOptions::default());
    let result = orchestrator.execute().unwrap();

    assert!(result.contains("alpha"), "{}", result);
    assert!(result.contains("gamma"), "{}", result);
    assert!(result.contains("For this file: summarize"), "{}", result);
    assert!(result.contains("Warnings:"), "{}", result);
    assert!(result.contains("b.md"), "{}", result);
}

#[test]
fn individual_mode_fails_when_every_file_fails() {
    let env = mock_environment();
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.md"), "boom one").unwrap();
    fs::write(dir.path().join("b.md"), "boom two").unwrap();

    let plan = parse_plan_str(&format!(
        r#"
digest:
  input: "{}/*.md"
  model: mock-echo
  action: summarize
  output: STDOUT
  skip_errors: true
"#,
        dir.path().display()
    ))
    .unwrap();

    let mut orchestrator = Orchestrator::new(plan, env, RunOptions::default());
    let err = orchestrator.execute().unwrap_err();
    assert!(matches!(err, EngineError::Invocation { .. }), "{}", err);
    assert!(err.to_string().contains("all 2 files failed"), "{}", err);
}

#[test]
fn combined_mode_sends_one_numbered_prompt() {
    let env = mock_environment();
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("one.md"), "first").unwrap();
    fs::write(dir.path().join("two.md"), "second").unwrap();

    let plan = parse_plan_str(&format!(
        r#"
digest:
  input: "{}/*.md"
  model: mock-echo
  action: merge them
  output: STDOUT
  batch_mode: combined
"#,
        dir.path().display()
    ))
    .unwrap();

    let mut orchestrator = Orchestrator::new(plan, env, RunOptions::default());
    let result = orchestrator.execute().unwrap();
    assert!(result.contains("File 1 ("), "{}", result);
    assert!(result.contains("File 2 ("), "{}", result);
    assert!(result.contains("Action: merge them"), "{}", result);
    assert!(result.contains("first"), "{}", result);
    assert!(result.contains("second"), "{}", result);
}

#[test]
fn written_output_feeds_the_next_step() {
    let env = mock_environment();
    let dir = tempdir().unwrap();
    let options = RunOptions {
        verbose: false,
        server_data_dir: Some(dir.path().to_path_buf()),
        runtime_dir: None,
    };

    let plan = parse_plan_str(
        r#"
produce:
  input: NA
  model: NA
  action: raw material
  output: stage.txt
consume:
  input: stage.txt
  model: mock-echo
  action: refine
  output: STDOUT
"#,
    )
    .unwrap();

    let mut orchestrator = Orchestrator::new(plan, env, options);
    let result = orchestrator.execute().unwrap();
    assert!(result.contains("refine"), "{}", result);
    assert!(result.contains("raw material"), "{}", result);

    let staged = fs::read_to_string(dir.path().join("stage.txt")).unwrap();
    assert_eq!(staged, "raw material");
}

#[test]
fn image_input_without_vision_fails_before_invocation() {
    let env = mock_environment();
    let dir = tempdir().unwrap();
    let image_path = dir.path().join("shot.png");
    image::RgbaImage::from_pixel(2, 2, image::Rgba([0, 0, 0, 255]))
        .save(&image_path)
        .unwrap();

    let plan = parse_plan_str(&format!(
        r#"
inspect:
  input: {}
  model: mock-text
  action: describe
  output: STDOUT
"#,
        image_path.display()
    ))
    .unwrap();

    let mut orchestrator = Orchestrator::new(plan, env, RunOptions::default());
    let err = orchestrator.execute().unwrap_err();
    assert!(matches!(err, EngineError::ProviderSelection { .. }), "{}", err);
    let message = err.to_string();
    assert!(message.contains("mock-text"), "{}", message);
    assert!(message.contains("image"), "{}", message);
}

#[test]
fn unknown_model_is_a_selection_error() {
    let env = mock_environment();
    let plan = parse_plan_str(
        r#"
mystery:
  input: NA
  model: totally-unknown-model
  action: x
  output: STDOUT
"#,
    )
    .unwrap();

    let mut orchestrator = Orchestrator::new(plan, env, RunOptions::default());
    let err = orchestrator.execute().unwrap_err();
    assert!(matches!(err, EngineError::ProviderSelection { .. }), "{}", err);
    assert!(err.to_string().contains("totally-unknown-model"), "{}", err);
}
