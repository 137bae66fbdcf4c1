//! Data structures for real-time progress updates.

use serde::Serialize;

/// Millisecond counters recorded for every executed step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceMetrics {
    pub input_ms: u64,
    pub model_ms: u64,
    pub action_ms: u64,
    pub output_ms: u64,
    pub total_ms: u64,
}

impl PerformanceMetrics {
    pub fn summary(&self) -> String {
        format!(
            "input {} ms, model {} ms, action {} ms, output {} ms, total {} ms",
            self.input_ms, self.model_ms, self.action_ms, self.output_ms, self.total_ms
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Spinner,
    Step,
    Complete,
    Error,
    Output,
    ParallelStep,
}

/// One progress event. Absence of a sink means human output goes to the
/// process's standard streams instead.
#[derive(Debug, Clone)]
pub struct Update {
    pub kind: UpdateKind,
    pub message: String,
    pub step_name: Option<String>,
    pub model: Option<String>,
    pub action: Option<String>,
    pub instructions: Option<String>,
    pub is_parallel: bool,
    pub parallel_id: Option<String>,
    pub metrics: Option<PerformanceMetrics>,
    pub stdout: Option<String>,
}

pub type ProgressSender = crossbeam_channel::Sender<Update>;

impl Update {
    fn base(kind: UpdateKind, message: String) -> Self {
        Update {
            kind,
            message,
            step_name: None,
            model: None,
            action: None,
            instructions: None,
            is_parallel: false,
            parallel_id: None,
            metrics: None,
            stdout: None,
        }
    }

    pub fn spinner(message: &str) -> Self {
        Self::base(UpdateKind::Spinner, message.to_string())
    }

    pub fn step(
        name: &str,
        model: Option<&str>,
        action: &str,
        instructions: Option<&str>,
        group: Option<&str>,
    ) -> Self {
        let kind = if group.is_some() {
            UpdateKind::ParallelStep
        } else {
            UpdateKind::Step
        };
        let mut update = Self::base(kind, format!("running step '{}'", name));
        update.step_name = Some(name.to_string());
        update.model = model.map(|m| m.to_string());
        update.action = Some(action.to_string());
        update.instructions = instructions.map(|i| i.to_string());
        update.is_parallel = group.is_some();
        update.parallel_id = group.map(|g| g.to_string());
        update
    }

    pub fn complete(name: &str, metrics: PerformanceMetrics, group: Option<&str>) -> Self {
        let mut update = Self::base(UpdateKind::Complete, format!("step '{}' complete", name));
        update.step_name = Some(name.to_string());
        update.is_parallel = group.is_some();
        update.parallel_id = group.map(|g| g.to_string());
        update.metrics = Some(metrics);
        update
    }

    pub fn error(message: &str) -> Self {
        Self::base(UpdateKind::Error, message.to_string())
    }

    pub fn output(name: &str, model: &str, text: &str) -> Self {
        let mut update = Self::base(UpdateKind::Output, format!("output from step '{}'", name));
        update.step_name = Some(name.to_string());
        update.model = Some(model.to_string());
        update.stdout = Some(text.to_string());
        update
    }
}
