//! The orchestrator: drives a validated plan end to end.
//!
//! Phase one runs each parallel group on worker threads, one per step,
//! collecting results and errors over channels behind a join barrier.
//! Phase two walks the sequential steps in declaration order, threading
//! the last output and the variable environment from step to step. One
//! cancellation token covers the whole run; panics anywhere are converted
//! into a structured internal error.

use crate::deps;
use crate::error::{EngineError, Result};
use crate::executor::{RunOptions, StepRunner};
use crate::input::Collaborators;
use crate::plan::{self, ParallelGroup, Plan};
use crate::progress::{ProgressSender, Update};
use crate::registry::ModelRouter;
use cadenza_core::environment::Environment;
use cadenza_core::logging::RunLogger;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

pub struct Orchestrator {
    plan: Plan,
    env: Environment,
    options: RunOptions,
    progress: Option<ProgressSender>,
    cancel: Arc<AtomicBool>,
    variables: HashMap<String, String>,
    last_output: Option<String>,
    parallel_results: HashMap<String, String>,
}

impl Orchestrator {
    pub fn new(plan: Plan, env: Environment, options: RunOptions) -> Self {
        Orchestrator {
            plan,
            env,
            options,
            progress: None,
            cancel: Arc::new(AtomicBool::new(false)),
            variables: HashMap::new(),
            last_output: None,
            parallel_results: HashMap::new(),
        }
    }

    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Token for caller-side cancellation.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    /// Outputs collected from the parallel phase, keyed by step name.
    pub fn parallel_results(&self) -> &HashMap<String, String> {
        &self.parallel_results
    }

    /// Executes the plan and returns the final last-output string.
    pub fn execute(&mut self) -> Result<String> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute_inner()));
        match result {
            Ok(outcome) => {
                // Step failures are reported where they happen; plan-level
                // validation failures surface here.
                if let Err(error) = &outcome {
                    if matches!(
                        error,
                        EngineError::PlanValidation(_) | EngineError::DependencyValidation(_)
                    ) {
                        self.emit(Update::error(&error.to_string()));
                    }
                }
                outcome
            }
            Err(payload) => {
                let message = panic_message(payload);
                self.emit(Update::error(&format!("internal error: {}", message)));
                Err(EngineError::Internal(message))
            }
        }
    }

    fn execute_inner(&mut self) -> Result<String> {
        plan::validate_plan(&self.plan)?;
        let report = Arc::new(deps::analyze(&self.plan)?);

        let mut logger =
            RunLogger::new(self.options.server_data_dir.as_deref(), self.options.verbose)
                .unwrap_or_else(|_| RunLogger::disabled());
        let run_id = generate_run_id();
        logger.log(&format!(
            "starting {}: {} parallel group(s), {} sequential step(s)",
            run_id,
            self.plan.parallel_groups.len(),
            self.plan.steps.len()
        ));
        if self.options.verbose {
            self.emit(Update::spinner(&format!("starting {}", run_id)));
        }

        let runner = StepRunner {
            report,
            router: Arc::new(ModelRouter::new(self.env.clone(), self.options.verbose)),
            collaborators: Arc::new(Collaborators::standard(&self.env)),
            options: self.options.clone(),
            progress: self.progress.clone(),
            cancel: Arc::clone(&self.cancel),
        };

        let groups = self.plan.parallel_groups.clone();
        for group in &groups {
            logger.log(&format!("parallel group '{}' starting", group.name));
            self.run_group(group, &runner, &mut logger)?;
            logger.log(&format!("parallel group '{}' completed", group.name));
        }

        let steps = self.plan.steps.clone();
        for step in &steps {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(EngineError::Cancelled);
            }
            logger.log(&format!("step '{}' starting", step.name));
            match runner.run_step(step, self.last_output.as_deref(), &mut self.variables, None) {
                Ok(outcome) => {
                    logger.log(&format!(
                        "step '{}' completed ({})",
                        step.name,
                        outcome.metrics.summary()
                    ));
                    self.last_output = Some(outcome.text);
                }
                Err(error) => {
                    logger.log(&format!("step '{}' failed: {}", step.name, error));
                    self.emit(Update::error(&format!(
                        "step '{}' failed: {}",
                        step.name, error
                    )));
                    return Err(error);
                }
            }
        }

        logger.log(&format!("{} finished", run_id));
        Ok(self.last_output.clone().unwrap_or_default())
    }

    fn run_group(
        &mut self,
        group: &ParallelGroup,
        runner: &StepRunner,
        logger: &mut RunLogger,
    ) -> Result<()> {
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let (error_tx, error_rx) = crossbeam_channel::unbounded::<(String, EngineError)>();
        let mut handles = Vec::new();

        for step in &group.steps {
            let step = step.clone();
            let group_name = group.name.clone();
            let worker = runner.clone();
            // Parallel siblings read a snapshot; bindings are rejected at
            // validation so writes cannot leak between workers.
            let variables = self.variables.clone();
            let result_tx = result_tx.clone();
            let error_tx = error_tx.clone();

            handles.push(thread::spawn(move || {
                let mut variables = variables;
                match worker.run_step(&step, None, &mut variables, Some(&group_name)) {
                    Ok(outcome) => {
                        let _ = result_tx.send((step.name.clone(), outcome.text));
                    }
                    Err(error) => {
                        // First failure cancels the rest of the group.
                        worker.cancel.store(true, Ordering::SeqCst);
                        let _ = error_tx.send((step.name.clone(), error));
                    }
                }
            }));
        }
        drop(result_tx);
        drop(error_tx);

        let mut panicked = false;
        for handle in handles {
            if handle.join().is_err() {
                panicked = true;
                self.cancel.store(true, Ordering::SeqCst);
            }
        }

        for (name, output) in result_rx.iter() {
            logger.log(&format!("parallel step '{}' completed", name));
            self.parallel_results.insert(name, output);
        }

        if let Some((name, error)) = error_rx.iter().next() {
            logger.log(&format!("parallel step '{}' failed: {}", name, error));
            self.emit(Update::error(&format!(
                "parallel step '{}' failed: {}",
                name, error
            )));
            return Err(error);
        }
        if panicked {
            return Err(EngineError::Internal(
                "a parallel step thread panicked".to_string(),
            ));
        }
        if self.cancel.load(Ordering::SeqCst) {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    fn emit(&self, update: Update) {
        if let Some(sender) = &self.progress {
            if sender.send(update).is_err() {
                self.cancel.store(true, Ordering::SeqCst);
            }
        }
    }
}

fn generate_run_id() -> String {
    let random: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("run-{}", random.to_lowercase())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "step panicked".to_string()
    }
}
