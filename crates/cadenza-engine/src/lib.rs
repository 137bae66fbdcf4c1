//! The cadenza workflow engine.
//!
//! A plan file declares named steps (each with `input`, `model`, `action`,
//! and `output`) plus parallel groups of steps. The engine validates the
//! plan, checks its file dependencies, then executes parallel groups on
//! worker threads followed by the sequential steps, carrying results
//! between steps through a last-output channel and named variables.

pub mod deps;
pub mod error;
pub mod executor;
pub mod input;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod registry;
pub mod responses;

pub use error::{EngineError, Result};
pub use executor::RunOptions;
pub use orchestrator::Orchestrator;
pub use plan::{parse_plan_file, parse_plan_str, Plan};
pub use progress::{ProgressSender, Update, UpdateKind};
