//! The engine's error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("plan validation failed: {0}")]
    PlanValidation(String),

    #[error("dependency validation failed: {0}")]
    DependencyValidation(String),

    #[error("input resolution failed for step '{step}': {message}")]
    InputResolution { step: String, message: String },

    #[error("provider selection failed for step '{step}': {message}")]
    ProviderSelection { step: String, message: String },

    #[error("missing credential: {0}")]
    Credential(String),

    #[error("invocation failed for step '{step}': {message}")]
    Invocation { step: String, message: String },

    #[error("output routing failed for step '{step}': {message}")]
    OutputRouting { step: String, message: String },

    #[error("execution cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
