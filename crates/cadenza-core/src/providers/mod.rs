//! Model-provider adapters.
//!
//! Every backend implements [`Provider`]; backends speaking the long-form
//! responses protocol additionally expose [`ResponsesProvider`] through
//! `as_responses`. Providers are configured once with a credential and then
//! shared read-only across workflow steps.

pub mod anthropic;
pub mod google;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

use anyhow::Result;
use std::path::Path;
use std::time::Duration;

/// Sentinel credential for locally hosted providers.
pub const LOCAL_CREDENTIAL: &str = "LOCAL";

/// Overall timeout for a standard provider call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Overall timeout for the long-running responses protocol.
pub const RESPONSES_TIMEOUT: Duration = Duration::from_secs(300);

/// A file handed to a provider alongside a prompt.
pub struct FileAttachment<'a> {
    pub path: &'a Path,
    pub mime: &'a str,
}

/// Request configuration for the responses protocol.
#[derive(Debug, Clone, Default)]
pub struct ResponsesConfig {
    pub model: String,
    pub input: String,
    pub instructions: Option<String>,
    pub tools: Option<serde_json::Value>,
    pub previous_response_id: Option<String>,
    pub max_output_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub response_format: Option<serde_json::Value>,
    pub stream: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ResponsesResult {
    pub text: String,
    pub response_id: Option<String>,
}

/// Lifecycle callbacks for a streamed responses call. Each delta is
/// delivered synchronously, so back-pressure is bounded by the consumer.
pub trait ResponsesStreamHandler {
    fn on_created(&mut self, response: &serde_json::Value);
    fn on_in_progress(&mut self, response: &serde_json::Value);
    fn on_output_item_added(&mut self, output_index: u64, item: &serde_json::Value);
    fn on_text_delta(&mut self, item_id: &str, output_index: u64, content_index: u64, delta: &str);
    fn on_completed(&mut self, response: &serde_json::Value);
    fn on_error(&mut self, message: &str);
}

/// Sub-capability for backends that implement the responses protocol.
pub trait ResponsesProvider {
    fn send_prompt_with_responses(&self, config: &ResponsesConfig) -> Result<ResponsesResult>;
    fn send_prompt_with_responses_stream(
        &self,
        config: &ResponsesConfig,
        handler: &mut dyn ResponsesStreamHandler,
    ) -> Result<()>;
}

/// The contract every model backend fulfils.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn supports_model(&self, model: &str) -> bool;
    fn configure(&mut self, credential: &str) -> Result<()>;
    fn send_prompt(&self, model: &str, prompt: &str) -> Result<String>;
    fn send_prompt_with_file(
        &self,
        model: &str,
        prompt: &str,
        file: &FileAttachment,
    ) -> Result<String>;
    fn set_verbose(&mut self, verbose: bool);

    /// Character budget advertised by the backend, if any. Prompts over the
    /// budget are rejected before any HTTP call.
    fn max_prompt_chars(&self) -> Option<usize> {
        None
    }

    fn is_local(&self) -> bool {
        false
    }

    fn as_responses(&self) -> Option<&dyn ResponsesProvider> {
        None
    }
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("name", &self.name()).finish()
    }
}

pub(crate) fn prefix_match(model: &str, prefixes: &[&str]) -> bool {
    let lowered = model.to_ascii_lowercase();
    prefixes.iter().any(|p| lowered.starts_with(p))
}

/// Inlines a text attachment into the prompt body.
pub(crate) fn embed_text_file(prompt: &str, path: &Path, content: &str) -> String {
    format!(
        "Content of file {}:\n{}\n\n{}",
        path.display(),
        content,
        prompt
    )
}

pub(crate) fn truncate_body(body: &str) -> String {
    body.chars().take(400).collect()
}
