//! The specialized responses-protocol executor.
//!
//! Bypasses the generic payload shapes: the step's resolved inputs and
//! action become the request input, `instructions` rides separately, and
//! the optional tool/response-format knobs pass straight through. With
//! `stream: true` the provider feeds an accumulating handler; otherwise
//! the provider returns the extracted text directly. Either way a response
//! identifier, when present, lands in the variable environment as
//! `<stepname>.response_id`.

use crate::error::{EngineError, Result};
use crate::executor::substitute_variables;
use crate::input::InputItem;
use crate::plan::Step;
use cadenza_core::providers::{
    openai, Provider, ResponsesConfig, ResponsesStreamHandler,
};
use serde_json::Value;
use std::collections::HashMap;

/// Prompt used when a responses step declares no input or action.
pub const INSTRUCTIONS_SENTINEL: &str = "Please follow the instructions.";

pub fn run_responses_step(
    step: &Step,
    items: &[InputItem],
    action: &str,
    vars: &mut HashMap<String, String>,
    provider: &dyn Provider,
    model: &str,
) -> Result<String> {
    let responses = provider.as_responses().ok_or_else(|| {
        EngineError::ProviderSelection {
            step: step.name.clone(),
            message: format!(
                "provider '{}' does not support the responses protocol",
                provider.name()
            ),
        }
    })?;

    let mut input_text = String::new();
    for item in items {
        if let Some(text) = item.text_content() {
            if !input_text.is_empty() {
                input_text.push_str("\n\n");
            }
            input_text.push_str(&text);
        }
    }
    if !action.is_empty() {
        if !input_text.is_empty() {
            input_text.push_str("\n\n");
        }
        input_text.push_str(action);
    }
    if input_text.trim().is_empty() {
        input_text = INSTRUCTIONS_SENTINEL.to_string();
    }

    let config = ResponsesConfig {
        model: model.to_string(),
        input: input_text,
        instructions: step.config.instructions.clone(),
        tools: step.config.tools.clone(),
        previous_response_id: step
            .config
            .previous_response_id
            .as_ref()
            .map(|id| substitute_variables(id, vars)),
        max_output_tokens: step.config.max_output_tokens,
        temperature: step.config.temperature,
        top_p: step.config.top_p,
        response_format: step.config.response_format.clone(),
        stream: step.config.stream.unwrap_or(false),
    };

    let (text, response_id) = if config.stream {
        let mut handler = AccumulatingHandler::new();
        responses
            .send_prompt_with_responses_stream(&config, &mut handler)
            .map_err(|e| EngineError::Invocation {
                step: step.name.clone(),
                message: e.to_string(),
            })?;
        handler.finish().map_err(|message| EngineError::Invocation {
            step: step.name.clone(),
            message,
        })?
    } else {
        let result = responses
            .send_prompt_with_responses(&config)
            .map_err(|e| EngineError::Invocation {
                step: step.name.clone(),
                message: e.to_string(),
            })?;
        (result.text, result.response_id)
    };

    if let Some(id) = response_id {
        vars.insert(format!("{}.response_id", step.name), id);
    }
    Ok(text)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Citation {
    pub title: String,
    pub url: String,
}

/// Accumulates streamed deltas, preferring the completed response's
/// re-extracted text when one arrives, and renders URL citations as a
/// trailing numbered references section.
#[derive(Default)]
pub struct AccumulatingHandler {
    accumulated: String,
    completed_text: Option<String>,
    citations: Vec<Citation>,
    response_id: Option<String>,
    error: Option<String>,
}

impl AccumulatingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> std::result::Result<(String, Option<String>), String> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let mut text = self.completed_text.unwrap_or(self.accumulated);
        if !self.citations.is_empty() {
            text.push_str("\n\n## References\n");
            for (index, citation) in self.citations.iter().enumerate() {
                let label = if citation.title.is_empty() {
                    &citation.url
                } else {
                    &citation.title
                };
                text.push_str(&format!("{}. {} - {}\n", index + 1, label, citation.url));
            }
        }
        Ok((text, self.response_id))
    }

    fn collect_citations(&mut self, response: &Value) {
        let Some(output) = response.get("output").and_then(|o| o.as_array()) else {
            return;
        };
        for item in output {
            if item.get("type").and_then(|t| t.as_str()) != Some("message") {
                continue;
            }
            let Some(content) = item.get("content").and_then(|c| c.as_array()) else {
                continue;
            };
            for part in content {
                let Some(annotations) = part.get("annotations").and_then(|a| a.as_array()) else {
                    continue;
                };
                for annotation in annotations {
                    if annotation.get("type").and_then(|t| t.as_str()) != Some("url_citation") {
                        continue;
                    }
                    let url = annotation
                        .get("url")
                        .and_then(|u| u.as_str())
                        .unwrap_or("")
                        .to_string();
                    if url.is_empty() || self.citations.iter().any(|c| c.url == url) {
                        continue;
                    }
                    let title = annotation
                        .get("title")
                        .and_then(|t| t.as_str())
                        .unwrap_or("")
                        .to_string();
                    self.citations.push(Citation { title, url });
                }
            }
        }
    }
}

impl ResponsesStreamHandler for AccumulatingHandler {
    fn on_created(&mut self, response: &Value) {
        if let Some(id) = response.get("id").and_then(|i| i.as_str()) {
            self.response_id = Some(id.to_string());
        }
    }

    fn on_in_progress(&mut self, _response: &Value) {}

    fn on_output_item_added(&mut self, _output_index: u64, _item: &Value) {}

    fn on_text_delta(&mut self, _item_id: &str, _output_index: u64, _content_index: u64, delta: &str) {
        self.accumulated.push_str(delta);
    }

    fn on_completed(&mut self, response: &Value) {
        if let Some(id) = response.get("id").and_then(|i| i.as_str()) {
            self.response_id = Some(id.to_string());
        }
        if let Some(text) = openai::extract_response_text(response) {
            if !text.is_empty() {
                self.completed_text = Some(text);
            }
        }
        self.collect_citations(response);
    }

    fn on_error(&mut self, message: &str) {
        self.error = Some(message.to_string());
    }
}
