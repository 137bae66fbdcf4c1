//! Anthropic backend speaking the messages API.

use super::{
    embed_text_file, prefix_match, truncate_body, FileAttachment, Provider, DEFAULT_TIMEOUT,
};
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use std::fs;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

const MODEL_PREFIXES: &[&str] = &["claude"];

const MAX_PROMPT_CHARS: usize = 800_000;
const MAX_OUTPUT_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    api_key: String,
    verbose: bool,
    client: reqwest::blocking::Client,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        AnthropicProvider {
            api_key: String::new(),
            verbose: false,
            client: reqwest::blocking::Client::new(),
        }
    }

    fn messages(&self, model: &str, content: Value) -> Result<String> {
        let body = json!({
            "model": model,
            "max_tokens": MAX_OUTPUT_TOKENS,
            "messages": [{ "role": "user", "content": content }],
        });

        if self.verbose {
            eprintln!("[anthropic] POST {} model={}", MESSAGES_URL, model);
        }

        let response = self
            .client
            .post(MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .context("request to anthropic failed")?;
        let status = response.status();
        let text = response
            .text()
            .context("failed to read anthropic response")?;
        if !status.is_success() {
            bail!("API error ({}): {}", status, truncate_body(&text));
        }

        let json: Value = serde_json::from_str(&text)?;
        let mut collected = String::new();
        if let Some(blocks) = json.get("content").and_then(|c| c.as_array()) {
            for block in blocks {
                if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        collected.push_str(text);
                    }
                }
            }
        }
        if collected.is_empty() {
            bail!("anthropic returned no text content");
        }
        Ok(collected)
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn supports_model(&self, model: &str) -> bool {
        prefix_match(model, MODEL_PREFIXES)
    }

    fn configure(&mut self, credential: &str) -> Result<()> {
        if credential.trim().is_empty() {
            bail!("anthropic requires a non-empty API key");
        }
        self.api_key = credential.to_string();
        self.client = reqwest::blocking::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(())
    }

    fn send_prompt(&self, model: &str, prompt: &str) -> Result<String> {
        self.messages(model, json!(prompt))
    }

    fn send_prompt_with_file(
        &self,
        model: &str,
        prompt: &str,
        file: &FileAttachment,
    ) -> Result<String> {
        let bytes = fs::read(file.path)
            .with_context(|| format!("failed to read '{}'", file.path.display()))?;

        let content = if file.mime.starts_with("image/") {
            let encoded = STANDARD.encode(&bytes);
            json!([
                { "type": "image",
                  "source": { "type": "base64", "media_type": file.mime, "data": encoded } },
                { "type": "text", "text": prompt },
            ])
        } else if file.mime == "application/pdf" {
            let encoded = STANDARD.encode(&bytes);
            json!([
                { "type": "document",
                  "source": { "type": "base64", "media_type": "application/pdf", "data": encoded } },
                { "type": "text", "text": prompt },
            ])
        } else {
            let text = String::from_utf8_lossy(&bytes);
            json!(embed_text_file(prompt, file.path, &text))
        };

        self.messages(model, content)
    }

    fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    fn max_prompt_chars(&self) -> Option<usize> {
        Some(MAX_PROMPT_CHARS)
    }
}
