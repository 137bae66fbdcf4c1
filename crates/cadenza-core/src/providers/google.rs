//! Google backend speaking the generateContent protocol.

use super::{
    embed_text_file, prefix_match, truncate_body, FileAttachment, Provider, DEFAULT_TIMEOUT,
};
use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use std::fs;

const MODEL_PREFIXES: &[&str] = &["gemini"];

const MAX_PROMPT_CHARS: usize = 4_000_000;

pub struct GoogleProvider {
    api_key: String,
    verbose: bool,
    client: reqwest::blocking::Client,
}

impl GoogleProvider {
    pub fn new() -> Self {
        GoogleProvider {
            api_key: String::new(),
            verbose: false,
            client: reqwest::blocking::Client::new(),
        }
    }

    fn generate(&self, model: &str, parts: Vec<Value>) -> Result<String> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            model
        );
        let body = json!({ "contents": [{ "parts": parts }] });

        if self.verbose {
            eprintln!("[google] POST {}", url);
        }

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .context("request to google failed")?;
        let status = response.status();
        let text = response.text().context("failed to read google response")?;
        if !status.is_success() {
            bail!("API error ({}): {}", status, truncate_body(&text));
        }

        let json: Value = serde_json::from_str(&text)?;
        let mut collected = String::new();
        if let Some(candidates) = json.get("candidates").and_then(|c| c.as_array()) {
            for candidate in candidates {
                if let Some(parts) = candidate
                    .get("content")
                    .and_then(|c| c.get("parts"))
                    .and_then(|p| p.as_array())
                {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                            collected.push_str(text);
                        }
                    }
                }
            }
        }
        if collected.is_empty() {
            bail!("google returned no text candidates");
        }
        Ok(collected)
    }
}

impl Default for GoogleProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    fn supports_model(&self, model: &str) -> bool {
        prefix_match(model, MODEL_PREFIXES)
    }

    fn configure(&mut self, credential: &str) -> Result<()> {
        if credential.trim().is_empty() {
            bail!("google requires a non-empty API key");
        }
        self.api_key = credential.to_string();
        self.client = reqwest::blocking::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(())
    }

    fn send_prompt(&self, model: &str, prompt: &str) -> Result<String> {
        self.generate(model, vec![json!({ "text": prompt })])
    }

    fn send_prompt_with_file(
        &self,
        model: &str,
        prompt: &str,
        file: &FileAttachment,
    ) -> Result<String> {
        let bytes = fs::read(file.path)
            .with_context(|| format!("failed to read '{}'", file.path.display()))?;

        let parts = if file.mime.starts_with("image/") || file.mime == "application/pdf" {
            let encoded = STANDARD.encode(&bytes);
            vec![
                json!({ "text": prompt }),
                json!({ "inline_data": { "mime_type": file.mime, "data": encoded } }),
            ]
        } else {
            let text = String::from_utf8_lossy(&bytes);
            vec![json!({ "text": embed_text_file(prompt, file.path, &text) })]
        };

        self.generate(model, parts)
    }

    fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    fn max_prompt_chars(&self) -> Option<usize> {
        Some(MAX_PROMPT_CHARS)
    }
}
