//! Locally hosted models through an ollama runtime.

use super::{
    embed_text_file, prefix_match, truncate_body, FileAttachment, Provider, DEFAULT_TIMEOUT,
};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::fs;

/// Environment variable overriding the runtime address.
pub const HOST_VAR: &str = "OLLAMA_HOST";

const DEFAULT_HOST: &str = "http://127.0.0.1:11434";

const MODEL_PREFIXES: &[&str] = &[
    "llama", "mistral", "mixtral", "qwen", "phi", "gemma", "codellama", "deepseek", "tinyllama",
    "vicuna",
];

#[derive(Deserialize, Debug)]
struct OllamaTag {
    name: String,
}

#[derive(Deserialize, Debug)]
struct OllamaTagsResponse {
    models: Vec<OllamaTag>,
}

pub fn runtime_host() -> String {
    env::var(HOST_VAR).unwrap_or_else(|_| DEFAULT_HOST.to_string())
}

/// Lists the model tags the local runtime has installed.
pub fn installed_models() -> Result<Vec<String>> {
    let url = format!("{}/api/tags", runtime_host());
    let response = reqwest::blocking::get(&url)
        .with_context(|| format!("local runtime not reachable at {}", url))?;
    if !response.status().is_success() {
        bail!("local runtime returned status {}", response.status());
    }
    let tags: OllamaTagsResponse = response.json()?;
    Ok(tags.models.into_iter().map(|t| t.name).collect())
}

/// The command that would install a missing tag.
pub fn pull_hint(model: &str) -> String {
    format!("ollama pull {}", model)
}

pub struct OllamaProvider {
    verbose: bool,
    client: reqwest::blocking::Client,
}

impl OllamaProvider {
    pub fn new() -> Self {
        OllamaProvider {
            verbose: false,
            client: reqwest::blocking::Client::new(),
        }
    }

    fn generate(&self, model: &str, prompt: &str, images: Option<Vec<String>>) -> Result<String> {
        let url = format!("{}/api/generate", runtime_host());
        let mut body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
        });
        if let Some(images) = images {
            body["images"] = json!(images);
        }

        if self.verbose {
            eprintln!("[ollama] POST {} model={}", url, model);
        }

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .context("request to local runtime failed")?;
        let status = response.status();
        let text = response.text().context("failed to read runtime response")?;
        if !status.is_success() {
            bail!("API error ({}): {}", status, truncate_body(&text));
        }

        let json: serde_json::Value = serde_json::from_str(&text)?;
        json["response"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("local runtime returned no response text"))
    }
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn supports_model(&self, model: &str) -> bool {
        prefix_match(model, MODEL_PREFIXES)
    }

    fn configure(&mut self, _credential: &str) -> Result<()> {
        // Local runtimes take the sentinel credential.
        self.client = reqwest::blocking::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(())
    }

    fn send_prompt(&self, model: &str, prompt: &str) -> Result<String> {
        self.generate(model, prompt, None)
    }

    fn send_prompt_with_file(
        &self,
        model: &str,
        prompt: &str,
        file: &FileAttachment,
    ) -> Result<String> {
        let bytes = fs::read(file.path)
            .with_context(|| format!("failed to read '{}'", file.path.display()))?;

        if file.mime.starts_with("image/") {
            let encoded = STANDARD.encode(&bytes);
            self.generate(model, prompt, Some(vec![encoded]))
        } else {
            let text = String::from_utf8_lossy(&bytes);
            self.generate(model, &embed_text_file(prompt, file.path, &text), None)
        }
    }

    fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    fn is_local(&self) -> bool {
        true
    }
}
