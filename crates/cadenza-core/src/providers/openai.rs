//! OpenAI backend: chat completions plus the responses protocol with
//! server-sent event streaming.

use super::{
    embed_text_file, prefix_match, truncate_body, FileAttachment, Provider, ResponsesConfig,
    ResponsesProvider, ResponsesResult, ResponsesStreamHandler, DEFAULT_TIMEOUT,
    RESPONSES_TIMEOUT,
};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use std::fs;
use std::io::{BufRead, BufReader};

const CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const RESPONSES_URL: &str = "https://api.openai.com/v1/responses";

const MODEL_PREFIXES: &[&str] = &["gpt-", "o1", "o3", "o4", "chatgpt"];

pub struct OpenAiProvider {
    api_key: String,
    verbose: bool,
    client: reqwest::blocking::Client,
    responses_client: reqwest::blocking::Client,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        OpenAiProvider {
            api_key: String::new(),
            verbose: false,
            client: reqwest::blocking::Client::new(),
            responses_client: reqwest::blocking::Client::new(),
        }
    }

    fn chat(&self, model: &str, content: Value) -> Result<String> {
        let body = json!({
            "model": model,
            "messages": [{ "role": "user", "content": content }],
        });

        if self.verbose {
            eprintln!("[openai] POST {} model={}", CHAT_URL, model);
        }

        let response = self
            .client
            .post(CHAT_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .context("request to openai failed")?;
        let status = response.status();
        let text = response.text().context("failed to read openai response")?;
        if !status.is_success() {
            bail!("API error ({}): {}", status, truncate_body(&text));
        }

        let parsed: Value = serde_json::from_str(&text)?;
        parsed["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("openai returned no message content"))
    }

    fn responses_body(&self, config: &ResponsesConfig) -> Value {
        let mut body = json!({
            "model": config.model,
            "input": config.input,
        });
        if let Some(instructions) = &config.instructions {
            body["instructions"] = json!(instructions);
        }
        if let Some(tools) = &config.tools {
            body["tools"] = tools.clone();
        }
        if let Some(id) = &config.previous_response_id {
            body["previous_response_id"] = json!(id);
        }
        if let Some(max) = config.max_output_tokens {
            body["max_output_tokens"] = json!(max);
        }
        if let Some(t) = config.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = config.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(format) = &config.response_format {
            body["text"] = json!({ "format": format.clone() });
        }
        if config.stream {
            body["stream"] = json!(true);
        }
        body
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn supports_model(&self, model: &str) -> bool {
        prefix_match(model, MODEL_PREFIXES)
    }

    fn configure(&mut self, credential: &str) -> Result<()> {
        if credential.trim().is_empty() {
            bail!("openai requires a non-empty API key");
        }
        self.api_key = credential.to_string();
        self.client = reqwest::blocking::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        self.responses_client = reqwest::blocking::Client::builder()
            .timeout(RESPONSES_TIMEOUT)
            .build()?;
        Ok(())
    }

    fn send_prompt(&self, model: &str, prompt: &str) -> Result<String> {
        self.chat(model, json!(prompt))
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
                { "type": "text", "text": prompt },
                { "type": "image_url",
                  "image_url": { "url": format!("data:{};base64,{}", file.mime, encoded) } },
            ])
        } else if file.mime == "application/pdf" {
            let encoded = STANDARD.encode(&bytes);
            let filename = file
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "document.pdf".to_string());
            json!([
                { "type": "text", "text": prompt },
                { "type": "file",
                  "file": { "filename": filename,
                            "file_data": format!("data:application/pdf;base64,{}", encoded) } },
            ])
        } else {
            let text = String::from_utf8_lossy(&bytes);
            json!(embed_text_file(prompt, file.path, &text))
        };

        self.chat(model, content)
    }

    fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    fn as_responses(&self) -> Option<&dyn ResponsesProvider> {
        Some(self)
    }
}

impl ResponsesProvider for OpenAiProvider {
    fn send_prompt_with_responses(&self, config: &ResponsesConfig) -> Result<ResponsesResult> {
        let body = self.responses_body(config);
        if self.verbose {
            eprintln!("[openai] POST {} model={}", RESPONSES_URL, config.model);
        }

        let response = self
            .responses_client
            .post(RESPONSES_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .context("responses request to openai failed")?;
        let status = response.status();
        let text = response.text().context("failed to read openai response")?;
        if !status.is_success() {
            bail!("API error ({}): {}", status, truncate_body(&text));
        }

        let parsed: Value = serde_json::from_str(&text)?;
        let output = extract_response_text(&parsed)
            .ok_or_else(|| anyhow!("response contained no output text"))?;
        Ok(ResponsesResult {
            text: output,
            response_id: parsed["id"].as_str().map(|s| s.to_string()),
        })
    }

    fn send_prompt_with_responses_stream(
        &self,
        config: &ResponsesConfig,
        handler: &mut dyn ResponsesStreamHandler,
    ) -> Result<()> {
        let mut streamed = config.clone();
        streamed.stream = true;
        let body = self.responses_body(&streamed);

        let response = self
            .responses_client
            .post(RESPONSES_URL)
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .context("streaming responses request to openai failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            bail!("API error ({}): {}", status, truncate_body(&text));
        }

        consume_event_stream(BufReader::new(response), handler)
    }
}

/// Walks a responses payload for its output text: `output[]` items of type
/// `message` contribute each `output_text` child, `web_search_call` items
/// are skipped, and when nothing is found the whole tree is searched for a
/// `text` or `content` string.
pub fn extract_response_text(response: &Value) -> Option<String> {
    let mut text = String::new();
    if let Some(output) = response.get("output").and_then(|o| o.as_array()) {
        for item in output {
            match item.get("type").and_then(|t| t.as_str()) {
                Some("web_search_call") => continue,
                Some("message") => {
                    if let Some(content) = item.get("content").and_then(|c| c.as_array()) {
                        for part in content {
                            if part.get("type").and_then(|t| t.as_str()) == Some("output_text") {
                                if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                                    text.push_str(t);
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    if !text.is_empty() {
        return Some(text);
    }
    find_text_field(response)
}

fn find_text_field(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for key in ["text", "content"] {
                if let Some(Value::String(s)) = map.get(key) {
                    if !s.is_empty() {
                        return Some(s.clone());
                    }
                }
            }
            map.values().find_map(find_text_field)
        }
        Value::Array(items) => items.iter().find_map(find_text_field),
        _ => None,
    }
}

/// Parses a server-sent event stream, dispatching each event to the handler.
pub fn consume_event_stream<R: BufRead>(
    reader: R,
    handler: &mut dyn ResponsesStreamHandler,
) -> Result<()> {
    let mut event_name = String::new();
    let mut data = String::new();

    for line in reader.lines() {
        let line = line.context("error reading event stream")?;
        if line.is_empty() {
            if !data.is_empty() {
                dispatch_event(&event_name, &data, handler);
            }
            event_name.clear();
            data.clear();
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        }
    }
    if !data.is_empty() {
        dispatch_event(&event_name, &data, handler);
    }
    Ok(())
}

fn dispatch_event(event: &str, data: &str, handler: &mut dyn ResponsesStreamHandler) {
    if data == "[DONE]" {
        return;
    }
    let json: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            handler.on_error(&format!("malformed stream event: {}", e));
            return;
        }
    };
    match event {
        "response.created" => handler.on_created(&json["response"]),
        "response.in_progress" => handler.on_in_progress(&json["response"]),
        "response.output_item.added" => {
            handler.on_output_item_added(json["output_index"].as_u64().unwrap_or(0), &json["item"])
        }
        "response.output_text.delta" => handler.on_text_delta(
            json["item_id"].as_str().unwrap_or(""),
            json["output_index"].as_u64().unwrap_or(0),
            json["content_index"].as_u64().unwrap_or(0),
            json["delta"].as_str().unwrap_or(""),
        ),
        "response.completed" => handler.on_completed(&json["response"]),
        "error" => handler.on_error(json["message"].as_str().unwrap_or("stream error")),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_message_output_text() {
        let response = json!({
            "id": "resp_1",
            "output": [
                { "type": "web_search_call", "text": "ignored" },
                { "type": "message",
                  "content": [
                      { "type": "output_text", "text": "hello " },
                      { "type": "output_text", "text": "world" },
                  ] },
            ]
        });
        assert_eq!(extract_response_text(&response).unwrap(), "hello world");
    }

    #[test]
    fn falls_back_to_recursive_text_search() {
        let response = json!({
            "output": [],
            "nested": { "deep": [{ "text": "found it" }] }
        });
        assert_eq!(extract_response_text(&response).unwrap(), "found it");
    }

    #[test]
    fn returns_none_when_no_text_anywhere() {
        let response = json!({ "output": [], "count": 3 });
        assert!(extract_response_text(&response).is_none());
    }

    struct Recorder {
        events: Vec<String>,
        text: String,
    }

    impl ResponsesStreamHandler for Recorder {
        fn on_created(&mut self, _response: &Value) {
            self.events.push("created".to_string());
        }
        fn on_in_progress(&mut self, _response: &Value) {
            self.events.push("in_progress".to_string());
        }
        fn on_output_item_added(&mut self, _output_index: u64, _item: &Value) {
            self.events.push("item_added".to_string());
        }
        fn on_text_delta(&mut self, _id: &str, _out: u64, _content: u64, delta: &str) {
            self.events.push("delta".to_string());
            self.text.push_str(delta);
        }
        fn on_completed(&mut self, _response: &Value) {
            self.events.push("completed".to_string());
        }
        fn on_error(&mut self, message: &str) {
            self.events.push(format!("error:{}", message));
        }
    }

    #[test]
    fn consumes_event_stream_in_order() {
        let stream = "\
event: response.created\n\
data: {\"response\": {\"id\": \"resp_9\"}}\n\
\n\
event: response.output_text.delta\n\
data: {\"item_id\": \"m1\", \"output_index\": 0, \"content_index\": 0, \"delta\": \"4\"}\n\
\n\
event: response.output_text.delta\n\
data: {\"item_id\": \"m1\", \"output_index\": 0, \"content_index\": 0, \"delta\": \"2\"}\n\
\n\
event: response.completed\n\
data: {\"response\": {\"id\": \"resp_9\"}}\n\
\n";
        let mut recorder = Recorder {
            events: Vec::new(),
            text: String::new(),
        };
        consume_event_stream(stream.as_bytes(), &mut recorder).unwrap();
        assert_eq!(recorder.events, vec!["created", "delta", "delta", "completed"]);
        assert_eq!(recorder.text, "42");
    }

    #[test]
    fn model_prefixes() {
        let provider = OpenAiProvider::new();
        assert!(provider.supports_model("gpt-4o"));
        assert!(provider.supports_model("o3-mini"));
        assert!(!provider.supports_model("claude-sonnet-4"));
    }
}
