//! Provider registry and model router.
//!
//! A process-wide registry maps provider names to factories; each factory
//! declares the model-name prefixes it owns and a priority. Routing a model
//! name is a scored lookup: every matching factory is collected, ordered by
//! priority descending with a lexical tiebreak, and the winner is
//! instantiated, checked, and configured. Configured instances are cached
//! per provider for the plan's lifetime under a read/write lock so parallel
//! steps share them race-free.

use crate::error::{EngineError, Result};
use crate::input::Capability;
use cadenza_core::environment::{Environment, Mode};
use cadenza_core::providers::{
    ollama, AnthropicProvider, GoogleProvider, OllamaProvider, OpenAiProvider, Provider,
    LOCAL_CREDENTIAL,
};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Once, RwLock};

pub trait ProviderFactory: Send + Sync {
    fn name(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn version(&self) -> &'static str;
    fn prefixes(&self) -> &'static [&'static str];
    fn priority(&self) -> i32;
    fn create(&self) -> Box<dyn Provider>;
}

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn ProviderFactory>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn register_factory(factory: Arc<dyn ProviderFactory>) {
    REGISTRY
        .write()
        .expect("provider registry poisoned")
        .insert(factory.name().to_string(), factory);
}

/// Scored lookup: all factories owning a matching prefix, best first.
pub fn factory_for_model(model: &str) -> Option<Arc<dyn ProviderFactory>> {
    let registry = REGISTRY.read().expect("provider registry poisoned");
    let lowered = model.to_ascii_lowercase();
    let mut matches: Vec<&Arc<dyn ProviderFactory>> = registry
        .values()
        .filter(|f| {
            f.prefixes()
                .iter()
                .any(|p| lowered.starts_with(&p.to_ascii_lowercase()))
        })
        .collect();
    matches.sort_by(|a, b| {
        b.priority()
            .cmp(&a.priority())
            .then_with(|| a.name().cmp(b.name()))
    });
    matches.first().map(|f| Arc::clone(f))
}

struct OpenAiFactory;

impl ProviderFactory for OpenAiFactory {
    fn name(&self) -> &'static str {
        "openai"
    }
    fn display_name(&self) -> &'static str {
        "OpenAI"
    }
    fn version(&self) -> &'static str {
        "v1"
    }
    fn prefixes(&self) -> &'static [&'static str] {
        &["gpt-", "o1", "o3", "o4", "chatgpt"]
    }
    fn priority(&self) -> i32 {
        10
    }
    fn create(&self) -> Box<dyn Provider> {
        Box::new(OpenAiProvider::new())
    }
}

struct AnthropicFactory;

impl ProviderFactory for AnthropicFactory {
    fn name(&self) -> &'static str {
        "anthropic"
    }
    fn display_name(&self) -> &'static str {
        "Anthropic"
    }
    fn version(&self) -> &'static str {
        "v1"
    }
    fn prefixes(&self) -> &'static [&'static str] {
        &["claude"]
    }
    fn priority(&self) -> i32 {
        10
    }
    fn create(&self) -> Box<dyn Provider> {
        Box::new(AnthropicProvider::new())
    }
}

struct GoogleFactory;

impl ProviderFactory for GoogleFactory {
    fn name(&self) -> &'static str {
        "google"
    }
    fn display_name(&self) -> &'static str {
        "Google"
    }
    fn version(&self) -> &'static str {
        "v1beta"
    }
    fn prefixes(&self) -> &'static [&'static str] {
        &["gemini"]
    }
    fn priority(&self) -> i32 {
        10
    }
    fn create(&self) -> Box<dyn Provider> {
        Box::new(GoogleProvider::new())
    }
}

struct OllamaFactory;

impl ProviderFactory for OllamaFactory {
    fn name(&self) -> &'static str {
        "ollama"
    }
    fn display_name(&self) -> &'static str {
        "Ollama"
    }
    fn version(&self) -> &'static str {
        "local"
    }
    fn prefixes(&self) -> &'static [&'static str] {
        &[
            "llama", "mistral", "mixtral", "qwen", "phi", "gemma", "codellama", "deepseek",
            "tinyllama", "vicuna",
        ]
    }
    fn priority(&self) -> i32 {
        0
    }
    fn create(&self) -> Box<dyn Provider> {
        Box::new(OllamaProvider::new())
    }
}

static STANDARD_FACTORIES: Once = Once::new();

pub fn ensure_standard_factories() {
    STANDARD_FACTORIES.call_once(|| {
        register_factory(Arc::new(OpenAiFactory));
        register_factory(Arc::new(AnthropicFactory));
        register_factory(Arc::new(GoogleFactory));
        register_factory(Arc::new(OllamaFactory));
    });
}

/// Per-plan router: resolves models to configured provider instances.
pub struct ModelRouter {
    env: Environment,
    verbose: bool,
    cache: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ModelRouter {
    pub fn new(env: Environment, verbose: bool) -> Self {
        ensure_standard_factories();
        ModelRouter {
            env,
            verbose,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn provider_for_step(
        &self,
        step: &str,
        model: &str,
        required: &[Capability],
    ) -> Result<Arc<dyn Provider>> {
        let factory = factory_for_model(model).ok_or_else(|| {
            selection_error(step, format!("no provider registered for model '{}'", model))
        })?;
        let provider_name = factory.name();

        let model_config = self.env.model_config(provider_name, model).ok_or_else(|| {
            selection_error(
                step,
                format!(
                    "model '{}' is not configured for provider '{}'",
                    model, provider_name
                ),
            )
        })?;

        for capability in required {
            let (mode, noun) = match capability {
                Capability::Text => (Mode::Text, "text"),
                Capability::Vision => (Mode::Vision, "image"),
                Capability::File => (Mode::File, "document"),
            };
            if !model_config.supports(mode) {
                return Err(selection_error(
                    step,
                    format!("model '{}' does not support {} inputs", model, noun),
                ));
            }
        }

        if let Some(provider) = self
            .cache
            .read()
            .expect("provider cache poisoned")
            .get(provider_name)
        {
            return Ok(Arc::clone(provider));
        }

        let mut provider = factory.create();

        if provider.is_local() {
            let installed = ollama::installed_models().map_err(|e| {
                selection_error(step, format!("local runtime check failed: {}", e))
            })?;
            let tag_present = installed
                .iter()
                .any(|t| t == model || t.starts_with(&format!("{}:", model)));
            if !tag_present {
                return Err(selection_error(
                    step,
                    format!(
                        "model '{}' is not installed in the local runtime; try `{}`",
                        model,
                        ollama::pull_hint(model)
                    ),
                ));
            }
            provider.configure(LOCAL_CREDENTIAL).map_err(|e| {
                EngineError::Credential(format!(
                    "failed to configure provider '{}': {}",
                    provider_name, e
                ))
            })?;
        } else {
            let config = self.env.provider_config(provider_name).ok_or_else(|| {
                EngineError::Credential(format!(
                    "provider '{}' is not configured in the environment file",
                    provider_name
                ))
            })?;
            if config.api_key.trim().is_empty() {
                return Err(EngineError::Credential(format!(
                    "provider '{}' has an empty API key",
                    provider_name
                )));
            }
            provider.configure(&config.api_key).map_err(|e| {
                EngineError::Credential(format!(
                    "failed to configure provider '{}': {}",
                    provider_name, e
                ))
            })?;
        }
        provider.set_verbose(self.verbose);

        let provider: Arc<dyn Provider> = Arc::from(provider);
        self.cache
            .write()
            .expect("provider cache poisoned")
            .insert(provider_name.to_string(), Arc::clone(&provider));
        Ok(provider)
    }
}

fn selection_error(step: &str, message: String) -> EngineError {
    EngineError::ProviderSelection {
        step: step.to_string(),
        message,
    }
}
