//! Core logic for loading the environment file.
//!
//! The environment file names every provider the engine may talk to, the
//! models each one serves (with their capability modes), and the databases
//! reachable from workflow steps.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

/// Environment variable overriding the environment file location.
pub const ENV_FILE_VAR: &str = "CADENZA_ENV";

/// Default environment file name, resolved against the working directory.
pub const DEFAULT_ENV_FILE: &str = "cadenza.env.yaml";

/// Capability modes a configured model may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Text,
    Vision,
    File,
    Multi,
}

impl Mode {
    /// `multi` covers every other mode.
    pub fn covers(self, required: Mode) -> bool {
        self == Mode::Multi || self == required
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub modes: Vec<Mode>,
}

impl ModelConfig {
    pub fn supports(&self, required: Mode) -> bool {
        self.modes.iter().any(|m| m.covers(required))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, rename = "apiKey")]
    pub api_key: String,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

/// The parsed environment file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub databases: HashMap<String, DatabaseConfig>,
}

impl Environment {
    /// Loads the environment file from `path`, `$CADENZA_ENV`, or the
    /// default location, in that order. A missing default file yields an
    /// empty environment; an explicitly named file must exist.
    pub fn load(path: Option<&Path>) -> io::Result<Self> {
        let (file, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match env::var(ENV_FILE_VAR) {
                Ok(p) if !p.trim().is_empty() => (PathBuf::from(p), true),
                _ => (PathBuf::from(DEFAULT_ENV_FILE), false),
            },
        };

        if !file.exists() {
            if explicit {
                return Err(io::Error::new(
                    ErrorKind::NotFound,
                    format!("environment file '{}' not found", file.display()),
                ));
            }
            return Ok(Environment::default());
        }

        let content = fs::read_to_string(&file)?;
        serde_yaml::from_str(&content).map_err(|e| {
            io::Error::new(
                ErrorKind::InvalidData,
                format!("invalid environment file '{}': {}", file.display(), e),
            )
        })
    }

    pub fn provider_config(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn model_config(&self, provider: &str, model: &str) -> Option<&ModelConfig> {
        self.providers
            .get(provider)
            .and_then(|p| p.models.iter().find(|m| m.name == model))
    }

    pub fn database_path(&self, name: &str) -> Option<&Path> {
        self.databases.get(name).map(|d| d.path.as_path())
    }
}
