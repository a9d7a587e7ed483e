//! Server configuration.
//!
//! A TOML file provides the base; `ARGUS_`-prefixed environment variables
//! override individual keys, with `__` standing in for the section dot
//! (`ARGUS_LLM__PROVIDER=anthropic` overrides `llm.provider`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Which LLM backend drives the ReAct loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    /// OpenAI chat completions API.
    Openai,
    /// Anthropic messages API.
    #[default]
    Anthropic,
    /// Google Gemini generateContent API.
    Gemini,
}

/// `[llm]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider backend.
    pub provider: LlmProviderKind,
    /// Model identifier (empty = provider default).
    pub model: String,
    /// API key for the provider.
    pub api_key: String,
}

/// `[budget]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Token limit per rolling hour.
    pub hourly_limit: u64,
    /// Token limit per rolling day.
    pub daily_limit: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            hourly_limit: 100_000,
            daily_limit: 1_000_000,
        }
    }
}

/// `[collectors]` section (consumed by the out-of-process collectors;
/// served back through `GET /settings`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorsConfig {
    /// Host metric sampling interval in seconds.
    pub metrics_interval_s: u64,
    /// Log files the log collector tails.
    pub log_paths: Vec<PathBuf>,
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            metrics_interval_s: 15,
            log_paths: Vec::new(),
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
        }
    }
}

/// `[cors]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins; empty means same-origin only.
    pub origins: Vec<String>,
}

/// `[storage]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the telemetry and catalog databases.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Full server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// LLM provider settings.
    pub llm: LlmConfig,
    /// Budget limits.
    pub budget: BudgetConfig,
    /// Collector settings.
    pub collectors: CollectorsConfig,
    /// Bind address.
    pub server: ServerConfig,
    /// CORS policy.
    pub cors: CorsConfig,
    /// Storage locations.
    pub storage: StorageConfig,
    /// Externally reachable base URL, for links in notifications.
    pub public_url: Option<String>,
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Parser diagnostic.
        message: String,
    },
    /// An environment override holds an unusable value.
    #[error("invalid value for {key}: {message}")]
    InvalidOverride {
        /// The dotted key.
        key: String,
        /// What was wrong.
        message: String,
    },
}

impl Config {
    /// Load from a TOML file (missing file = defaults), then apply
    /// environment overrides from the current process environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            toml::from_str(&raw).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            Config::default()
        };
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Apply `ARGUS_SECTION__KEY` overrides from an iterator of env pairs.
    pub fn apply_env(
        &mut self,
        vars: impl Iterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        for (name, value) in vars {
            let Some(rest) = name.strip_prefix("ARGUS_") else {
                continue;
            };
            let key = rest.to_ascii_lowercase().replace("__", ".");
            self.set(&key, &value)?;
        }
        Ok(())
    }

    /// Set one dotted key from a string value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidOverride {
            key: key.to_string(),
            message: message.to_string(),
        };
        match key {
            "llm.provider" => {
                self.llm.provider = match value {
                    "openai" => LlmProviderKind::Openai,
                    "anthropic" => LlmProviderKind::Anthropic,
                    "gemini" => LlmProviderKind::Gemini,
                    _ => return Err(invalid("expected openai|anthropic|gemini")),
                }
            }
            "llm.model" => self.llm.model = value.to_string(),
            "llm.api_key" => self.llm.api_key = value.to_string(),
            "budget.hourly_limit" => {
                self.budget.hourly_limit = value.parse().map_err(|_| invalid("expected integer"))?
            }
            "budget.daily_limit" => {
                self.budget.daily_limit = value.parse().map_err(|_| invalid("expected integer"))?
            }
            "collectors.metrics_interval_s" => {
                self.collectors.metrics_interval_s =
                    value.parse().map_err(|_| invalid("expected integer"))?
            }
            "collectors.log_paths" => {
                self.collectors.log_paths = value.split(',').map(PathBuf::from).collect()
            }
            "server.host" => self.server.host = value.to_string(),
            "server.port" => {
                self.server.port = value.parse().map_err(|_| invalid("expected port number"))?
            }
            "cors.origins" => {
                self.cors.origins = value.split(',').map(str::to_string).collect()
            }
            "storage.data_dir" => self.storage.data_dir = PathBuf::from(value),
            "public_url" => self.public_url = Some(value.to_string()),
            _ => return Err(invalid("unrecognized key")),
        }
        Ok(())
    }

    /// Flat dot-notation view with secrets redacted, for `GET /settings`.
    pub fn redacted_view(&self) -> BTreeMap<String, String> {
        let mut view = BTreeMap::new();
        view.insert(
            "llm.provider".into(),
            match self.llm.provider {
                LlmProviderKind::Openai => "openai".into(),
                LlmProviderKind::Anthropic => "anthropic".into(),
                LlmProviderKind::Gemini => "gemini".into(),
            },
        );
        view.insert("llm.model".into(), self.llm.model.clone());
        view.insert(
            "llm.api_key".into(),
            if self.llm.api_key.is_empty() {
                String::new()
            } else {
                "********".into()
            },
        );
        view.insert(
            "budget.hourly_limit".into(),
            self.budget.hourly_limit.to_string(),
        );
        view.insert(
            "budget.daily_limit".into(),
            self.budget.daily_limit.to_string(),
        );
        view.insert(
            "collectors.metrics_interval_s".into(),
            self.collectors.metrics_interval_s.to_string(),
        );
        view.insert(
            "collectors.log_paths".into(),
            self.collectors
                .log_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
        view.insert("server.host".into(), self.server.host.clone());
        view.insert("server.port".into(), self.server.port.to_string());
        view.insert("cors.origins".into(), self.cors.origins.join(","));
        view.insert(
            "storage.data_dir".into(),
            self.storage.data_dir.display().to_string(),
        );
        view.insert(
            "public_url".into(),
            self.public_url.clone().unwrap_or_default(),
        );
        view
    }
}
