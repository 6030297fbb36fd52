//! Engine configuration.
//!
//! Defaults, then an optional TOML file, then environment overrides.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context_assembler::{ContextConfig, MeterKind};
use crate::error::ConfigError;

pub const ENV_BASE_URL: &str = "NARRATOR_BASE_URL";
pub const ENV_MODEL: &str = "NARRATOR_MODEL";
pub const ENV_API_KEY: &str = "NARRATOR_API_KEY";
pub const ENV_DATA_DIR: &str = "NARRATOR_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageSettings,
    pub context: ContextSettings,
    pub turn: TurnSettings,
    pub narrator: NarratorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory holding one `<session-id>.json` per session.
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/sessions"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Closed scenes, newest first, that keep every event.
    pub recent_scenes: usize,
    pub budget: usize,
    pub meter: MeterKind,
}

impl Default for ContextSettings {
    fn default() -> Self {
        let defaults = ContextConfig::default();
        Self {
            recent_scenes: defaults.recent_scenes,
            budget: defaults.budget,
            meter: MeterKind::default(),
        }
    }
}

impl ContextSettings {
    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            recent_scenes: self.recent_scenes,
            budget: self.budget,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnSettings {
    pub max_tool_iterations: u32,
    pub model_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    /// Attempts after the first failed model call.
    pub model_retries: u32,
    pub backoff_base_ms: u64,
    pub narrator_actor: String,
    pub player_actor: String,
    /// Open a scene when a turn starts with none active.
    pub auto_open_scene: bool,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            max_tool_iterations: 5,
            model_timeout_secs: 60,
            tool_timeout_secs: 10,
            model_retries: 3,
            backoff_base_ms: 500,
            narrator_actor: "DM".to_string(),
            player_actor: "Player".to_string(),
            auto_open_scene: true,
        }
    }
}

impl TurnSettings {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NarratorSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    /// Key set through `NARRATOR_API_KEY`; never read from or written to files.
    #[serde(skip)]
    pub api_key_override: Option<String>,
}

impl Default for NarratorSettings {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "openai/gpt-4o-mini".to_string(),
            temperature: Some(0.8),
            max_tokens: Some(1024),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            api_key_override: None,
        }
    }
}

impl NarratorSettings {
    /// The API key, from the override or the configured variable.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_override
            .clone()
            .or_else(|| env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

impl EngineConfig {
    /// Load from `path` if given and present, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Apply overrides from `lookup`, normally the process environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup(ENV_BASE_URL) {
            self.narrator.base_url = v;
        }
        if let Some(v) = lookup(ENV_MODEL) {
            self.narrator.model = v;
        }
        if let Some(v) = lookup(ENV_API_KEY) {
            self.narrator.api_key_override = Some(v);
        }
        if let Some(v) = lookup(ENV_DATA_DIR) {
            self.storage.data_dir = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.turn.max_tool_iterations == 0 {
            return Err(ConfigError::Invalid(
                "turn.max_tool_iterations must be at least 1".into(),
            ));
        }
        if self.turn.model_timeout_secs == 0 || self.turn.tool_timeout_secs == 0 {
            return Err(ConfigError::Invalid("turn timeouts must be positive".into()));
        }
        if self.narrator.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("narrator.base_url is empty".into()));
        }
        Ok(())
    }
}
