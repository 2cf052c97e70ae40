use crate::error::ConfigError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const HALYARD_DIR: &str = ".halyard";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub max_turns: usize,
    pub max_history: usize,
    pub model_timeout_secs: u64,
    pub configs_dir: PathBuf,
    pub scripts_dir: PathBuf,
    /// Program used to run scripts; empty runs the script file directly.
    pub script_interpreter: String,
    pub script_timeout_secs: u64,
    pub sessions_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            provider: "ollama".to_string(),
            api_key: String::new(),
            base_url: None,
            model: "llama3.2".to_string(),
            temperature: 0.0,
            max_turns: 20,
            max_history: 50,
            model_timeout_secs: 300,
            configs_dir: PathBuf::from("./configs"),
            scripts_dir: PathBuf::from("./scripts"),
            script_interpreter: "python3".to_string(),
            script_timeout_secs: 30,
            sessions_dir: get_halyard_dir().join("sessions"),
        }
    }
}

pub fn get_halyard_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(HALYARD_DIR)
}

pub fn get_config_path() -> PathBuf {
    get_halyard_dir().join("config.toml")
}

impl Config {
    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            load_config(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    pub fn model_timeout(&self) -> Option<Duration> {
        (self.model_timeout_secs > 0).then(|| Duration::from_secs(self.model_timeout_secs))
    }

    pub fn interpreter(&self) -> Option<&str> {
        let trimmed = self.script_interpreter.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    /// Startup validation. Nothing here is re-checked mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_turns == 0 {
            return Err(ConfigError::Invalid("max_turns must be at least 1".into()));
        }
        if self.max_history == 0 {
            return Err(ConfigError::Invalid("max_history must be at least 1".into()));
        }
        if self.script_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "script_timeout_secs must be at least 1".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature {} is outside 0.0..=2.0",
                self.temperature
            )));
        }
        if !self.configs_dir.is_dir() {
            return Err(ConfigError::MissingRoot {
                name: "configs",
                path: self.configs_dir.clone(),
            });
        }
        if !self.scripts_dir.is_dir() {
            return Err(ConfigError::MissingRoot {
                name: "scripts",
                path: self.scripts_dir.clone(),
            });
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config from {}", path.display()))?;

    Ok(config)
}
