// ⚙️ Configuration
//
// Precedence, lowest to highest: built-in defaults, JSON config file,
// environment variables, command-line flags (applied by the binaries).

use crate::rules::FlagThresholds;
use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_DATABASE: &str = "LOAN_DESK_DATABASE";
pub const ENV_BIND: &str = "LOAN_DESK_BIND";

/// Upper bound for every hour-valued setting: ten years
pub const MAX_HOURS: i64 = 24 * 365 * 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file
    pub database_path: PathBuf,

    /// Address the HTTP server listens on
    pub bind_addr: String,

    /// Lifetime of issued auth tokens
    pub token_ttl_hours: i64,

    pub flag_rules: FlagThresholds,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: PathBuf::from("loan_desk.db"),
            bind_addr: "127.0.0.1:8000".to_string(),
            token_ttl_hours: 24,
            flag_rules: FlagThresholds::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file; missing keys keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Config::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, or the given file when present, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Apply overrides from an environment lookup
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db) = lookup(ENV_DATABASE).filter(|v| !v.is_empty()) {
            self.database_path = PathBuf::from(db);
        }
        if let Some(bind) = lookup(ENV_BIND).filter(|v| !v.is_empty()) {
            self.bind_addr = bind;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_HOURS).contains(&self.token_ttl_hours) {
            anyhow::bail!("token_ttl_hours must be between 1 and {}", MAX_HOURS);
        }
        if !(1..=MAX_HOURS).contains(&self.flag_rules.frequency_window_hours) {
            anyhow::bail!(
                "flag_rules.frequency_window_hours must be between 1 and {}",
                MAX_HOURS
            );
        }
        if self.flag_rules.max_income_multiple <= rust_decimal::Decimal::ZERO {
            anyhow::bail!("flag_rules.max_income_multiple must be positive");
        }
        Ok(())
    }
}
