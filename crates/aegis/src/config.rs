// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Config loader: a TOML file on disk, overlaid by recognized `AEGIS_*`
//! environment variables, validated into a typed model.
//!
//! Grounded on the teacher's `env = "COOP_..."` overlay-over-typed-struct
//! pattern in `config.rs`, generalized from clap's per-field env attribute
//! to an explicit post-parse overlay step since the base format here is a
//! TOML file, not CLI flags.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::detector::DEFAULT_THRESHOLD;

/// Directory name under the user's home holding config, database, audit
/// log, and PID file — all owner-only permissions.
pub const DATA_DIR_NAME: &str = ".aegis";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub allowed_users: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PromptsConfig {
    pub timeout_seconds: u64,
    pub stuck_timeout_seconds: f64,
    pub free_text_enabled: bool,
    pub yes_no_safe_default: String,
    pub free_text_max_chars: usize,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
            stuck_timeout_seconds: 2.0,
            free_text_enabled: true,
            yes_no_safe_default: "n".to_owned(),
            free_text_max_chars: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterConfig {
    pub detection_threshold: f64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self { detection_threshold: DEFAULT_THRESHOLD }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_owned(), format: "json".to_owned() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// The fully-loaded, validated configuration for one `aegis` process.
/// `deny_unknown_fields` at the top level rejects an unrecognized section
/// outright rather than silently ignoring a typo'd table name.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub prompts: PromptsConfig,
    pub adapters: HashMap<String, AdapterConfig>,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub audit: AuditConfig,
}

impl Config {
    /// Path to the config file: `AEGIS_CONFIG` if set, else
    /// `<home>/.aegis/config.toml`.
    pub fn resolve_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("AEGIS_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(home.join(DATA_DIR_NAME).join("config.toml"))
    }

    /// The data directory holding the database, audit log, and PID file.
    /// Always `<home>/.aegis`, independent of an `AEGIS_CONFIG` override —
    /// that variable relocates only the config file itself.
    pub fn data_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(home.join(DATA_DIR_NAME))
    }

    /// Load from `path` if it exists (defaults otherwise), overlay
    /// `AEGIS_*` environment variables, and validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read config file {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_env_overlay().context("apply AEGIS_* environment overlay")?;
        config.validate().context("validate config")?;
        Ok(config)
    }

    /// Resolve the config path per [`Config::resolve_path`] and load it.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::resolve_path()?)
    }

    fn apply_env_overlay(&mut self) -> Result<()> {
        if let Ok(token) = std::env::var("AEGIS_TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(token);
        }
        if let Ok(users) = std::env::var("AEGIS_TELEGRAM_ALLOWED_USERS") {
            self.telegram.allowed_users = users
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<i64>()
                        .with_context(|| format!("invalid user id {s:?} in AEGIS_TELEGRAM_ALLOWED_USERS"))
                })
                .collect::<Result<Vec<_>>>()?;
        }
        if let Ok(level) = std::env::var("AEGIS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(db_path) = std::env::var("AEGIS_DB_PATH") {
            self.database.path = Some(PathBuf::from(db_path));
        }
        if let Ok(timeout) = std::env::var("AEGIS_APPROVAL_TIMEOUT_SECONDS") {
            self.prompts.timeout_seconds = timeout
                .parse()
                .with_context(|| format!("invalid AEGIS_APPROVAL_TIMEOUT_SECONDS value {timeout:?}"))?;
        }
        Ok(())
    }

    /// Validate all cross-field and format invariants. Maps to
    /// [`crate::error::ErrorCode::ConfigError`] (exit 2) at the CLI layer.
    pub fn validate(&self) -> Result<()> {
        if self.prompts.yes_no_safe_default != "n" {
            bail!(
                "prompts.yes_no_safe_default must be \"n\" (got {:?}); auto-approving a yes/no prompt is never allowed",
                self.prompts.yes_no_safe_default
            );
        }
        if !(60..=3600).contains(&self.prompts.timeout_seconds) {
            bail!(
                "prompts.timeout_seconds must be between 60 and 3600 (got {})",
                self.prompts.timeout_seconds
            );
        }
        if !matches!(self.logging.level.as_str(), "debug" | "info" | "warning" | "error") {
            bail!("logging.level must be one of debug, info, warning, error (got {:?})", self.logging.level);
        }
        if let Some(ref token) = self.telegram.bot_token {
            let pattern = Regex::new(r"^\d{8,12}:[A-Za-z0-9_-]{35,}$").expect("static regex");
            if !pattern.is_match(token) {
                bail!("telegram.bot_token does not match the expected <digits>:<token> shape");
            }
        }
        Ok(())
    }

    /// Detection threshold for `tool`, falling back to the global default
    /// when no per-adapter override is configured.
    pub fn detection_threshold(&self, tool: &str) -> f64 {
        self.adapters.get(tool).map(|a| a.detection_threshold).unwrap_or(DEFAULT_THRESHOLD)
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.database.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("aegis.db")),
        }
    }

    pub fn audit_log_path(&self) -> Result<PathBuf> {
        match &self.audit.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("audit.jsonl")),
        }
    }

    /// Write this config to `path` as TOML, owner-readable only.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create config directory {}", parent.display()))?;
        }
        let rendered = toml::to_string_pretty(self).context("serialize config to TOML")?;
        std::fs::write(path, rendered).with_context(|| format!("write config file {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
