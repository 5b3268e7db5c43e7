//! The `courier.config.ron` file.

use std::path::{Path, PathBuf};

use courier_common::content::ContentCatalog;
use courier_dispatch::{DispatchConfig, SmtpConfig};
use courier_queue::{QueueConfig, enroll::EnrollPolicy};
use serde::Deserialize;

use crate::http::HttpConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

/// Environment variable that overrides `smtp.password`.
pub const PASSWORD_ENV: &str = "COURIER_SMTP_PASSWORD";

/// Where queue entries live.
#[derive(Debug, Clone, Default, Deserialize)]
pub enum StoreConfig {
    /// In-process only; entries are lost on exit.
    #[default]
    Memory,
    /// Requires the `postgres` feature.
    Postgres {
        url: String,
        #[serde(default = "defaults::max_connections")]
        max_connections: u32,
        /// Apply the bundled migrations on startup.
        #[serde(default)]
        migrate: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    pub dispatch: DispatchConfig,
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub content: ContentCatalog,
    #[serde(default)]
    pub enroll: EnrollPolicy,
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    /// Parse a config from RON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid config.
    pub fn from_ron(text: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str(text)?)
    }

    /// Read and parse the config at `path`, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {}", path.display(), e)
        })?;
        let mut config = Self::from_ron(&text)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {e}", path.display()))?;
        config.override_password(std::env::var(PASSWORD_ENV).ok());
        Ok(config)
    }

    /// Replace the SMTP password when `password` is non-empty.
    pub fn override_password(&mut self, password: Option<String>) {
        if let Some(password) = password.filter(|password| !password.is_empty()) {
            self.smtp.password = password;
        }
    }
}

/// Find the configuration file using the following precedence:
/// 1. `explicit`, usually from the command line
/// 2. `COURIER_CONFIG` environment variable
/// 3. ./courier.config.ron (current working directory)
/// 4. /etc/courier/courier.config.ron (system-wide config)
///
/// # Errors
///
/// Returns an error if a named file does not exist or none of the defaults do.
pub fn find_config_file(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("Config file does not exist: {}", path.display());
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("{CONFIG_ENV} points to non-existent file: {}", path.display());
    }

    let default_paths = [
        PathBuf::from("./courier.config.ron"),
        PathBuf::from("/etc/courier/courier.config.ron"),
    ];

    if let Some(path) = default_paths.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

mod defaults {
    pub const fn max_connections() -> u32 {
        5
    }
}
