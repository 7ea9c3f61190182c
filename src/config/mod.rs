//! # Configuration Management
//!
//! Layered configuration for latchkey: an optional YAML/TOML file
//! (`latchkey.yml` in the working directory, or an explicit `--config`
//! path) overlaid with `LATCHKEY__*` environment variables, where `__`
//! separates nested keys:
//!
//! ```text
//! LATCHKEY__RESOLVER__AUTH_TIMEOUT_SECS=10
//! LATCHKEY__PROVIDERS__VAULT__URL=https://vault.example.com
//! LATCHKEY__PROVIDERS__VAULT__TOKEN=s.xxxx
//! ```

pub mod settings;

pub use settings::{AppConfig, LoggingConfig, ProvidersSettings, ResolverConfig};

use crate::errors::{LatchkeyError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ENV_PREFIX: &str = "LATCHKEY";
pub const DEFAULT_CONFIG_FILE: &str = "latchkey";

/// Load `.env` if present. Must run before the configuration is read.
pub fn load_dotenv() {
    if let Err(e) = dotenvy::dotenv() {
        // Only warn if the error is NOT "file not found"
        if !e.not_found() {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }
}

/// Builder for [`AppConfig`]
#[derive(Debug, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read this file instead of looking for `latchkey.{yml,yaml,toml,json}`
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Use these variables instead of the process environment
    pub fn with_env(mut self, vars: HashMap<String, String>) -> Self {
        self.env = Some(vars);
        self
    }

    /// Load, deserialize and validate the configuration
    pub fn load(self) -> Result<AppConfig> {
        let file_source = match &self.file {
            Some(path) => {
                if !path.exists() {
                    return Err(LatchkeyError::config(format!(
                        "Configuration file not found: {}",
                        path.display()
                    )));
                }
                config::File::from(path.as_path()).required(true)
            }
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .source(self.env);

        let app_config: AppConfig = config::Config::builder()
            .add_source(file_source)
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        app_config.validate()?;

        debug!(
            file = ?self.file,
            providers = ?app_config.providers.configured_sections(),
            "Loaded configuration"
        );
        Ok(app_config)
    }
}

/// Load the configuration from `path` (or the default file) and the process environment
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let loader = ConfigLoader::new();
    match path {
        Some(path) => loader.with_file(path),
        None => loader,
    }
    .load()
}
