//! # Structured Logging
//!
//! Subscriber setup and span helpers for the tracing ecosystem.
//!
//! Logs go to stderr so that command output on stdout stays machine
//! readable. `RUST_LOG` takes precedence over the configured level.
//! Secret values never reach a log line: [`crate::secrets::SecretString`]
//! redacts itself in every formatting path.

use crate::config::{AppConfig, LoggingConfig};
use crate::errors::{LatchkeyError, Result};
use tracing_subscriber::EnvFilter;

/// Create a tracing span for one secret resolution.
///
/// ```rust,ignore
/// let span = resolution_span!("hashicorp-vault", "db-password");
/// ```
#[macro_export]
macro_rules! resolution_span {
    ($provider:expr, $secret:expr) => {
        tracing::info_span!(
            "resolve_secret",
            provider = %$provider,
            secret = %$secret,
            config_name = tracing::field::Empty,
            auth_method = tracing::field::Empty
        )
    };
}

/// Create a tracing span for a backend login
#[macro_export]
macro_rules! login_span {
    ($provider:expr, $config_name:expr, $method:expr) => {
        tracing::debug_span!(
            "provider_login",
            provider = %$provider,
            config_name = %$config_name,
            auth_method = %$method
        )
    };
}

fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| LatchkeyError::validation_field(format!("Invalid log filter: {}", e), "logging.level"))
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed (tests,
/// embedding applications); that is not an error.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let filter = env_filter(config)?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    let installed = if config.is_json() {
        builder.json().with_current_span(true).try_init().is_ok()
    } else {
        builder.with_target(false).try_init().is_ok()
    };
    Ok(installed)
}

/// Log configuration at startup
pub fn log_config_info(config: &AppConfig) {
    tracing::info!(
        auth_timeout_secs = config.resolver.auth_timeout_secs,
        fetch_timeout_secs = config.resolver.fetch_timeout_secs,
        log_format = %config.logging.format,
        providers = ?config.providers.configured_sections(),
        "latchkey configuration"
    );
}
