//! # Observability Infrastructure
//!
//! Structured logging through `tracing` and counters through the `metrics`
//! facade.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, log_config_info};
pub use metrics::{describe_metrics, CacheOutcome};

use crate::config::AppConfig;
use crate::errors::Result;
use ::tracing::debug;

/// Initialize logging and register metric descriptions
pub fn init_observability(config: &AppConfig) -> Result<()> {
    let installed = init_logging(&config.logging)?;
    describe_metrics();

    debug!(
        subscriber_installed = installed,
        log_level = %config.logging.level,
        log_format = %config.logging.format,
        "Observability initialized"
    );
    Ok(())
}
