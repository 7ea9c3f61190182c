//! `latchkey check-config`
//!
//! Loads and validates the configuration, builds the registry, and reports
//! which backends are usable. Never prints credential values.

use anyhow::Result;
use serde::Serialize;

use super::output::{print_structured, render_table, OutputFormat};
use crate::config::AppConfig;
use crate::secrets::SecretResolver;

#[derive(Debug, Serialize)]
pub struct ConfigReport {
    pub auth_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub log_level: String,
    pub log_format: String,
    pub configured_sections: Vec<&'static str>,
    pub available_providers: Vec<&'static str>,
}

impl ConfigReport {
    pub fn new(config: &AppConfig, resolver: &SecretResolver) -> Self {
        Self {
            auth_timeout_secs: config.resolver.auth_timeout_secs,
            fetch_timeout_secs: config.resolver.fetch_timeout_secs,
            log_level: config.logging.level.clone(),
            log_format: config.logging.format.clone(),
            configured_sections: config.providers.configured_sections(),
            available_providers: resolver.list_available_backends().into_iter().map(|d| d.id).collect(),
        }
    }

    fn table(&self) -> String {
        let rows = vec![
            vec!["auth_timeout_secs".to_string(), self.auth_timeout_secs.to_string()],
            vec!["fetch_timeout_secs".to_string(), self.fetch_timeout_secs.to_string()],
            vec!["logging".to_string(), format!("{} ({})", self.log_level, self.log_format)],
            vec!["configured sections".to_string(), self.configured_sections.join(", ")],
            vec!["available providers".to_string(), self.available_providers.join(", ")],
        ];
        render_table(&[("Setting", 22), ("Value", 200)], &rows)
    }
}

pub fn handle_check_config_command(
    config: &AppConfig,
    resolver: &SecretResolver,
    output: &str,
) -> Result<()> {
    let report = ConfigReport::new(config, resolver);
    match output.parse::<OutputFormat>()? {
        OutputFormat::Table => {
            print!("{}", report.table());
            println!("\nConfiguration is valid");
        }
        format => print_structured(&report, format)?,
    }
    Ok(())
}
