//! # Configuration Settings
//!
//! Defines the configuration structure for latchkey.

use crate::errors::{LatchkeyError, Result};
use crate::secrets::backends::{
    AwsSettings, AzureSettings, BitwardenSettings, CyberArkSettings, KeeperSettings,
    OnePasswordSettings, SecretServerSettings, VaultSettings,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct AppConfig {
    /// Resolver timeouts
    #[validate(nested)]
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Logging configuration
    #[validate(nested)]
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-backend startup settings
    #[serde(default)]
    pub providers: ProvidersSettings,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(LatchkeyError::from)?;

        self.validate_custom()?;

        Ok(())
    }

    fn validate_custom(&self) -> Result<()> {
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(LatchkeyError::validation_field(
                format!("Log format must be 'json' or 'pretty', got '{}'", self.logging.format),
                "logging.format",
            ));
        }

        if let Some(vault) = &self.providers.vault {
            for (name, instance) in vault.configs.iter() {
                if instance.url.as_deref().map_or(true, str::is_empty) {
                    return Err(LatchkeyError::validation_field(
                        format!("Vault configuration '{}' has no url", name),
                        format!("providers.vault.configs.{}.url", name),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ResolverConfig {
    /// Deadline for one backend login
    #[validate(range(
        min = 1,
        max = 300,
        message = "Auth timeout must be between 1 and 300 seconds"
    ))]
    pub auth_timeout_secs: u64,

    /// Deadline for one backend read
    #[validate(range(
        min = 1,
        max = 300,
        message = "Fetch timeout must be between 1 and 300 seconds"
    ))]
    pub fetch_timeout_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { auth_timeout_secs: 30, fetch_timeout_secs: 30 }
    }
}

impl ResolverConfig {
    /// Get auth timeout as Duration
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// Get fetch timeout as Duration
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is not set
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub level: String,

    /// `json` or `pretty`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format == "json"
    }
}

/// Startup settings for each backend; a missing section leaves the backend
/// registered but unconfigured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersSettings {
    pub vault: Option<VaultSettings>,
    pub aws: Option<AwsSettings>,
    pub delinea: Option<SecretServerSettings>,
    pub thycotic: Option<SecretServerSettings>,
    pub azure: Option<AzureSettings>,
    pub one_password: Option<OnePasswordSettings>,
    pub cyberark: Option<CyberArkSettings>,
    pub keeper: Option<KeeperSettings>,
    pub bitwarden: Option<BitwardenSettings>,
}

impl ProvidersSettings {
    /// Names of the sections present, for startup logging
    pub fn configured_sections(&self) -> Vec<&'static str> {
        let sections = [
            ("vault", self.vault.is_some()),
            ("aws", self.aws.is_some()),
            ("delinea", self.delinea.is_some()),
            ("thycotic", self.thycotic.is_some()),
            ("azure", self.azure.is_some()),
            ("one_password", self.one_password.is_some()),
            ("cyberark", self.cyberark.is_some()),
            ("keeper", self.keeper.is_some()),
            ("bitwarden", self.bitwarden.is_some()),
        ];
        sections.into_iter().filter(|(_, present)| *present).map(|(name, _)| name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::backends::vault::VaultInstanceSettings;

    #[test]
    fn test_default_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.resolver.auth_timeout(), Duration::from_secs(30));
        assert_eq!(config.resolver.fetch_timeout(), Duration::from_secs(30));
        assert!(!config.logging.is_json());
    }

    #[test]
    fn test_config_validation_ranges() {
        let mut config = AppConfig::default();
        config.resolver.auth_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Auth timeout must be between 1 and 300 seconds"));

        let mut config = AppConfig::default();
        config.resolver.fetch_timeout_secs = 301;
        assert!(config.validate().is_err());

        config.resolver.fetch_timeout_secs = 300;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_format_validation() {
        let mut config = AppConfig::default();
        config.logging.format = "xml".to_string();
        assert!(matches!(
            config.validate(),
            Err(LatchkeyError::Validation { field: Some(ref f), .. }) if f == "logging.format"
        ));

        config.logging.format = "json".to_string();
        assert!(config.validate().is_ok());
        assert!(config.logging.is_json());
    }

    #[test]
    fn test_named_vault_without_url_is_rejected() {
        let mut vault = VaultSettings::default();
        vault.configs.insert("backup".to_string(), VaultInstanceSettings::default());
        let config = AppConfig {
            providers: ProvidersSettings { vault: Some(vault), ..Default::default() },
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backup"));
    }

    #[test]
    fn test_providers_deserialize_from_yaml() {
        let yaml = r#"
resolver:
  auth_timeout_secs: 10
providers:
  vault:
    url: https://vault.example.com
    token: s.abc
    configs:
      eu:
        url: https://vault-eu.example.com
        auth_method: approle
  thycotic:
    base_url: https://thycotic.example.com/SecretServer
    token: tok
  one_password:
    url: http://connect:8080
    vaults:
      Infra:
        id: abc123
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.resolver.auth_timeout_secs, 10);
        assert_eq!(config.resolver.fetch_timeout_secs, 30);
        assert_eq!(config.providers.configured_sections(), vec!["vault", "thycotic", "one_password"]);

        let vault = config.providers.vault.unwrap();
        assert_eq!(vault.default.url.as_deref(), Some("https://vault.example.com"));
        assert_eq!(vault.configs["eu"].auth_method.as_deref(), Some("approle"));
        assert!(config.providers.delinea.is_none());
    }

    #[test]
    fn test_keeper_and_bitwarden_sections() {
        let yaml = r#"
providers:
  keeper:
    token: US:ONE_TIME_TOKEN_abcdef0123
    ksm_executable_path: /usr/local/bin/ksm
  bitwarden:
    api_url: https://api.bitwarden.com
    identity_url: https://identity.bitwarden.com
    token: "0.be8e0ad8-d545-4017-a55a-b02f014d4158.secret:key"
    org_id: 6b3a1a27-5c1f-4b58-a7d4-0e3b2d9c8f10
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.providers.configured_sections(), vec!["keeper", "bitwarden"]);

        let keeper = config.providers.keeper.unwrap();
        assert_eq!(keeper.token.unwrap().expose_secret(), "US:ONE_TIME_TOKEN_abcdef0123");
        assert!(keeper.config.is_none());
        let bitwarden = config.providers.bitwarden.unwrap();
        assert_eq!(bitwarden.org_id.as_deref(), Some("6b3a1a27-5c1f-4b58-a7d4-0e3b2d9c8f10"));
        assert!(format!("{:?}", bitwarden).contains("REDACTED"));
    }
}
