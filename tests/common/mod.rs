//! Common test utilities for all integration tests.
//!
//! Mock vendor connectors with call counters, wired into the real adapters.

#![allow(dead_code)]
#![allow(clippy::duplicate_mod)]

pub mod mock_vault;

use latchkey::secrets::backends::vault::{VaultInstanceSettings, VaultSettings};
use latchkey::secrets::{ProviderRegistry, SecretResolver, SecretString, SecretsProvider};
use std::sync::Arc;
use std::time::Duration;

/// Resolver over `providers` with short deadlines
pub fn resolver_with(providers: Vec<Arc<dyn SecretsProvider>>, timeout: Duration) -> SecretResolver {
    let registry = ProviderRegistry::from_providers(providers).expect("at least one available provider");
    SecretResolver::with_timeouts(Arc::new(registry), timeout, timeout)
}

/// Vault settings with a token-auth default instance and an AppRole instance named `eu`
pub fn vault_settings() -> VaultSettings {
    let mut settings = VaultSettings {
        default: VaultInstanceSettings {
            url: Some("https://vault.example.com".to_string()),
            token: Some(SecretString::new("s.root")),
            ..Default::default()
        },
        ..Default::default()
    };
    settings.configs.insert(
        "eu".to_string(),
        VaultInstanceSettings {
            url: Some("https://vault-eu.example.com".to_string()),
            auth_method: Some("approle".to_string()),
            role_id: Some("billing".to_string()),
            secret_id: Some(SecretString::new("approle-secret")),
            ..Default::default()
        },
    );
    settings
}
