//! Provider registry
//!
//! Built once at startup from the providers settings. Every adapter is
//! constructed with its vendor connector and checked once; only the available
//! ones are kept.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::aws::AwsProvider;
use super::azure::AzureKeyVaultProvider;
use super::backend::{ProviderDescriptor, ProviderKind, SecretsProvider};
use super::bitwarden::BitwardenProvider;
use super::cyberark::CyberArkProvider;
use super::keeper::KeeperProvider;
use super::one_password::OnePasswordProvider;
use super::secret_server::SecretServerProvider;
use super::vault::VaultProvider;
use crate::config::ProvidersSettings;
use crate::errors::{LatchkeyError, Result};
use crate::secrets::error::{Result as SecretsResult, SecretsError};

/// Available backends keyed by id
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderKind, Arc<dyn SecretsProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().map(|k| k.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Create a registry with no backends
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every adapter from `settings` with its compiled-in connector.
    ///
    /// Fails with [`LatchkeyError::NoProvidersAvailable`] when no adapter is usable.
    pub fn from_settings(settings: &ProvidersSettings) -> Result<Self> {
        let candidates: Vec<Arc<dyn SecretsProvider>> = vec![
            Arc::new(VaultProvider::new(settings.vault.clone(), VaultProvider::live_connector())),
            Arc::new(AwsProvider::secrets_manager(settings.aws.clone(), AwsProvider::live_connector())),
            Arc::new(AwsProvider::parameter_store(settings.aws.clone(), AwsProvider::live_connector())),
            Arc::new(SecretServerProvider::new(
                ProviderKind::DelineaTssId,
                settings.delinea.clone(),
                SecretServerProvider::live_connector(),
            )),
            Arc::new(SecretServerProvider::new(
                ProviderKind::DelineaTssPath,
                settings.delinea.clone(),
                SecretServerProvider::live_connector(),
            )),
            Arc::new(SecretServerProvider::new(
                ProviderKind::ThycoticTss,
                settings.thycotic.clone(),
                SecretServerProvider::live_connector(),
            )),
            Arc::new(AzureKeyVaultProvider::new(
                settings.azure.clone(),
                AzureKeyVaultProvider::live_connector(),
            )),
            Arc::new(OnePasswordProvider::new(
                settings.one_password.clone(),
                OnePasswordProvider::live_connector(),
            )),
            Arc::new(CyberArkProvider::new(settings.cyberark.clone(), CyberArkProvider::live_connector())),
            Arc::new(KeeperProvider::new(settings.keeper.clone(), KeeperProvider::live_connector())),
            Arc::new(BitwardenProvider::new(settings.bitwarden.clone(), BitwardenProvider::live_connector())),
        ];

        Self::from_providers(candidates)
    }

    /// Register each candidate, failing if none is available
    pub fn from_providers(candidates: impl IntoIterator<Item = Arc<dyn SecretsProvider>>) -> Result<Self> {
        let mut registry = Self::new();
        for provider in candidates {
            registry.register(provider);
        }

        if registry.is_empty() {
            return Err(LatchkeyError::NoProvidersAvailable);
        }

        info!(
            providers = ?registry.providers.keys().map(|k| k.as_str()).collect::<Vec<_>>(),
            "Secrets provider registry ready"
        );
        Ok(registry)
    }

    /// Register an adapter.
    ///
    /// Returns false when the adapter is unavailable or its id is taken.
    pub fn register(&mut self, provider: Arc<dyn SecretsProvider>) -> bool {
        let kind = provider.kind();
        if !provider.is_available() {
            debug!(provider = %kind, "Provider unavailable (vendor client not compiled in), skipping");
            return false;
        }
        if self.providers.contains_key(&kind) {
            warn!(provider = %kind, "Duplicate provider id, keeping the first registration");
            return false;
        }
        debug!(provider = %kind, "Registering secrets provider");
        self.providers.insert(kind, provider);
        true
    }

    /// Look up a backend by its reference id
    pub fn get(&self, id: &str) -> SecretsResult<Arc<dyn SecretsProvider>> {
        let kind: ProviderKind = id.parse()?;
        self.providers.get(&kind).cloned().ok_or_else(|| SecretsError::unknown_provider(id))
    }

    pub fn contains(&self, kind: ProviderKind) -> bool {
        self.providers.contains_key(&kind)
    }

    /// Descriptors of the registered backends, sorted by id
    pub fn list_available(&self) -> Vec<ProviderDescriptor> {
        let mut descriptors: Vec<_> = self.providers.values().map(|p| p.descriptor()).collect();
        descriptors.sort_by(|a, b| a.id.cmp(b.id));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::auth::{AuthMethod, AuthPlan};
    use crate::secrets::backends::backend::AuthenticatedClient;
    use crate::secrets::error::ErrorKind;
    use crate::secrets::schema::{NormalizedParameters, ParameterSchema, ParameterSpec};
    use crate::secrets::types::SecretString;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct StubProvider {
        kind: ProviderKind,
        available: bool,
        schema: ParameterSchema,
        tag: &'static str,
    }

    impl StubProvider {
        fn new(kind: ProviderKind, available: bool, tag: &'static str) -> Arc<dyn SecretsProvider> {
            Arc::new(Self {
                kind,
                available,
                schema: ParameterSchema::new(vec![ParameterSpec::text("name", "Name", "").required()]),
                tag,
            })
        }
    }

    #[async_trait]
    impl SecretsProvider for StubProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn schema(&self) -> &ParameterSchema {
            &self.schema
        }

        fn is_available(&self) -> bool {
            self.available
        }

        fn select_auth(&self, _params: &NormalizedParameters) -> SecretsResult<AuthPlan> {
            Err(SecretsError::auth_config(self.kind.as_str(), self.tag))
        }

        async fn authenticate(&self, _plan: AuthPlan) -> SecretsResult<AuthenticatedClient> {
            Err(SecretsError::auth_config(self.kind.as_str(), AuthMethod::Token.as_str()))
        }

        async fn fetch(
            &self,
            _client: &AuthenticatedClient,
            _params: &NormalizedParameters,
        ) -> SecretsResult<SecretString> {
            Ok(SecretString::new(self.tag))
        }
    }

    #[test]
    fn test_unavailable_providers_are_dropped() {
        let registry = ProviderRegistry::from_providers(vec![
            StubProvider::new(ProviderKind::HashicorpVault, true, "vault"),
            StubProvider::new(ProviderKind::AwsSecretsManager, false, "aws"),
        ])
        .unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.contains(ProviderKind::HashicorpVault));
        let err = registry.get("aws-secrets-manager").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownProvider);
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let mut registry = ProviderRegistry::new();
        assert!(registry.register(StubProvider::new(ProviderKind::OnePassword, true, "first")));
        assert!(!registry.register(StubProvider::new(ProviderKind::OnePassword, true, "second")));

        let provider = registry.get("one-password").unwrap();
        assert!(format!("{:?}", provider).contains("\"first\""));
    }

    #[test]
    fn test_empty_registry_is_an_error() {
        let err = ProviderRegistry::from_providers(vec![StubProvider::new(
            ProviderKind::CyberArkCli,
            false,
            "cyberark",
        )])
        .unwrap_err();
        assert!(matches!(err, LatchkeyError::NoProvidersAvailable));
    }

    #[test]
    fn test_unknown_id_and_legacy_alias() {
        let registry = ProviderRegistry::from_providers(vec![StubProvider::new(
            ProviderKind::AwsParameterStore,
            true,
            "ssm",
        )])
        .unwrap();

        assert!(registry.get("aws-ssm-manager").is_ok());
        let err = registry.get("keeper").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownProvider);
        assert!(err.to_string().contains("keeper"));
    }

    #[test]
    fn test_list_available_sorted_by_id() {
        let registry = ProviderRegistry::from_providers(vec![
            StubProvider::new(ProviderKind::OnePassword, true, "op"),
            StubProvider::new(ProviderKind::AzureKeyVault, true, "az"),
            StubProvider::new(ProviderKind::CyberArkCli, true, "ca"),
        ])
        .unwrap();

        let ids: Vec<_> = registry.list_available().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["azure-key-vault", "cyberark-cli-password-sdk", "one-password"]);
        assert_eq!(registry.list_available()[0].required_parameters, vec!["name"]);
    }

    #[cfg(all(feature = "vault", feature = "delinea", feature = "azure", feature = "onepassword", feature = "cyberark"))]
    #[test]
    fn test_from_settings_registers_compiled_backends() {
        let registry = ProviderRegistry::from_settings(&ProvidersSettings::default()).unwrap();

        assert!(registry.contains(ProviderKind::HashicorpVault));
        assert!(registry.contains(ProviderKind::DelineaTssId));
        assert!(registry.contains(ProviderKind::DelineaTssPath));
        assert!(registry.contains(ProviderKind::ThycoticTss));
        assert!(registry.contains(ProviderKind::AzureKeyVault));
        assert!(registry.contains(ProviderKind::OnePassword));
        assert!(registry.contains(ProviderKind::CyberArkCli));
        assert_eq!(registry.contains(ProviderKind::Keeper), cfg!(feature = "keeper"));
        assert_eq!(registry.contains(ProviderKind::Bitwarden), cfg!(feature = "bitwarden"));
        assert_eq!(registry.contains(ProviderKind::AwsSecretsManager), cfg!(feature = "aws"));
    }
}
