//! Secret resolution pipeline
//!
//! `resolve` runs one reference through lookup, parameter rendering and
//! validation, auth selection, the client cache and a single fetch. Errors
//! come back with the kind the adapter gave them; the resolver only attaches
//! the reference name.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn, Instrument, Span};

use super::auth::AuthPlan;
use super::backends::{
    AuthenticatedClient, ClientCache, ProviderDescriptor, ProviderRegistry, SecretsProvider,
};
use super::error::{ErrorKind, Result, SecretsError};
use super::reference::SecretReference;
use super::types::SecretString;
use crate::config::{AppConfig, ResolverConfig};
use crate::observability::metrics::{record_auth_attempt, record_resolution};
use crate::{login_span, resolution_span};

/// Resolves secret references against the registered backends.
///
/// Cheap to clone; clones share the registry and the client cache.
#[derive(Debug, Clone)]
pub struct SecretResolver {
    registry: Arc<ProviderRegistry>,
    cache: Arc<ClientCache>,
    auth_timeout: Duration,
    fetch_timeout: Duration,
}

impl SecretResolver {
    pub fn new(registry: Arc<ProviderRegistry>, config: &ResolverConfig) -> Self {
        Self::with_timeouts(registry, config.auth_timeout(), config.fetch_timeout())
    }

    pub fn with_timeouts(
        registry: Arc<ProviderRegistry>,
        auth_timeout: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self { registry, cache: Arc::new(ClientCache::new()), auth_timeout, fetch_timeout }
    }

    /// Build the registry from the providers settings and wrap it in a resolver
    pub fn from_config(config: &AppConfig) -> crate::errors::Result<Self> {
        let registry = ProviderRegistry::from_settings(&config.providers)?;
        Ok(Self::new(Arc::new(registry), &config.resolver))
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    /// Descriptors of the available backends, sorted by id
    pub fn list_available_backends(&self) -> Vec<ProviderDescriptor> {
        self.registry.list_available()
    }

    /// Resolve one reference to its secret value
    pub async fn resolve(&self, reference: &SecretReference) -> Result<SecretString> {
        let span = resolution_span!(reference.provider, reference.name);
        let result = self.resolve_reference(reference).instrument(span).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind().as_str(),
        };
        record_resolution(&reference.provider, outcome);

        result.map_err(|e| {
            debug!(provider = %reference.provider, secret = %reference.name, error = %e, "Resolution failed");
            e.with_secret(&reference.name)
        })
    }

    /// Resolve from loose parts; the reference name is the provider id
    pub async fn resolve_parts(
        &self,
        provider: &str,
        parameters: BTreeMap<String, String>,
        context: Option<Value>,
    ) -> Result<SecretString> {
        let reference = SecretReference {
            name: provider.to_string(),
            provider: provider.to_string(),
            parameters,
            context,
        };
        self.resolve(&reference).await
    }

    async fn resolve_reference(&self, reference: &SecretReference) -> Result<SecretString> {
        let provider = self.registry.get(&reference.provider)?;
        let kind = provider.kind();

        let raw = reference.rendered_parameters()?;
        let params = provider.validate(&raw)?;
        let plan = provider.select_auth(&params)?;

        let span = Span::current();
        span.record("config_name", plan.config_name.as_str());
        span.record("auth_method", plan.method.as_str());

        let key = plan.cache_key();
        let client = self
            .cache
            .get_or_create(&key, || login(Arc::clone(&provider), plan, self.auth_timeout))
            .await?;

        let fetched = match tokio::time::timeout(self.fetch_timeout, provider.fetch(&client, &params)).await {
            Ok(result) => result,
            Err(_) => Err(SecretsError::timeout(kind.as_str(), "fetch", millis(self.fetch_timeout))),
        };

        match &fetched {
            Ok(_) => debug!(cache_key = %key, "Secret resolved"),
            Err(e) if e.kind() == ErrorKind::AuthRejected => {
                warn!(cache_key = %key, error = %e, "Credentials rejected during fetch, dropping cached client");
                self.cache.invalidate(&key);
            }
            Err(_) => {}
        }
        fetched
    }
}

// Owns everything it needs so that it can outlive the caller that started it.
fn login(
    provider: Arc<dyn SecretsProvider>,
    plan: AuthPlan,
    deadline: Duration,
) -> impl Future<Output = Result<AuthenticatedClient>> + Send + 'static {
    let kind = provider.kind();
    let method = plan.method;
    let span = login_span!(kind, plan.config_name, method);

    async move {
        let result = match tokio::time::timeout(deadline, provider.authenticate(plan)).await {
            Ok(result) => result,
            Err(_) => Err(SecretsError::timeout(kind.as_str(), "authentication", millis(deadline))),
        };

        match &result {
            Ok(_) => {
                record_auth_attempt(kind.as_str(), method.as_str(), "success");
                info!("Login succeeded");
            }
            Err(e) => {
                record_auth_attempt(kind.as_str(), method.as_str(), e.kind().as_str());
                warn!(error = %e, "Login failed");
            }
        }
        result
    }
    .instrument(span)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::auth::{AuthMethod, Fingerprint, LoginPlan};
    use crate::secrets::backends::backend::{ProviderClient, ProviderKind, VendorError};
    use crate::secrets::backends::cyberark::{CyberArkLogin, PasswordSdk};
    use crate::secrets::schema::{NormalizedParameters, ParameterSchema, ParameterSpec};
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    struct FixedSdk(String);

    #[async_trait]
    impl PasswordSdk for FixedSdk {
        async fn get_password(&self, _args: Vec<String>) -> std::result::Result<String, VendorError> {
            Ok(self.0.clone())
        }
    }

    /// Provider whose login and fetch behavior is scripted by the test
    #[derive(Debug)]
    struct ScriptedProvider {
        schema: ParameterSchema,
        logins: AtomicUsize,
        fetches: AtomicUsize,
        login_delay: Duration,
        fetch_delay: Duration,
        fetch_errors: Mutex<Vec<SecretsError>>,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                schema: ParameterSchema::new(vec![
                    ParameterSpec::text("item", "Item", "").required(),
                    ParameterSpec::text("account", "Account", ""),
                ]),
                logins: AtomicUsize::new(0),
                fetches: AtomicUsize::new(0),
                login_delay: Duration::ZERO,
                fetch_delay: Duration::ZERO,
                fetch_errors: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SecretsProvider for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::CyberArkCli
        }

        fn schema(&self) -> &ParameterSchema {
            &self.schema
        }

        fn is_available(&self) -> bool {
            true
        }

        fn select_auth(&self, params: &NormalizedParameters) -> Result<AuthPlan> {
            let account = params.get_or("account", "default").to_string();
            if account == "broken" {
                return Err(SecretsError::auth_config(self.kind().as_str(), "no credentials for 'broken'"));
            }
            Ok(AuthPlan {
                provider: self.kind(),
                fingerprint: Fingerprint::new(self.kind()).field("account", &account).finish(),
                config_name: account,
                method: AuthMethod::HostIdentity,
                login: LoginPlan::CyberArk(CyberArkLogin { executable: PathBuf::from("/bin/true") }),
            })
        }

        async fn authenticate(&self, plan: AuthPlan) -> Result<AuthenticatedClient> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.login_delay).await;
            let sdk = FixedSdk(format!("value-for-{}", plan.config_name));
            Ok(AuthenticatedClient::new(ProviderClient::CyberArk(Arc::new(sdk)), plan.method))
        }

        async fn fetch(
            &self,
            client: &AuthenticatedClient,
            params: &NormalizedParameters,
        ) -> Result<SecretString> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.fetch_delay).await;
            if let Some(err) = self.fetch_errors.lock().unwrap().pop() {
                return Err(err);
            }
            let ProviderClient::CyberArk(sdk) = &client.client else {
                return Err(client.client.mismatched(self.kind()));
            };
            let value = sdk.get_password(vec![]).await.map_err(|e| SecretsError::provider("x", e.message))?;
            Ok(SecretString::new(format!("{}:{}", value, params.require("item")?)))
        }
    }

    fn resolver(provider: Arc<ScriptedProvider>) -> SecretResolver {
        let registry = ProviderRegistry::from_providers(vec![provider as Arc<dyn SecretsProvider>]).unwrap();
        SecretResolver::with_timeouts(Arc::new(registry), Duration::from_millis(200), Duration::from_millis(200))
    }

    fn reference(item: &str) -> SecretReference {
        SecretReference::new("db-password", "cyberark-cli-password-sdk").with_parameter("item", item)
    }

    #[tokio::test]
    async fn test_resolve_reuses_cached_client() {
        let provider = Arc::new(ScriptedProvider::new());
        let resolver = resolver(Arc::clone(&provider));

        let first = resolver.resolve(&reference("a")).await.unwrap();
        let second = resolver.resolve(&reference("b")).await.unwrap();

        assert_eq!(first.expose_secret(), "value-for-default:a");
        assert_eq!(second.expose_secret(), "value-for-default:b");
        assert_eq!(provider.logins.load(Ordering::SeqCst), 1);
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_distinct_configurations_log_in_separately() {
        let provider = Arc::new(ScriptedProvider::new());
        let resolver = resolver(Arc::clone(&provider));

        resolver.resolve(&reference("a")).await.unwrap();
        let other = reference("a").with_parameter("account", "ops");
        assert_eq!(resolver.resolve(&other).await.unwrap().expose_secret(), "value-for-ops:a");

        assert_eq!(provider.logins.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.cache().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_provider_carries_reference_name() {
        let resolver = resolver(Arc::new(ScriptedProvider::new()));
        let err = resolver
            .resolve(&SecretReference::new("api-key", "keeper"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnknownProvider);
        assert_eq!(err.secret_name(), Some("api-key"));
        assert!(err.to_string().contains("api-key"));
    }

    #[tokio::test]
    async fn test_parameter_error_before_any_io() {
        let provider = Arc::new(ScriptedProvider::new());
        let resolver = resolver(Arc::clone(&provider));

        let err = resolver
            .resolve(&SecretReference::new("db-password", "cyberark-cli-password-sdk"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parameter);
        assert_eq!(err.fields(), &["item".to_string()]);
        assert_eq!(provider.logins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auth_config_error_is_not_a_login() {
        let provider = Arc::new(ScriptedProvider::new());
        let resolver = resolver(Arc::clone(&provider));

        let err = resolver
            .resolve(&reference("a").with_parameter("account", "broken"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthConfig);
        assert_eq!(provider.logins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_templated_parameters_render_against_context() {
        let provider = Arc::new(ScriptedProvider::new());
        let resolver = resolver(Arc::clone(&provider));

        let value = resolver
            .resolve_parts(
                "cyberark-cli-password-sdk",
                BTreeMap::from([("item".to_string(), "{{ obj.site.slug }}-admin".to_string())]),
                Some(json!({"site": {"slug": "ams01"}})),
            )
            .await
            .unwrap();
        assert_eq!(value.expose_secret(), "value-for-default:ams01-admin");

        let err = resolver
            .resolve_parts(
                "cyberark-cli-password-sdk",
                BTreeMap::from([("item".to_string(), "{{ obj.tenant }}".to_string())]),
                Some(json!({"site": {}})),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parameter);
        assert_eq!(err.secret_name(), Some("cyberark-cli-password-sdk"));
    }

    #[tokio::test]
    async fn test_fetch_auth_rejection_invalidates_client() {
        let provider = Arc::new(ScriptedProvider::new());
        let resolver = resolver(Arc::clone(&provider));

        resolver.resolve(&reference("a")).await.unwrap();
        provider
            .fetch_errors
            .lock()
            .unwrap()
            .push(SecretsError::auth_rejected("cyberark-cli-password-sdk", "token revoked"));

        let err = resolver.resolve(&reference("a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthRejected);
        assert!(resolver.cache().is_empty());

        resolver.resolve(&reference("a")).await.unwrap();
        assert_eq!(provider.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_value_not_found_keeps_client() {
        let provider = Arc::new(ScriptedProvider::new());
        let resolver = resolver(Arc::clone(&provider));

        provider
            .fetch_errors
            .lock()
            .unwrap()
            .push(SecretsError::missing_key("cyberark-cli-password-sdk", "password"));
        let err = resolver.resolve(&reference("a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueNotFound);
        assert!(!err.is_retryable());
        assert_eq!(resolver.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_login_timeout() {
        let mut scripted = ScriptedProvider::new();
        scripted.login_delay = Duration::from_secs(5);
        let resolver = resolver(Arc::new(scripted));

        let err = resolver.resolve(&reference("a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("authentication"));
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let mut scripted = ScriptedProvider::new();
        scripted.fetch_delay = Duration::from_secs(5);
        let resolver = resolver(Arc::new(scripted));

        let err = resolver.resolve(&reference("a")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("fetch"));
        assert_eq!(err.secret_name(), Some("db-password"));
    }

    #[traced_test]
    #[tokio::test]
    async fn test_secret_values_never_logged() {
        let provider = Arc::new(ScriptedProvider::new());
        let resolver = resolver(Arc::clone(&provider));

        let value = resolver.resolve(&reference("a")).await.unwrap();
        assert_eq!(value.expose_secret(), "value-for-default:a");
        assert!(logs_contain("Login succeeded"));
        assert!(!logs_contain("value-for-default"));
    }
}
