//! Integration tests for the resolution pipeline
//!
//! Real adapters with mock vendor connectors, driven through the public
//! `SecretResolver` API.

mod common;

use common::mock_vault::MockVaultConnector;
use common::{resolver_with, vault_settings};
use latchkey::secrets::backends::vault::{VaultConnector, VaultProvider};
use latchkey::secrets::backends::VaultSettings;
use latchkey::secrets::{ErrorKind, SecretReference, SecretsProvider};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

fn vault_reference(path: &str, key: &str) -> SecretReference {
    SecretReference::new("db-password", "hashicorp-vault")
        .with_parameter("path", path)
        .with_parameter("key", key)
}

fn vault_resolver(settings: Option<VaultSettings>) -> (latchkey::SecretResolver, Arc<common::mock_vault::VaultState>) {
    let (connector, state) = MockVaultConnector::new();
    let connector: Arc<dyn VaultConnector> = connector;
    let provider: Arc<dyn SecretsProvider> = Arc::new(VaultProvider::new(settings, Some(connector)));
    (resolver_with(vec![provider], Duration::from_secs(2)), state)
}

#[tokio::test]
async fn test_resolve_vault_value() {
    let (resolver, state) = vault_resolver(Some(vault_settings()));
    state.put("secret", "apps/billing", json!({"password": "s3cret", "port": 5432}));

    let value = resolver.resolve(&vault_reference("apps/billing", "password")).await.unwrap();
    assert_eq!(value.expose_secret(), "s3cret");

    let port = resolver.resolve(&vault_reference("apps/billing", "port")).await.unwrap();
    assert_eq!(port.expose_secret(), "5432");

    assert_eq!(state.logins(), 1);
    assert_eq!(state.reads(), 2);
}

#[tokio::test]
async fn test_missing_key_is_value_not_found() {
    let (resolver, state) = vault_resolver(Some(vault_settings()));
    state.put("secret", "apps/billing", json!({"password": "s3cret"}));

    let err = resolver.resolve(&vault_reference("apps/billing", "username")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValueNotFound);
    assert!(err.to_string().contains("username"));
    assert_eq!(err.secret_name(), Some("db-password"));

    let err = resolver.resolve(&vault_reference("apps/nothing", "password")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValueNotFound);
    assert_eq!(state.logins(), 1);
}

#[tokio::test]
async fn test_named_configurations_have_separate_clients() {
    let (resolver, state) = vault_resolver(Some(vault_settings()));
    state.put("secret", "apps/billing", json!({"password": "s3cret"}));

    resolver.resolve(&vault_reference("apps/billing", "password")).await.unwrap();
    resolver
        .resolve(&vault_reference("apps/billing", "password").with_parameter("vault", "eu"))
        .await
        .unwrap();
    resolver
        .resolve(&vault_reference("apps/billing", "password").with_parameter("vault", "eu"))
        .await
        .unwrap();

    assert_eq!(state.logins(), 2);
    let urls = state.login_urls.lock().unwrap().clone();
    assert_eq!(urls, vec!["https://vault.example.com", "https://vault-eu.example.com"]);
}

#[tokio::test]
async fn test_unknown_named_configuration() {
    let (resolver, state) = vault_resolver(Some(vault_settings()));

    let err = resolver
        .resolve(&vault_reference("apps/billing", "password").with_parameter("vault", "apac"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderNotConfigured);
    assert!(err.to_string().contains("apac"));
    assert_eq!(state.logins(), 0);
}

#[tokio::test]
async fn test_missing_section_is_not_configured() {
    let (resolver, state) = vault_resolver(None);

    let err = resolver.resolve(&vault_reference("apps/billing", "password")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderNotConfigured);
    assert_eq!(state.logins(), 0);
}

#[tokio::test]
async fn test_parameter_errors_name_fields() {
    let (resolver, state) = vault_resolver(Some(vault_settings()));

    let err = resolver
        .resolve(&SecretReference::new("db-password", "hashicorp-vault").with_parameter("path", "apps/billing"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parameter);
    assert_eq!(err.fields(), &["key".to_string()]);

    let err = resolver
        .resolve(&vault_reference("apps/billing", "password").with_parameter("kv_version", "v3"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Parameter);
    assert_eq!(err.fields(), &["kv_version".to_string()]);

    assert_eq!(state.logins(), 0);
}

#[tokio::test]
async fn test_rejected_login_is_not_cached() {
    let (resolver, state) = vault_resolver(Some(vault_settings()));
    state.put("secret", "apps/billing", json!({"password": "s3cret"}));
    state.reject_logins.store(true, Ordering::SeqCst);

    let err = resolver.resolve(&vault_reference("apps/billing", "password")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthRejected);
    assert!(!err.is_retryable());
    assert!(resolver.cache().is_empty());

    state.reject_logins.store(false, Ordering::SeqCst);
    let value = resolver.resolve(&vault_reference("apps/billing", "password")).await.unwrap();
    assert_eq!(value.expose_secret(), "s3cret");
    assert_eq!(state.logins(), 2);
}

#[tokio::test]
async fn test_revoked_token_forces_new_login() {
    let (resolver, state) = vault_resolver(Some(vault_settings()));
    state.put("secret", "apps/billing", json!({"password": "s3cret"}));

    resolver.resolve(&vault_reference("apps/billing", "password")).await.unwrap();
    state.revoke_next_read.store(true, Ordering::SeqCst);

    let err = resolver.resolve(&vault_reference("apps/billing", "password")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthRejected);

    resolver.resolve(&vault_reference("apps/billing", "password")).await.unwrap();
    assert_eq!(state.logins(), 2);
}

#[tokio::test]
async fn test_unknown_and_unavailable_providers() {
    let (resolver, _state) = vault_resolver(Some(vault_settings()));

    let err = resolver.resolve(&SecretReference::new("api-key", "keeper")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownProvider);

    // Compiled adapter whose connector is absent is not registered
    let err = resolver
        .resolve(&SecretReference::new("api-key", "aws-secrets-manager"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownProvider);

    let ids: Vec<_> = resolver.list_available_backends().into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["hashicorp-vault"]);
}

#[tokio::test]
async fn test_templated_path_renders_from_context() {
    let (resolver, state) = vault_resolver(Some(vault_settings()));
    state.put("secret", "sites/ams01/switch", json!({"password": "enable"}));

    let reference = vault_reference("sites/{{ obj.site.slug }}/switch", "password")
        .with_context(json!({"site": {"slug": "ams01"}}));
    let value = resolver.resolve(&reference).await.unwrap();
    assert_eq!(value.expose_secret(), "enable");
}

#[traced_test]
#[tokio::test]
async fn test_credentials_and_values_stay_out_of_logs() {
    let (resolver, state) = vault_resolver(Some(vault_settings()));
    state.put("secret", "apps/billing", json!({"password": "s3cret"}));

    resolver.resolve(&vault_reference("apps/billing", "password")).await.unwrap();

    assert!(logs_contain("Authenticated to Vault"));
    assert!(!logs_contain("s3cret"));
    assert!(!logs_contain("s.root"));
}

#[cfg(feature = "delinea")]
#[tokio::test]
async fn test_secret_server_over_http_reuses_token() {
    use latchkey::secrets::backends::{SecretServerProvider, SecretServerSettings};
    use latchkey::secrets::{ProviderKind, SecretString};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "bearer-1",
            "token_type": "bearer",
            "expires_in": 1200,
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/secrets/42"))
        .and(header("authorization", "Bearer bearer-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 42,
            "name": "core-sw",
            "items": [
                {"slug": "username", "itemValue": "admin", "fieldName": "Username"},
                {"slug": "password", "itemValue": "s3cr3t", "fieldName": "Password"},
            ]
        })))
        .expect(2)
        .mount(&server)
        .await;

    let settings = SecretServerSettings {
        base_url: Some(server.uri()),
        username: Some("svc-netops".to_string()),
        password: Some(SecretString::new("hunter2")),
        ..Default::default()
    };
    let provider: Arc<dyn SecretsProvider> = Arc::new(SecretServerProvider::new(
        ProviderKind::DelineaTssId,
        Some(settings),
        SecretServerProvider::live_connector(),
    ));
    let resolver = resolver_with(vec![provider], Duration::from_secs(5));

    let reference = |field: &str| {
        SecretReference::new("core-sw", "delinea-tss-id")
            .with_parameter("secret_id", "42")
            .with_parameter("selected_value", field)
    };
    assert_eq!(resolver.resolve(&reference("password")).await.unwrap().expose_secret(), "s3cr3t");
    assert_eq!(resolver.resolve(&reference("username")).await.unwrap().expose_secret(), "admin");
}
