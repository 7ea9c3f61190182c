//! Azure Key Vault backend
//!
//! Logs in with a service principal (client secret) or the instance's
//! managed identity and reads one secret version. The value is returned as
//! stored unless the reference names a `key`, in which case it must be a
//! JSON object.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use super::backend::{
    extract_json_key, AuthenticatedClient, ProviderClient, ProviderKind, SecretsProvider,
    VendorError,
};
use crate::secrets::auth::{AuthMethod, AuthPlan, Fingerprint, LoginPlan};
use crate::secrets::error::{ErrorKind, Result, SecretsError};
use crate::secrets::schema::{NormalizedParameters, ParameterSchema, ParameterSpec};
use crate::secrets::types::SecretString;

const KIND: ProviderKind = ProviderKind::AzureKeyVault;

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
pub const KEY_VAULT_SCOPE: &str = "https://vault.azure.net/.default";
pub const KEY_VAULT_API_VERSION: &str = "7.4";

/// `azure` section of the providers settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AzureSettings {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    /// Use the instance metadata identity when no client secret is set
    #[serde(default)]
    pub managed_identity: bool,
    pub authority_host: Option<String>,
    pub imds_endpoint: Option<String>,
}

impl AzureSettings {
    /// Settings from the standard `AZURE_*` environment variables
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            tenant_id: var("AZURE_TENANT_ID"),
            client_id: var("AZURE_CLIENT_ID"),
            client_secret: var("AZURE_CLIENT_SECRET").map(SecretString::new),
            managed_identity: false,
            authority_host: var("AZURE_AUTHORITY_HOST"),
            imds_endpoint: None,
        }
    }
}

/// Token acquisition for Key Vault
#[derive(Debug, Clone)]
pub enum AzureCredential {
    ClientSecret {
        authority_host: String,
        tenant_id: String,
        client_id: String,
        client_secret: SecretString,
    },
    ManagedIdentity {
        endpoint: String,
        /// User-assigned identity, if any
        client_id: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct AzureLogin {
    pub credential: AzureCredential,
}

pub struct KeyVaultSession {
    pub api: Arc<dyn KeyVaultApi>,
    pub lease: Option<Duration>,
}

#[async_trait]
pub trait AzureConnector: Send + Sync {
    async fn connect(&self, login: &AzureLogin) -> std::result::Result<KeyVaultSession, VendorError>;
}

#[async_trait]
pub trait KeyVaultApi: Send + Sync {
    async fn get_secret(
        &self,
        vault_url: &Url,
        name: &str,
        version: Option<&str>,
    ) -> std::result::Result<SecretString, VendorError>;
}

fn login_error_kind(e: &VendorError) -> Option<ErrorKind> {
    match e.status {
        Some(400) | Some(401) | Some(403) => Some(ErrorKind::AuthRejected),
        _ => None,
    }
}

fn fetch_error_kind(e: &VendorError) -> Option<ErrorKind> {
    match e.status {
        Some(404) => Some(ErrorKind::ValueNotFound),
        Some(401) | Some(403) => Some(ErrorKind::AuthRejected),
        Some(400) => Some(ErrorKind::Parameter),
        _ => None,
    }
}

/// Azure Key Vault adapter
pub struct AzureKeyVaultProvider {
    settings: AzureSettings,
    connector: Option<Arc<dyn AzureConnector>>,
    schema: ParameterSchema,
}

impl fmt::Debug for AzureKeyVaultProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureKeyVaultProvider")
            .field("tenant_id", &self.settings.tenant_id)
            .field("client_id", &self.settings.client_id)
            .field("managed_identity", &self.settings.managed_identity)
            .field("available", &self.connector.is_some())
            .finish()
    }
}

impl AzureKeyVaultProvider {
    /// Without an `azure` section the `AZURE_*` environment variables are used.
    pub fn new(settings: Option<AzureSettings>, connector: Option<Arc<dyn AzureConnector>>) -> Self {
        let schema = ParameterSchema::new(vec![
            ParameterSpec::url("vault_url", "Vault URL", "The URL of the Azure Key Vault", &["https", "http"])
                .required(),
            ParameterSpec::text("secret_name", "Secret name", "The name of the secret in the vault")
                .required(),
            ParameterSpec::text("version", "Version", "Secret version (defaults to the latest)"),
            ParameterSpec::text(
                "key",
                "Key",
                "Return this field of a JSON secret instead of the whole value",
            ),
        ]);
        Self { settings: settings.unwrap_or_else(AzureSettings::from_env), connector, schema }
    }

    /// Connector backed by reqwest, when compiled in
    pub fn live_connector() -> Option<Arc<dyn AzureConnector>> {
        live::connector()
    }

    fn credential(&self) -> Result<(AuthMethod, AzureCredential)> {
        let s = &self.settings;
        let nonempty = |v: &Option<String>| v.clone().filter(|v| !v.is_empty());
        match (nonempty(&s.tenant_id), nonempty(&s.client_id), s.client_secret.clone().filter(|c| !c.is_blank())) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => Ok((
                AuthMethod::ClientSecret,
                AzureCredential::ClientSecret {
                    authority_host: s
                        .authority_host
                        .clone()
                        .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string()),
                    tenant_id,
                    client_id,
                    client_secret,
                },
            )),
            (_, client_id, _) if s.managed_identity => Ok((
                AuthMethod::ManagedIdentity,
                AzureCredential::ManagedIdentity {
                    endpoint: s.imds_endpoint.clone().unwrap_or_else(|| DEFAULT_IMDS_ENDPOINT.to_string()),
                    client_id,
                },
            )),
            _ => Err(SecretsError::auth_config(
                KIND.as_str(),
                "set 'tenant_id', 'client_id' and 'client_secret', or enable 'managed_identity'",
            )),
        }
    }
}

#[async_trait]
impl SecretsProvider for AzureKeyVaultProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    fn is_available(&self) -> bool {
        self.connector.is_some()
    }

    fn select_auth(&self, _params: &NormalizedParameters) -> Result<AuthPlan> {
        let (method, credential) = self.credential()?;
        let (config_name, fingerprint) = match &credential {
            AzureCredential::ClientSecret { authority_host, tenant_id, client_id, client_secret } => (
                format!("{}/{}", tenant_id, client_id),
                Fingerprint::new(KIND)
                    .field("authority_host", authority_host)
                    .field("tenant_id", tenant_id)
                    .field("client_id", client_id)
                    .secret("client_secret", Some(client_secret)),
            ),
            AzureCredential::ManagedIdentity { endpoint, client_id } => (
                "managed-identity".to_string(),
                Fingerprint::new(KIND)
                    .field("imds_endpoint", endpoint)
                    .optional("client_id", client_id.as_deref()),
            ),
        };

        debug!(auth_method = %method, config_name = %config_name, "Selected Azure auth method");

        Ok(AuthPlan {
            provider: KIND,
            config_name,
            method,
            fingerprint: fingerprint.finish(),
            login: LoginPlan::Azure(AzureLogin { credential }),
        })
    }

    async fn authenticate(&self, plan: AuthPlan) -> Result<AuthenticatedClient> {
        let LoginPlan::Azure(login) = &plan.login else {
            return Err(plan.mismatched(KIND));
        };
        let connector = self.connector.as_ref().ok_or_else(|| {
            SecretsError::not_configured(KIND.as_str(), "Azure Key Vault client is not available")
        })?;

        let session = connector.connect(login).await.map_err(|e| e.classify(KIND, login_error_kind))?;

        info!(auth_method = %plan.method, config_name = %plan.config_name, "Authenticated to Azure");

        Ok(AuthenticatedClient::new(ProviderClient::KeyVault(session.api), plan.method)
            .with_lease(session.lease))
    }

    async fn fetch(
        &self,
        client: &AuthenticatedClient,
        params: &NormalizedParameters,
    ) -> Result<SecretString> {
        let ProviderClient::KeyVault(api) = &client.client else {
            return Err(client.client.mismatched(KIND));
        };
        let vault_url = params.require("vault_url")?;
        let vault_url = Url::parse(vault_url)
            .ok()
            .filter(|u| u.scheme() == "https" || u.scheme() == "http")
            .ok_or_else(|| {
                SecretsError::parameter(
                    KIND.as_str(),
                    format!("'{}' is not a valid vault URL", vault_url),
                    ["vault_url"],
                )
            })?;
        let name = params.require("secret_name")?;

        debug!(vault_url = %vault_url, secret_name = %name, "Fetching Azure Key Vault secret");

        let value = api
            .get_secret(&vault_url, name, params.get("version"))
            .await
            .map_err(|e| e.classify(KIND, fetch_error_kind))?;

        match params.get("key") {
            None => Ok(value),
            Some(key) => {
                let document: serde_json::Value = serde_json::from_str(value.expose_secret())
                    .map_err(|_| SecretsError::missing_key(KIND.as_str(), key))?;
                extract_json_key(KIND, &document, key)
            }
        }
    }
}

#[cfg(feature = "azure")]
mod live {
    use super::*;
    use crate::secrets::backends::http::{build_client, join, json_response, send_error};
    use reqwest::Client;

    pub(super) fn connector() -> Option<Arc<dyn AzureConnector>> {
        Some(Arc::new(ReqwestConnector))
    }

    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: String,
        // IMDS sends this as a string
        #[serde(default)]
        expires_in: Option<serde_json::Value>,
    }

    impl TokenResponse {
        fn lease(&self) -> Option<Duration> {
            match &self.expires_in {
                Some(serde_json::Value::Number(n)) => n.as_u64(),
                Some(serde_json::Value::String(s)) => s.parse().ok(),
                _ => None,
            }
            .map(Duration::from_secs)
        }
    }

    #[derive(Deserialize)]
    struct SecretBundle {
        value: Option<String>,
    }

    struct ReqwestConnector;

    #[async_trait]
    impl AzureConnector for ReqwestConnector {
        async fn connect(&self, login: &AzureLogin) -> std::result::Result<KeyVaultSession, VendorError> {
            let client = build_client(None)?;
            let request = match &login.credential {
                AzureCredential::ClientSecret { authority_host, tenant_id, client_id, client_secret } => client
                    .post(join(authority_host, &format!("{}/oauth2/v2.0/token", tenant_id)))
                    .form(&[
                        ("grant_type", "client_credentials"),
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.expose_secret()),
                        ("scope", KEY_VAULT_SCOPE),
                    ]),
                AzureCredential::ManagedIdentity { endpoint, client_id } => {
                    let mut query = vec![
                        ("api-version", "2018-02-01"),
                        ("resource", "https://vault.azure.net"),
                    ];
                    if let Some(client_id) = client_id {
                        query.push(("client_id", client_id.as_str()));
                    }
                    client.get(endpoint).header("Metadata", "true").query(&query)
                }
            };
            let response = request.send().await.map_err(send_error)?;
            let token: TokenResponse = json_response(response).await?;
            let lease = token.lease();
            let api = RestApi { client, token: SecretString::new(token.access_token) };
            Ok(KeyVaultSession { api: Arc::new(api), lease })
        }
    }

    struct RestApi {
        client: Client,
        token: SecretString,
    }

    #[async_trait]
    impl KeyVaultApi for RestApi {
        async fn get_secret(
            &self,
            vault_url: &Url,
            name: &str,
            version: Option<&str>,
        ) -> std::result::Result<SecretString, VendorError> {
            let path = match version {
                Some(version) => format!("secrets/{}/{}", name, version),
                None => format!("secrets/{}", name),
            };
            let response = self
                .client
                .get(join(vault_url.as_str(), &path))
                .query(&[("api-version", KEY_VAULT_API_VERSION)])
                .bearer_auth(self.token.expose_secret())
                .send()
                .await
                .map_err(send_error)?;
            let bundle: SecretBundle = json_response(response).await?;
            Ok(SecretString::new(bundle.value.unwrap_or_default()))
        }
    }
}

#[cfg(not(feature = "azure"))]
mod live {
    use super::*;

    pub(super) fn connector() -> Option<Arc<dyn AzureConnector>> {
        None
    }
}
