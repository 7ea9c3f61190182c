//! HashiCorp Vault backend
//!
//! Reads one field of a KV v1 or v2 secret. Several named Vault instances can
//! be configured side by side; a reference picks one with its `vault`
//! parameter. Supported logins are token, AppRole, Kubernetes and AWS IAM.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{
    extract_json_key, AuthenticatedClient, ProviderClient, ProviderKind, SecretsProvider,
    VendorError,
};
use crate::secrets::auth::{read_token_file, AuthMethod, AuthPlan, Fingerprint, LoginPlan};
use crate::secrets::error::{ErrorKind, Result, SecretsError};
use crate::secrets::schema::{NormalizedParameters, ParameterSchema, ParameterSpec};
use crate::secrets::types::SecretString;

const KIND: ProviderKind = ProviderKind::HashicorpVault;

pub const DEFAULT_CONFIG_NAME: &str = "default";
pub const DEFAULT_MOUNT_POINT: &str = "secret";
pub const DEFAULT_K8S_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const DEFAULT_IAM_REGION: &str = "us-east-1";

/// Settings for one Vault instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultInstanceSettings {
    pub url: Option<String>,
    /// token (default), approle, kubernetes or aws
    pub auth_method: Option<String>,
    pub token: Option<SecretString>,
    pub role_id: Option<String>,
    pub secret_id: Option<SecretString>,
    /// Role for kubernetes and aws logins
    pub role_name: Option<String>,
    pub k8s_token_path: Option<PathBuf>,
    /// Auth engine mount; defaults to the method name
    pub auth_mount: Option<String>,
    pub namespace: Option<String>,
    /// PEM bundle used to verify the Vault server
    pub ca_cert: Option<PathBuf>,
    /// KV mount used when a reference has no `mount_point`
    pub default_mount_point: Option<String>,
    /// Region used to sign the STS request for aws logins
    pub aws_region: Option<String>,
    /// Value of the X-Vault-AWS-IAM-Server-ID header
    pub iam_server_id: Option<String>,
}

/// Vault section of the providers settings
///
/// Either a single instance at the top level, or named instances under
/// `configs`, or both (the top level then acts as `default`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VaultSettings {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configs: BTreeMap<String, VaultInstanceSettings>,
    #[serde(flatten)]
    pub default: VaultInstanceSettings,
}

impl VaultSettings {
    fn instance(&self, name: &str) -> Option<&VaultInstanceSettings> {
        match self.configs.get(name) {
            Some(instance) => Some(instance),
            None if name == DEFAULT_CONFIG_NAME && self.default.url.is_some() => Some(&self.default),
            None => None,
        }
    }
}

/// KV engine version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvVersion {
    V1,
    V2,
}

impl FromStr for KvVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "v1" | "1" => Ok(Self::V1),
            "v2" | "2" => Ok(Self::V2),
            other => Err(format!("unknown KV version '{}'", other)),
        }
    }
}

/// Credentials for one of the supported Vault logins
#[derive(Debug, Clone)]
pub enum VaultCredentials {
    Token(SecretString),
    AppRole { mount: String, role_id: String, secret_id: SecretString },
    Kubernetes { mount: String, role: String, jwt: SecretString },
    AwsIam { mount: String, role: Option<String>, region: String, server_id: Option<String> },
}

/// Everything needed to log in to one Vault instance
#[derive(Debug, Clone)]
pub struct VaultLogin {
    pub url: String,
    pub namespace: Option<String>,
    pub ca_cert: Option<PathBuf>,
    pub credentials: VaultCredentials,
}

/// Logged-in Vault client plus the token lease, if any
pub struct VaultSession {
    pub kv: Arc<dyn VaultKv>,
    pub lease: Option<Duration>,
}

/// Logs in to Vault
#[async_trait]
pub trait VaultConnector: Send + Sync {
    async fn login(&self, login: &VaultLogin) -> std::result::Result<VaultSession, VendorError>;
}

/// KV reads with an authenticated Vault client
#[async_trait]
pub trait VaultKv: Send + Sync {
    /// Read the data of the secret at `path`; for v2 this is the inner `data` map.
    async fn read(
        &self,
        mount: &str,
        path: &str,
        version: KvVersion,
    ) -> std::result::Result<serde_json::Value, VendorError>;
}

fn login_error_kind(e: &VendorError) -> Option<ErrorKind> {
    match e.status {
        Some(400) | Some(401) | Some(403) => Some(ErrorKind::AuthRejected),
        _ if e.code == "aws_credentials" => Some(ErrorKind::AuthConfig),
        _ if e.code == "invalid_settings" => Some(ErrorKind::ProviderNotConfigured),
        _ => None,
    }
}

fn read_error_kind(e: &VendorError) -> Option<ErrorKind> {
    match e.status {
        Some(404) => Some(ErrorKind::ValueNotFound),
        Some(401) | Some(403) => Some(ErrorKind::AuthRejected),
        Some(400) => Some(ErrorKind::Parameter),
        _ => None,
    }
}

/// HashiCorp Vault adapter
pub struct VaultProvider {
    settings: Option<VaultSettings>,
    connector: Option<Arc<dyn VaultConnector>>,
    schema: ParameterSchema,
}

impl fmt::Debug for VaultProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultProvider")
            .field("configs", &self.settings.as_ref().map(|s| s.configs.keys().collect::<Vec<_>>()))
            .field("available", &self.connector.is_some())
            .finish()
    }
}

impl VaultProvider {
    pub fn new(settings: Option<VaultSettings>, connector: Option<Arc<dyn VaultConnector>>) -> Self {
        let schema = ParameterSchema::new(vec![
            ParameterSpec::text("path", "Secret path", "The path to the secret within the KV mount")
                .required(),
            ParameterSpec::text("key", "Key", "The key of the value within the secret").required(),
            ParameterSpec::text(
                "mount_point",
                "Mount point",
                "KV mount holding the secret (defaults to 'secret')",
            ),
            ParameterSpec::choice("kv_version", "KV version", "KV engine version", &["v1", "v2"]),
            ParameterSpec::text("vault", "Vault", "Named Vault configuration to use"),
        ]);
        Self { settings, connector, schema }
    }

    /// Connector backed by vaultrs, when compiled in
    pub fn live_connector() -> Option<Arc<dyn VaultConnector>> {
        live::connector()
    }

    fn instance(&self, config_name: &str) -> Result<&VaultInstanceSettings> {
        let settings = self.settings.as_ref().ok_or_else(|| {
            SecretsError::not_configured(KIND.as_str(), "no 'vault' section in the providers settings")
        })?;
        settings.instance(config_name).ok_or_else(|| {
            SecretsError::not_configured(
                KIND.as_str(),
                format!("no Vault configuration named '{}'", config_name),
            )
        })
    }

    fn credentials(instance: &VaultInstanceSettings) -> Result<(AuthMethod, VaultCredentials)> {
        let method = instance.auth_method.as_deref().unwrap_or("token");
        let mount = |default: &str| instance.auth_mount.clone().unwrap_or_else(|| default.to_string());
        match method {
            "token" => {
                let token = instance.token.clone().filter(|t| !t.is_blank()).ok_or_else(|| {
                    SecretsError::auth_config(KIND.as_str(), "token auth requires 'token'")
                })?;
                Ok((AuthMethod::Token, VaultCredentials::Token(token)))
            }
            "approle" => {
                let role_id = instance.role_id.clone().filter(|r| !r.is_empty());
                let secret_id = instance.secret_id.clone().filter(|s| !s.is_blank());
                match (role_id, secret_id) {
                    (Some(role_id), Some(secret_id)) => Ok((
                        AuthMethod::AppRole,
                        VaultCredentials::AppRole { mount: mount("approle"), role_id, secret_id },
                    )),
                    _ => Err(SecretsError::auth_config(
                        KIND.as_str(),
                        "approle auth requires 'role_id' and 'secret_id'",
                    )),
                }
            }
            "kubernetes" => {
                let role = instance.role_name.clone().filter(|r| !r.is_empty()).ok_or_else(|| {
                    SecretsError::auth_config(KIND.as_str(), "kubernetes auth requires 'role_name'")
                })?;
                let token_path = instance
                    .k8s_token_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_K8S_TOKEN_PATH));
                let jwt = read_token_file(KIND, &token_path)?;
                Ok((
                    AuthMethod::Kubernetes,
                    VaultCredentials::Kubernetes { mount: mount("kubernetes"), role, jwt },
                ))
            }
            "aws" => {
                if !cfg!(feature = "aws") {
                    return Err(SecretsError::auth_config(
                        KIND.as_str(),
                        "aws auth requires latchkey to be built with the 'aws' feature",
                    ));
                }
                Ok((
                    AuthMethod::AwsIam,
                    VaultCredentials::AwsIam {
                        mount: mount("aws"),
                        role: instance.role_name.clone().filter(|r| !r.is_empty()),
                        region: instance
                            .aws_region
                            .clone()
                            .unwrap_or_else(|| DEFAULT_IAM_REGION.to_string()),
                        server_id: instance.iam_server_id.clone(),
                    },
                ))
            }
            other => Err(SecretsError::auth_config(
                KIND.as_str(),
                format!(
                    "unknown auth_method '{}'; expected token, approle, kubernetes or aws",
                    other
                ),
            )),
        }
    }
}

fn fingerprint(login: &VaultLogin) -> String {
    let base = Fingerprint::new(KIND)
        .field("url", &login.url)
        .optional("namespace", login.namespace.as_deref())
        .optional("ca_cert", login.ca_cert.as_ref().map(|p| p.display().to_string()));
    let fingerprint = match &login.credentials {
        VaultCredentials::Token(token) => base.field("method", "token").secret("token", Some(token)),
        VaultCredentials::AppRole { mount, role_id, secret_id } => base
            .field("method", "approle")
            .field("mount", mount)
            .field("role_id", role_id)
            .secret("secret_id", Some(secret_id)),
        VaultCredentials::Kubernetes { mount, role, jwt } => base
            .field("method", "kubernetes")
            .field("mount", mount)
            .field("role", role)
            .secret("jwt", Some(jwt)),
        VaultCredentials::AwsIam { mount, role, region, server_id } => base
            .field("method", "aws")
            .field("mount", mount)
            .optional("role", role.as_deref())
            .field("region", region)
            .optional("server_id", server_id.as_deref()),
    };
    fingerprint.finish()
}

#[async_trait]
impl SecretsProvider for VaultProvider {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    fn is_available(&self) -> bool {
        self.connector.is_some()
    }

    fn select_auth(&self, params: &NormalizedParameters) -> Result<AuthPlan> {
        let config_name = params.get_or("vault", DEFAULT_CONFIG_NAME);
        let instance = self.instance(config_name)?;
        let url = instance.url.clone().filter(|u| !u.is_empty()).ok_or_else(|| {
            SecretsError::not_configured(
                KIND.as_str(),
                format!("Vault configuration '{}' has no 'url'", config_name),
            )
        })?;
        let (method, credentials) = Self::credentials(instance)?;
        let login = VaultLogin {
            url,
            namespace: instance.namespace.clone(),
            ca_cert: instance.ca_cert.clone(),
            credentials,
        };

        debug!(config_name = %config_name, auth_method = %method, "Selected Vault auth method");

        Ok(AuthPlan {
            provider: KIND,
            config_name: config_name.to_string(),
            method,
            fingerprint: fingerprint(&login),
            login: LoginPlan::Vault(login),
        })
    }

    async fn authenticate(&self, plan: AuthPlan) -> Result<AuthenticatedClient> {
        let LoginPlan::Vault(login) = &plan.login else {
            return Err(plan.mismatched(KIND));
        };
        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| SecretsError::not_configured(KIND.as_str(), "Vault client is not available"))?;

        let session =
            connector.login(login).await.map_err(|e| e.classify(KIND, login_error_kind))?;

        info!(
            config_name = %plan.config_name,
            auth_method = %plan.method,
            url = %login.url,
            "Authenticated to Vault"
        );

        Ok(AuthenticatedClient::new(ProviderClient::Vault(session.kv), plan.method)
            .with_lease(session.lease))
    }

    async fn fetch(
        &self,
        client: &AuthenticatedClient,
        params: &NormalizedParameters,
    ) -> Result<SecretString> {
        let ProviderClient::Vault(kv) = &client.client else {
            return Err(client.client.mismatched(KIND));
        };
        let path = params.require("path")?;
        let key = params.require("key")?;
        let default_mount = self
            .instance(params.get_or("vault", DEFAULT_CONFIG_NAME))
            .ok()
            .and_then(|i| i.default_mount_point.as_deref())
            .unwrap_or(DEFAULT_MOUNT_POINT);
        let mount = params.get_or("mount_point", default_mount);
        let version = match params.get("kv_version") {
            Some(v) => v.parse::<KvVersion>().map_err(|e| {
                SecretsError::parameter(KIND.as_str(), e, ["kv_version"])
            })?,
            None => KvVersion::V2,
        };

        debug!(mount = %mount, path = %path, kv_version = ?version, "Reading Vault secret");

        let data = kv
            .read(mount, path, version)
            .await
            .map_err(|e| e.classify(KIND, read_error_kind))?;
        extract_json_key(KIND, &data, key)
    }
}

#[cfg(feature = "vault")]
mod live {
    use super::*;
    use vaultrs::auth::{approle, kubernetes};
    use vaultrs::client::{Client, VaultClient, VaultClientSettingsBuilder};
    use vaultrs::error::ClientError;
    use vaultrs::{kv1, kv2};

    pub(super) fn connector() -> Option<Arc<dyn VaultConnector>> {
        Some(Arc::new(VaultrsConnector))
    }

    fn client_error(e: ClientError) -> VendorError {
        match e {
            ClientError::APIError { code, errors } => VendorError::http(code, errors.join("; ")),
            other => VendorError::transport(other.to_string()),
        }
    }

    /// Logs in with the vaultrs client
    struct VaultrsConnector;

    #[async_trait]
    impl VaultConnector for VaultrsConnector {
        async fn login(&self, login: &VaultLogin) -> std::result::Result<VaultSession, VendorError> {
            let mut builder = VaultClientSettingsBuilder::default();
            builder.address(&login.url);
            if let Some(namespace) = &login.namespace {
                builder.namespace(Some(namespace.clone()));
            }
            if let Some(ca_cert) = &login.ca_cert {
                builder.ca_certs(vec![ca_cert.display().to_string()]);
            }
            let settings = builder
                .build()
                .map_err(|e| VendorError::new("invalid_settings", e.to_string()))?;
            let mut client = VaultClient::new(settings).map_err(client_error)?;

            let lease = match &login.credentials {
                VaultCredentials::Token(token) => {
                    client.set_token(token.expose_secret());
                    None
                }
                VaultCredentials::AppRole { mount, role_id, secret_id } => {
                    let auth = approle::login(&client, mount, role_id, secret_id.expose_secret())
                        .await
                        .map_err(client_error)?;
                    client.set_token(&auth.client_token);
                    Some(Duration::from_secs(auth.lease_duration))
                }
                VaultCredentials::Kubernetes { mount, role, jwt } => {
                    let auth = kubernetes::login(&client, mount, role, jwt.expose_secret())
                        .await
                        .map_err(client_error)?;
                    client.set_token(&auth.client_token);
                    Some(Duration::from_secs(auth.lease_duration))
                }
                VaultCredentials::AwsIam { mount, role, region, server_id } => {
                    let auth = aws_iam::login(&client, mount, role.as_deref(), region, server_id.as_deref())
                        .await?;
                    client.set_token(&auth.client_token);
                    Some(Duration::from_secs(auth.lease_duration))
                }
            };

            Ok(VaultSession { kv: Arc::new(VaultrsKv { client }), lease })
        }
    }

    struct VaultrsKv {
        client: VaultClient,
    }

    #[async_trait]
    impl VaultKv for VaultrsKv {
        async fn read(
            &self,
            mount: &str,
            path: &str,
            version: KvVersion,
        ) -> std::result::Result<serde_json::Value, VendorError> {
            match version {
                KvVersion::V1 => kv1::get(&self.client, mount, path).await.map_err(client_error),
                KvVersion::V2 => kv2::read(&self.client, mount, path).await.map_err(client_error),
            }
        }
    }

    #[cfg(feature = "aws")]
    mod aws_iam {
        use super::*;
        use aws_config::{BehaviorVersion, Region};
        use aws_credential_types::provider::ProvideCredentials;
        use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
        use aws_sigv4::sign::v4;
        use aws_smithy_runtime_api::client::identity::Identity;
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        use std::time::SystemTime;
        use vaultrs::api::AuthInfo;

        const STS_BODY: &str = "Action=GetCallerIdentity&Version=2011-06-15";

        fn sts_host(region: &str) -> String {
            if region == DEFAULT_IAM_REGION {
                "sts.amazonaws.com".to_string()
            } else {
                format!("sts.{}.amazonaws.com", region)
            }
        }

        fn signing_error(e: impl fmt::Display) -> VendorError {
            VendorError::new("aws_signing", e.to_string())
        }

        /// Sign an STS GetCallerIdentity request and present it to Vault.
        pub(super) async fn login(
            client: &VaultClient,
            mount: &str,
            role: Option<&str>,
            region: &str,
            server_id: Option<&str>,
        ) -> std::result::Result<AuthInfo, VendorError> {
            let sdk_config = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region.to_string()))
                .load()
                .await;
            let provider = sdk_config.credentials_provider().ok_or_else(|| {
                VendorError::new("aws_credentials", "no AWS credential provider is configured")
            })?;
            let credentials = provider
                .provide_credentials()
                .await
                .map_err(|e| VendorError::new("aws_credentials", e.to_string()))?;
            let identity: Identity = credentials.into();

            let host = sts_host(region);
            let url = format!("https://{}/", host);
            let mut headers = vec![
                ("host".to_string(), host.clone()),
                (
                    "content-type".to_string(),
                    "application/x-www-form-urlencoded; charset=utf-8".to_string(),
                ),
            ];
            if let Some(server_id) = server_id {
                headers.push(("x-vault-aws-iam-server-id".to_string(), server_id.to_string()));
            }

            let params = v4::SigningParams::builder()
                .identity(&identity)
                .region(region)
                .name("sts")
                .time(SystemTime::now())
                .settings(SigningSettings::default())
                .build()
                .map_err(signing_error)?
                .into();
            let signable = SignableRequest::new(
                "POST",
                &url,
                headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                SignableBody::Bytes(STS_BODY.as_bytes()),
            )
            .map_err(signing_error)?;
            let (instructions, _signature) = sign(signable, &params).map_err(signing_error)?.into_parts();
            let (signed_headers, _query) = instructions.into_parts();

            let mut header_map: BTreeMap<String, Vec<String>> = headers
                .into_iter()
                .map(|(k, v)| (k, vec![v]))
                .collect();
            for header in signed_headers {
                header_map.insert(header.name().to_string(), vec![header.value().to_string()]);
            }
            let encoded_headers = serde_json::to_string(&header_map).map_err(signing_error)?;

            vaultrs::auth::aws::iam_login(
                client,
                mount,
                "POST",
                &STANDARD.encode(&url),
                &STANDARD.encode(encoded_headers),
                &STANDARD.encode(STS_BODY),
                role,
            )
            .await
            .map_err(client_error)
        }
    }

    #[cfg(not(feature = "aws"))]
    mod aws_iam {
        use super::*;
        use vaultrs::api::AuthInfo;

        pub(super) async fn login(
            _client: &VaultClient,
            _mount: &str,
            _role: Option<&str>,
            _region: &str,
            _server_id: Option<&str>,
        ) -> std::result::Result<AuthInfo, VendorError> {
            Err(VendorError::new("aws_credentials", "built without the 'aws' feature"))
        }
    }
}

#[cfg(not(feature = "vault"))]
mod live {
    use super::*;

    pub(super) fn connector() -> Option<Arc<dyn VaultConnector>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockVault {
        logins: AtomicUsize,
        reads: AtomicUsize,
        login_error: Option<VendorError>,
        read_error: Option<VendorError>,
        last_read: Mutex<Option<(String, String, KvVersion)>>,
    }

    #[async_trait]
    impl VaultKv for MockVault {
        async fn read(
            &self,
            mount: &str,
            path: &str,
            version: KvVersion,
        ) -> std::result::Result<serde_json::Value, VendorError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            *self.last_read.lock().unwrap() = Some((mount.to_string(), path.to_string(), version));
            match &self.read_error {
                Some(e) => Err(e.clone()),
                None => Ok(json!({"location": "world"})),
            }
        }
    }

    struct MockConnector(Arc<MockVault>);

    #[async_trait]
    impl VaultConnector for MockConnector {
        async fn login(&self, _login: &VaultLogin) -> std::result::Result<VaultSession, VendorError> {
            self.0.logins.fetch_add(1, Ordering::SeqCst);
            match &self.0.login_error {
                Some(e) => Err(e.clone()),
                None => Ok(VaultSession { kv: self.0.clone(), lease: Some(Duration::from_secs(3600)) }),
            }
        }
    }

    fn token_instance() -> VaultInstanceSettings {
        VaultInstanceSettings {
            url: Some("https://vault.example.com:8200".to_string()),
            token: Some(SecretString::new("s.token")),
            ..Default::default()
        }
    }

    fn provider_with(instance: VaultInstanceSettings, mock: Arc<MockVault>) -> VaultProvider {
        let settings = VaultSettings { default: instance, ..Default::default() };
        VaultProvider::new(Some(settings), Some(Arc::new(MockConnector(mock))))
    }

    fn params(provider: &VaultProvider, pairs: &[(&str, &str)]) -> NormalizedParameters {
        let raw = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        provider.validate(&raw).unwrap()
    }

    async fn resolve(provider: &VaultProvider, params: &NormalizedParameters) -> Result<SecretString> {
        let plan = provider.select_auth(params)?;
        let client = provider.authenticate(plan).await?;
        provider.fetch(&client, params).await
    }

    #[tokio::test]
    async fn test_token_read_v2_default_mount() {
        let mock = Arc::new(MockVault::default());
        let provider = provider_with(token_instance(), mock.clone());
        let p = params(&provider, &[("path", "hello"), ("key", "location")]);

        let value = resolve(&provider, &p).await.unwrap();
        assert_eq!(value.expose_secret(), "world");
        assert_eq!(
            *mock.last_read.lock().unwrap(),
            Some(("secret".to_string(), "hello".to_string(), KvVersion::V2))
        );
    }

    #[tokio::test]
    async fn test_mount_point_and_kv_version_parameters() {
        let mock = Arc::new(MockVault::default());
        let provider = provider_with(token_instance(), mock.clone());
        let p = params(
            &provider,
            &[("path", "hello"), ("key", "location"), ("mount_point", "kv"), ("kv_version", "v1")],
        );
        resolve(&provider, &p).await.unwrap();
        assert_eq!(
            *mock.last_read.lock().unwrap(),
            Some(("kv".to_string(), "hello".to_string(), KvVersion::V1))
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_value_not_found() {
        let mock = Arc::new(MockVault::default());
        let provider = provider_with(token_instance(), mock);
        let p = params(&provider, &[("path", "hello"), ("key", "missing")]);
        let err = resolve(&provider, &p).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueNotFound);
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn test_read_error_mapping() {
        for (status, kind) in [
            (404, ErrorKind::ValueNotFound),
            (403, ErrorKind::AuthRejected),
            (400, ErrorKind::Parameter),
            (500, ErrorKind::Provider),
            (503, ErrorKind::Provider),
        ] {
            let mock = Arc::new(MockVault {
                read_error: Some(VendorError::http(status, "error")),
                ..Default::default()
            });
            let provider = provider_with(token_instance(), mock);
            let p = params(&provider, &[("path", "hello"), ("key", "location")]);
            assert_eq!(resolve(&provider, &p).await.unwrap_err().kind(), kind, "status {}", status);
        }
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let mock = Arc::new(MockVault {
            login_error: Some(VendorError::http(400, "invalid role or secret ID")),
            ..Default::default()
        });
        let instance = VaultInstanceSettings {
            auth_method: Some("approle".to_string()),
            role_id: Some("role".to_string()),
            secret_id: Some(SecretString::new("secret")),
            token: None,
            ..token_instance()
        };
        let provider = provider_with(instance, mock);
        let p = params(&provider, &[("path", "hello"), ("key", "location")]);
        assert_eq!(resolve(&provider, &p).await.unwrap_err().kind(), ErrorKind::AuthRejected);
    }

    #[test]
    fn test_kubernetes_without_role_name_is_auth_config() {
        let mock = Arc::new(MockVault::default());
        let instance = VaultInstanceSettings {
            auth_method: Some("kubernetes".to_string()),
            token: None,
            ..token_instance()
        };
        let provider = provider_with(instance, mock.clone());
        let p = params(&provider, &[("path", "hello"), ("key", "location")]);
        let err = provider.select_auth(&p).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthConfig);
        assert_eq!(mock.logins.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_kubernetes_reads_token_file() {
        let mut token_file = tempfile::NamedTempFile::new().unwrap();
        write!(token_file, "k8s-jwt").unwrap();
        let instance = VaultInstanceSettings {
            auth_method: Some("kubernetes".to_string()),
            role_name: Some("latchkey".to_string()),
            k8s_token_path: Some(token_file.path().to_path_buf()),
            token: None,
            ..token_instance()
        };
        let provider = provider_with(instance, Arc::new(MockVault::default()));
        let p = params(&provider, &[("path", "hello"), ("key", "location")]);
        let plan = provider.select_auth(&p).unwrap();
        assert_eq!(plan.method, AuthMethod::Kubernetes);
        match plan.login {
            LoginPlan::Vault(VaultLogin {
                credentials: VaultCredentials::Kubernetes { mount, role, jwt },
                ..
            }) => {
                assert_eq!(mount, "kubernetes");
                assert_eq!(role, "latchkey");
                assert_eq!(jwt.expose_secret(), "k8s-jwt");
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_auth_config_errors() {
        let cases = [
            VaultInstanceSettings { token: None, ..token_instance() },
            VaultInstanceSettings {
                auth_method: Some("approle".to_string()),
                role_id: Some("role".to_string()),
                ..token_instance()
            },
            VaultInstanceSettings { auth_method: Some("ldap".to_string()), ..token_instance() },
        ];
        for instance in cases {
            let provider = provider_with(instance, Arc::new(MockVault::default()));
            let p = params(&provider, &[("path", "hello"), ("key", "location")]);
            assert_eq!(provider.select_auth(&p).unwrap_err().kind(), ErrorKind::AuthConfig);
        }
    }

    #[test]
    fn test_missing_settings_and_url_are_not_configured() {
        let provider = VaultProvider::new(None, Some(Arc::new(MockConnector(Arc::new(MockVault::default())))));
        let p = params(&provider, &[("path", "hello"), ("key", "location")]);
        assert_eq!(provider.select_auth(&p).unwrap_err().kind(), ErrorKind::ProviderNotConfigured);

        let provider = provider_with(
            VaultInstanceSettings { url: None, ..token_instance() },
            Arc::new(MockVault::default()),
        );
        assert_eq!(provider.select_auth(&p).unwrap_err().kind(), ErrorKind::ProviderNotConfigured);
    }

    #[test]
    fn test_named_configs_do_not_fall_back() {
        let mut configs = BTreeMap::new();
        configs.insert("primary".to_string(), token_instance());
        configs.insert(
            "dr".to_string(),
            VaultInstanceSettings {
                url: Some("https://vault-dr.example.com:8200".to_string()),
                ..token_instance()
            },
        );
        let settings = VaultSettings { configs, default: VaultInstanceSettings::default() };
        let provider = VaultProvider::new(
            Some(settings),
            Some(Arc::new(MockConnector(Arc::new(MockVault::default())))),
        );

        let primary = provider
            .select_auth(&params(&provider, &[("path", "a"), ("key", "b"), ("vault", "primary")]))
            .unwrap();
        let dr = provider
            .select_auth(&params(&provider, &[("path", "a"), ("key", "b"), ("vault", "dr")]))
            .unwrap();
        assert_eq!(primary.config_name, "primary");
        assert_ne!(primary.cache_key(), dr.cache_key());

        let err = provider
            .select_auth(&params(&provider, &[("path", "a"), ("key", "b"), ("vault", "staging")]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderNotConfigured);
        let err = provider.select_auth(&params(&provider, &[("path", "a"), ("key", "b")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderNotConfigured);
    }

    #[test]
    fn test_fingerprint_tracks_token_rotation() {
        let provider_a = provider_with(token_instance(), Arc::new(MockVault::default()));
        let provider_b = provider_with(
            VaultInstanceSettings { token: Some(SecretString::new("s.rotated")), ..token_instance() },
            Arc::new(MockVault::default()),
        );
        let p = params(&provider_a, &[("path", "hello"), ("key", "location")]);
        assert_ne!(
            provider_a.select_auth(&p).unwrap().fingerprint,
            provider_b.select_auth(&p).unwrap().fingerprint
        );
    }

    #[test]
    fn test_settings_deserialize_single_and_named() {
        let single: VaultSettings = serde_json::from_value(json!({
            "url": "https://vault:8200",
            "auth_method": "approle",
            "role_id": "r",
            "secret_id": "s"
        }))
        .unwrap();
        assert!(single.instance("default").is_some());

        let named: VaultSettings = serde_json::from_value(json!({
            "configs": {"default": {"url": "https://vault:8200", "token": "t"}}
        }))
        .unwrap();
        assert_eq!(named.instance("default").and_then(|i| i.url.as_deref()), Some("https://vault:8200"));
    }
}
