//! Delinea (formerly Thycotic) Secret Server backend
//!
//! Three backend ids share this adapter: lookup by secret id, lookup by
//! secret path, and the legacy Thycotic id that reads its own settings
//! section. A reference selects one field of the secret by slug.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::backend::{AuthenticatedClient, ProviderClient, ProviderKind, SecretsProvider, VendorError};
use crate::secrets::auth::{read_trust_bundle, AuthMethod, AuthPlan, Fingerprint, LoginPlan};
use crate::secrets::error::{ErrorKind, Result, SecretsError};
use crate::secrets::schema::{NormalizedParameters, ParameterSchema, ParameterSpec};
use crate::secrets::types::SecretString;

/// Field slugs a reference may select
pub const SELECTABLE_VALUES: &[&str] = &["token", "password", "username", "url", "notes"];

const DEFAULT_CLOUD_TLD: &str = "com";

/// `delinea` (or `thycotic`) section of the providers settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretServerSettings {
    /// e.g. https://pam.example.com/SecretServer
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    /// Windows domain for the password grant
    pub domain: Option<String>,
    /// Pre-issued access token, used when no username/password is set
    pub token: Option<SecretString>,
    #[serde(default)]
    pub cloud_based: bool,
    /// Secret Server Cloud tenant
    pub tenant: Option<String>,
    /// Secret Server Cloud top-level domain (default "com")
    pub tld: Option<String>,
    pub ca_bundle_path: Option<PathBuf>,
}

/// How to obtain a bearer token
#[derive(Debug, Clone)]
pub enum SecretServerGrant {
    Password { username: String, password: SecretString, domain: Option<String> },
    AccessToken(SecretString),
}

/// Everything needed to open a Secret Server session
#[derive(Debug, Clone)]
pub struct SecretServerLogin {
    pub base_url: String,
    pub grant: SecretServerGrant,
    pub ca_bundle: Option<Vec<u8>>,
}

/// How a reference addresses its secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretLocator {
    ById(i64),
    ByPath(String),
}

/// One field of a secret
#[derive(Debug, Clone)]
pub struct SecretItem {
    pub slug: String,
    pub value: SecretString,
}

/// Authenticated Secret Server client plus the token lifetime, if known
pub struct SecretServerSession {
    pub api: Arc<dyn SecretServerApi>,
    pub lease: Option<Duration>,
}

#[async_trait]
pub trait SecretServerConnector: Send + Sync {
    async fn connect(
        &self,
        login: &SecretServerLogin,
    ) -> std::result::Result<SecretServerSession, VendorError>;
}

#[async_trait]
pub trait SecretServerApi: Send + Sync {
    async fn get_secret(&self, locator: &SecretLocator) -> std::result::Result<Vec<SecretItem>, VendorError>;
}

fn login_error_kind(e: &VendorError) -> Option<ErrorKind> {
    match e.status {
        Some(400) | Some(401) | Some(403) => Some(ErrorKind::AuthRejected),
        _ if e.code == "invalid_ca_bundle" => Some(ErrorKind::ProviderNotConfigured),
        _ => None,
    }
}

// Secret Server answers 400 for a path it cannot resolve
fn fetch_error_kind(e: &VendorError) -> Option<ErrorKind> {
    match e.status {
        Some(400) | Some(404) => Some(ErrorKind::ValueNotFound),
        Some(401) | Some(403) => Some(ErrorKind::AuthRejected),
        _ => None,
    }
}

/// Secret Server adapter for one of the three backend ids
pub struct SecretServerProvider {
    kind: ProviderKind,
    settings: Option<SecretServerSettings>,
    connector: Option<Arc<dyn SecretServerConnector>>,
    schema: ParameterSchema,
}

impl fmt::Debug for SecretServerProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretServerProvider")
            .field("kind", &self.kind)
            .field("base_url", &self.settings.as_ref().and_then(|s| s.base_url.as_deref()))
            .field("available", &self.connector.is_some())
            .finish()
    }
}

impl SecretServerProvider {
    pub fn new(
        kind: ProviderKind,
        settings: Option<SecretServerSettings>,
        connector: Option<Arc<dyn SecretServerConnector>>,
    ) -> Self {
        let locator = match kind {
            ProviderKind::DelineaTssPath => ParameterSpec::text(
                "secret_path",
                "Secret path",
                r"The secret's path, e.g. \FolderPath\Secret Name",
            )
            .length(Some(3), Some(300)),
            _ => ParameterSpec::integer(
                "secret_id",
                "Secret ID",
                "The secret id used to select the entry in Secret Server",
                Some(1),
                None,
            ),
        };
        let schema = ParameterSchema::new(vec![
            locator.required(),
            ParameterSpec::selector(
                "selected_value",
                "Return value",
                "Which field of the secret to return",
                SELECTABLE_VALUES,
            )
            .required()
            .aliases(&["secret_selected_value", "selected_field"]),
        ]);
        Self { kind, settings, connector, schema }
    }

    /// Connector backed by reqwest, when compiled in
    pub fn live_connector() -> Option<Arc<dyn SecretServerConnector>> {
        live::connector()
    }

    fn section(&self) -> &'static str {
        match self.kind {
            ProviderKind::ThycoticTss => "thycotic",
            _ => "delinea",
        }
    }

    fn base_url(&self, settings: &SecretServerSettings) -> Result<String> {
        if settings.cloud_based {
            let tenant = settings.tenant.as_deref().filter(|t| !t.is_empty()).ok_or_else(|| {
                SecretsError::not_configured(
                    self.kind.as_str(),
                    format!("'{}.cloud_based' requires 'tenant'", self.section()),
                )
            })?;
            let tld = settings.tld.as_deref().unwrap_or(DEFAULT_CLOUD_TLD);
            return Ok(format!("https://{}.secretservercloud.{}", tenant, tld));
        }
        settings.base_url.clone().filter(|u| !u.is_empty()).ok_or_else(|| {
            SecretsError::not_configured(
                self.kind.as_str(),
                format!("'{}' settings have no 'base_url'", self.section()),
            )
        })
    }

    fn grant(&self, settings: &SecretServerSettings) -> Result<(AuthMethod, SecretServerGrant)> {
        let username = settings.username.clone().filter(|u| !u.is_empty());
        let password = settings.password.clone().filter(|p| !p.is_blank());
        match (username, password) {
            (Some(username), Some(password)) => {
                let domain = settings.domain.clone().filter(|d| !d.is_empty());
                let method = if domain.is_some() { AuthMethod::DomainPassword } else { AuthMethod::Password };
                Ok((method, SecretServerGrant::Password { username, password, domain }))
            }
            _ if settings.cloud_based => Err(SecretsError::auth_config(
                self.kind.as_str(),
                "Secret Server Cloud requires 'username' and 'password'",
            )),
            _ => match settings.token.clone().filter(|t| !t.is_blank()) {
                Some(token) => Ok((AuthMethod::AccessToken, SecretServerGrant::AccessToken(token))),
                None => Err(SecretsError::auth_config(
                    self.kind.as_str(),
                    "either 'username' and 'password' or 'token' must be set",
                )),
            },
        }
    }

    fn locator(&self, params: &NormalizedParameters) -> Result<SecretLocator> {
        match self.kind {
            ProviderKind::DelineaTssPath => Ok(SecretLocator::ByPath(params.require("secret_path")?.to_string())),
            _ => {
                let id = params.require("secret_id")?;
                id.parse::<i64>().map(SecretLocator::ById).map_err(|_| {
                    SecretsError::parameter(self.kind.as_str(), "'secret_id' must be an integer", ["secret_id"])
                })
            }
        }
    }
}

#[async_trait]
impl SecretsProvider for SecretServerProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    fn is_available(&self) -> bool {
        self.connector.is_some()
    }

    fn select_auth(&self, _params: &NormalizedParameters) -> Result<AuthPlan> {
        let settings = self.settings.as_ref().ok_or_else(|| {
            SecretsError::not_configured(
                self.kind.as_str(),
                format!("no '{}' section in the providers settings", self.section()),
            )
        })?;
        let base_url = self.base_url(settings)?;
        let (method, grant) = self.grant(settings)?;
        let ca_bundle = match &settings.ca_bundle_path {
            Some(path) => Some(read_trust_bundle(self.kind, path)?),
            None => None,
        };

        let base = Fingerprint::new(self.kind)
            .field("base_url", &base_url)
            .bytes("ca_bundle", ca_bundle.as_deref());
        let fingerprint = match &grant {
            SecretServerGrant::Password { username, password, domain } => base
                .field("username", username)
                .secret("password", Some(password))
                .optional("domain", domain.as_deref()),
            SecretServerGrant::AccessToken(token) => base.secret("token", Some(token)),
        }
        .finish();

        debug!(provider = %self.kind, auth_method = %method, base_url = %base_url, "Selected Secret Server auth method");

        Ok(AuthPlan {
            provider: self.kind,
            config_name: base_url.clone(),
            method,
            fingerprint,
            login: LoginPlan::SecretServer(SecretServerLogin { base_url, grant, ca_bundle }),
        })
    }

    async fn authenticate(&self, plan: AuthPlan) -> Result<AuthenticatedClient> {
        let LoginPlan::SecretServer(login) = &plan.login else {
            return Err(plan.mismatched(self.kind));
        };
        let connector = self.connector.as_ref().ok_or_else(|| {
            SecretsError::not_configured(self.kind.as_str(), "Secret Server client is not available")
        })?;

        let session = connector
            .connect(login)
            .await
            .map_err(|e| e.classify(self.kind, login_error_kind))?;

        info!(provider = %self.kind, auth_method = %plan.method, base_url = %login.base_url, "Authenticated to Secret Server");

        Ok(AuthenticatedClient::new(ProviderClient::SecretServer(session.api), plan.method)
            .with_lease(session.lease))
    }

    async fn fetch(
        &self,
        client: &AuthenticatedClient,
        params: &NormalizedParameters,
    ) -> Result<SecretString> {
        let ProviderClient::SecretServer(api) = &client.client else {
            return Err(client.client.mismatched(self.kind));
        };
        let locator = self.locator(params)?;
        let selected = params.require("selected_value")?;

        debug!(provider = %self.kind, locator = ?locator, "Fetching Secret Server secret");

        let items = api
            .get_secret(&locator)
            .await
            .map_err(|e| e.classify(self.kind, fetch_error_kind))?;

        self.schema.check_selector(self.kind.as_str(), "selected_value", selected)?;
        items
            .into_iter()
            .find(|item| item.slug == selected)
            .map(|item| item.value)
            .ok_or_else(|| SecretsError::missing_key(self.kind.as_str(), selected))
    }
}

#[cfg(feature = "delinea")]
mod live {
    use super::*;
    use crate::secrets::backends::http::{build_client, join, json_response, send_error};
    use reqwest::Client;

    pub(super) fn connector() -> Option<Arc<dyn SecretServerConnector>> {
        Some(Arc::new(ReqwestConnector))
    }

    #[derive(Deserialize)]
    struct TokenResponse {
        access_token: String,
        expires_in: Option<u64>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct SecretResponse {
        #[serde(default)]
        items: Vec<ItemResponse>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ItemResponse {
        slug: String,
        #[serde(default)]
        item_value: Option<String>,
    }

    /// OAuth2 login plus REST reads with reqwest
    pub(crate) struct ReqwestConnector;

    #[async_trait]
    impl SecretServerConnector for ReqwestConnector {
        async fn connect(
            &self,
            login: &SecretServerLogin,
        ) -> std::result::Result<SecretServerSession, VendorError> {
            let client = build_client(login.ca_bundle.as_deref())?;
            let (token, lease) = match &login.grant {
                SecretServerGrant::AccessToken(token) => (token.clone(), None),
                SecretServerGrant::Password { username, password, domain } => {
                    let mut form = vec![
                        ("grant_type", "password"),
                        ("username", username.as_str()),
                        ("password", password.expose_secret()),
                    ];
                    if let Some(domain) = domain {
                        form.push(("domain", domain.as_str()));
                    }
                    let response = client
                        .post(join(&login.base_url, "oauth2/token"))
                        .form(&form)
                        .send()
                        .await
                        .map_err(send_error)?;
                    let token: TokenResponse = json_response(response).await?;
                    (SecretString::new(token.access_token), token.expires_in.map(Duration::from_secs))
                }
            };
            let api = RestApi { client, base_url: login.base_url.clone(), token };
            Ok(SecretServerSession { api: Arc::new(api), lease })
        }
    }

    struct RestApi {
        client: Client,
        base_url: String,
        token: SecretString,
    }

    #[async_trait]
    impl SecretServerApi for RestApi {
        async fn get_secret(&self, locator: &SecretLocator) -> std::result::Result<Vec<SecretItem>, VendorError> {
            let request = match locator {
                SecretLocator::ById(id) => {
                    self.client.get(join(&self.base_url, &format!("api/v1/secrets/{}", id)))
                }
                SecretLocator::ByPath(path) => self
                    .client
                    .get(join(&self.base_url, "api/v1/secrets/0"))
                    .query(&[("secretPath", path.as_str())]),
            };
            let response = request
                .bearer_auth(self.token.expose_secret())
                .send()
                .await
                .map_err(send_error)?;
            let secret: SecretResponse = json_response(response).await?;
            Ok(secret
                .items
                .into_iter()
                .map(|item| SecretItem {
                    slug: item.slug,
                    value: SecretString::new(item.item_value.unwrap_or_default()),
                })
                .collect())
        }
    }
}

#[cfg(not(feature = "delinea"))]
mod live {
    use super::*;

    pub(super) fn connector() -> Option<Arc<dyn SecretServerConnector>> {
        None
    }
}
