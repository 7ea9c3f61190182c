//! Bitwarden Secrets Manager backend
//!
//! Secret values are end-to-end encrypted, so reads go through the `bws` CLI,
//! which decrypts them with the machine account's access token. The API and
//! identity URLs are written to a CLI profile file at login.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::backend::{AuthenticatedClient, ProviderClient, ProviderKind, SecretsProvider, VendorError};
use crate::secrets::auth::{AuthMethod, AuthPlan, Fingerprint, LoginPlan};
use crate::secrets::error::{ErrorKind, Result, SecretsError};
use crate::secrets::schema::{NormalizedParameters, ParameterSchema, ParameterSpec};
use crate::secrets::types::SecretString;

const KIND: ProviderKind = ProviderKind::Bitwarden;

const DEFAULT_EXECUTABLE: &str = "bws";

/// `bitwarden` section of the providers settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BitwardenSettings {
    pub api_url: Option<String>,
    pub identity_url: Option<String>,
    /// Machine account access token
    pub token: Option<SecretString>,
    /// Organization that name lookups are restricted to
    pub org_id: Option<String>,
    /// Defaults to `bws` on the PATH
    pub bws_executable_path: Option<PathBuf>,
    /// Where CLI profile files are written; defaults to the temp dir
    pub profile_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BitwardenLogin {
    pub executable: PathBuf,
    pub api_url: String,
    pub identity_url: String,
    pub token: SecretString,
    pub config_file: PathBuf,
}

/// A secret as listed, without its value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSummary {
    pub id: String,
    pub organization_id: String,
    pub key: String,
}

#[async_trait]
pub trait BitwardenConnector: Send + Sync {
    /// Log in with the access token and return a client for it.
    async fn connect(&self, login: &BitwardenLogin) -> std::result::Result<Arc<dyn BitwardenApi>, VendorError>;
}

#[async_trait]
pub trait BitwardenApi: Send + Sync {
    /// Decrypted value of the secret with this id.
    async fn get(&self, id: &str) -> std::result::Result<SecretString, VendorError>;

    /// Every secret the machine account can read in `org_id`.
    async fn list(&self, org_id: &str) -> std::result::Result<Vec<SecretSummary>, VendorError>;
}

fn error_kind(e: &VendorError) -> Option<ErrorKind> {
    match e.code.as_str() {
        "access_denied" => Some(ErrorKind::AuthRejected),
        "not_found" => Some(ErrorKind::ValueNotFound),
        "spawn" => Some(ErrorKind::ProviderNotConfigured),
        _ => None,
    }
}

/// Sort CLI output into the codes [`error_kind`] knows.
pub fn cli_error_code(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("invalid_client") {
        "access_denied"
    } else if lower.contains("404") || lower.contains("not found") {
        "not_found"
    } else {
        "exit_status"
    }
}

/// Check the `0.<client id>.<client secret>:<encryption key>` token layout.
fn check_token_format(token: &SecretString) -> Result<()> {
    let well_formed = token.expose_secret().split_once(':').is_some_and(|(credentials, key)| {
        let parts: Vec<&str> = credentials.split('.').collect();
        !key.is_empty()
            && parts.len() == 3
            && parts[0] == "0"
            && Uuid::parse_str(parts[1]).is_ok()
            && !parts[2].is_empty()
    });
    if well_formed {
        Ok(())
    } else {
        Err(SecretsError::auth_config(
            KIND.as_str(),
            "the Bitwarden access token is not in the '0.<client id>.<client secret>:<key>' format",
        ))
    }
}

/// Bitwarden Secrets Manager adapter
pub struct BitwardenProvider {
    settings: Option<BitwardenSettings>,
    connector: Option<Arc<dyn BitwardenConnector>>,
    schema: ParameterSchema,
}

impl fmt::Debug for BitwardenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitwardenProvider")
            .field("org_id", &self.settings.as_ref().and_then(|s| s.org_id.as_deref()))
            .field("available", &self.connector.is_some())
            .finish()
    }
}

impl BitwardenProvider {
    pub fn new(settings: Option<BitwardenSettings>, connector: Option<Arc<dyn BitwardenConnector>>) -> Self {
        let schema = ParameterSchema::new(vec![
            ParameterSpec::text("secret_name", "Secret Name", "The name of the secret in Bitwarden Secrets Manager"),
            ParameterSpec::uuid("secret_id", "Secret ID", "The UUID of the secret in Bitwarden Secrets Manager"),
        ])
        .one_of(&["secret_id", "secret_name"]);
        Self { settings, connector, schema }
    }

    /// Connector that spawns the `bws` CLI, when compiled in
    pub fn live_connector() -> Option<Arc<dyn BitwardenConnector>> {
        live::connector()
    }

    fn settings(&self) -> Result<&BitwardenSettings> {
        self.settings
            .as_ref()
            .ok_or_else(|| SecretsError::not_configured(KIND.as_str(), "Bitwarden is not configured"))
    }

    fn org_id(&self) -> Result<&str> {
        let org_id = self
            .settings()?
            .org_id
            .as_deref()
            .filter(|o| !o.is_empty())
            .ok_or_else(|| missing_setting("an organization ID"))?;
        if Uuid::parse_str(org_id).is_err() {
            return Err(SecretsError::not_configured(
                KIND.as_str(),
                format!("Bitwarden 'org_id' must be a UUID, got '{}'", org_id),
            ));
        }
        Ok(org_id)
    }
}

fn missing_setting(what: &str) -> SecretsError {
    SecretsError::not_configured(KIND.as_str(), format!("Bitwarden configuration is missing {}", what))
}

fn required_url(value: Option<&str>, what: &str, name: &str) -> Result<String> {
    let value = value.filter(|v| !v.is_empty()).ok_or_else(|| missing_setting(what))?;
    match Url::parse(value) {
        Ok(url) if url.host_str().is_some() => Ok(value.trim_end_matches('/').to_string()),
        _ => Err(SecretsError::not_configured(
            KIND.as_str(),
            format!("Bitwarden '{}' must be an absolute URL, got '{}'", name, value),
        )),
    }
}

#[async_trait]
impl SecretsProvider for BitwardenProvider {
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
        let settings = self.settings()?;
        let api_url = required_url(settings.api_url.as_deref(), "an API URL", "api_url")?;
        let identity_url = required_url(settings.identity_url.as_deref(), "an Identity URL", "identity_url")?;
        let token = settings
            .token
            .clone()
            .filter(|t| !t.is_blank())
            .ok_or_else(|| missing_setting("an access token"))?;
        check_token_format(&token)?;
        let org_id = self.org_id()?;
        let executable = settings
            .bws_executable_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EXECUTABLE));

        let fingerprint = Fingerprint::new(KIND)
            .field("api_url", &api_url)
            .field("identity_url", &identity_url)
            .field("org_id", org_id)
            .field("executable", executable.display().to_string())
            .secret("token", Some(&token))
            .finish();
        let stem = fingerprint.get(..16).unwrap_or(&fingerprint);
        let config_file = settings
            .profile_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join(format!("latchkey-bws-{}.toml", stem));

        Ok(AuthPlan {
            provider: KIND,
            config_name: org_id.to_string(),
            method: AuthMethod::AccessToken,
            fingerprint,
            login: LoginPlan::Bitwarden(BitwardenLogin { executable, api_url, identity_url, token, config_file }),
        })
    }

    async fn authenticate(&self, plan: AuthPlan) -> Result<AuthenticatedClient> {
        let LoginPlan::Bitwarden(login) = &plan.login else {
            return Err(plan.mismatched(KIND));
        };
        let connector = self.connector.as_ref().ok_or_else(|| {
            SecretsError::not_configured(KIND.as_str(), "Bitwarden CLI support is not available")
        })?;
        let api = connector.connect(login).await.map_err(|e| e.classify(KIND, error_kind))?;

        info!(organization = %plan.config_name, api_url = %login.api_url, "Authenticated to Bitwarden");
        Ok(AuthenticatedClient::new(ProviderClient::Bitwarden(api), plan.method))
    }

    async fn fetch(
        &self,
        client: &AuthenticatedClient,
        params: &NormalizedParameters,
    ) -> Result<SecretString> {
        let ProviderClient::Bitwarden(api) = &client.client else {
            return Err(client.client.mismatched(KIND));
        };

        let id = match (params.get("secret_id"), params.get("secret_name")) {
            (Some(id), _) => id.to_string(),
            (None, Some(name)) => {
                let org_id = self.org_id()?;
                debug!(name = %name, organization = %org_id, "Looking up Bitwarden secret by name");
                let listed = api.list(org_id).await.map_err(|e| e.classify(KIND, error_kind))?;
                let mut matches = listed.into_iter().filter(|s| s.key == name && s.organization_id == org_id);
                match (matches.next(), matches.next()) {
                    (Some(summary), None) => summary.id,
                    (Some(_), Some(_)) => {
                        return Err(SecretsError::not_found(
                            KIND.as_str(),
                            format!("Multiple secrets found with identical name '{}'", name),
                        ))
                    }
                    (None, _) => {
                        return Err(SecretsError::not_found(
                            KIND.as_str(),
                            format!("no secret named '{}' in organization {}", name, org_id),
                        ))
                    }
                }
            }
            (None, None) => {
                return Err(SecretsError::parameter(
                    KIND.as_str(),
                    "One of 'secret_id' or 'secret_name' must be provided",
                    ["secret_id", "secret_name"],
                ))
            }
        };

        debug!(secret_id = %id, "Fetching Bitwarden secret");
        let value = api.get(&id).await.map_err(|e| e.classify(KIND, error_kind))?;
        if value.is_empty() {
            return Err(SecretsError::not_found(KIND.as_str(), format!("secret '{}' has an empty value", id)));
        }
        Ok(value)
    }
}

#[cfg(feature = "bitwarden")]
mod live {
    use super::*;
    use serde::de::DeserializeOwned;
    use std::collections::BTreeMap;
    use tokio::process::Command;

    const PROFILE: &str = "latchkey";

    pub(super) fn connector() -> Option<Arc<dyn BitwardenConnector>> {
        Some(Arc::new(ProcessConnector))
    }

    #[derive(Serialize)]
    struct CliConfig<'a> {
        profiles: BTreeMap<&'a str, CliProfile<'a>>,
    }

    #[derive(Serialize)]
    struct CliProfile<'a> {
        server_api: &'a str,
        server_identity: &'a str,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Secret {
        id: String,
        organization_id: String,
        key: String,
        #[serde(default)]
        value: String,
    }

    struct ProcessConnector;

    #[async_trait]
    impl BitwardenConnector for ProcessConnector {
        async fn connect(&self, login: &BitwardenLogin) -> std::result::Result<Arc<dyn BitwardenApi>, VendorError> {
            let config = CliConfig {
                profiles: BTreeMap::from([(
                    PROFILE,
                    CliProfile { server_api: &login.api_url, server_identity: &login.identity_url },
                )]),
            };
            let contents = toml::to_string_pretty(&config)
                .map_err(|e| VendorError::new("config", format!("Failed to serialize CLI profile: {}", e)))?;
            tokio::fs::write(&login.config_file, contents).await.map_err(|e| {
                VendorError::new("config", format!("{}: {}", login.config_file.display(), e))
            })?;

            let api = CliApi {
                executable: login.executable.clone(),
                config_file: login.config_file.clone(),
                token: login.token.clone(),
            };
            // Any authenticated call verifies the token
            let _: serde_json::Value = api.json(&["project", "list"]).await?;
            Ok(Arc::new(api))
        }
    }

    struct CliApi {
        executable: PathBuf,
        config_file: PathBuf,
        token: SecretString,
    }

    impl CliApi {
        async fn json<T: DeserializeOwned>(&self, args: &[&str]) -> std::result::Result<T, VendorError> {
            let output = Command::new(&self.executable)
                .arg("--config-file")
                .arg(&self.config_file)
                .args(["--profile", PROFILE, "--output", "json"])
                .args(args)
                .env("BWS_ACCESS_TOKEN", self.token.expose_secret())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| VendorError::new("spawn", format!("{}: {}", self.executable.display(), e)))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let message = if stderr.is_empty() { stdout } else { stderr };
                return Err(VendorError::new(cli_error_code(&message), message));
            }
            serde_json::from_slice(&output.stdout)
                .map_err(|e| VendorError::new("output", format!("Failed to parse bws output: {}", e)))
        }
    }

    #[async_trait]
    impl BitwardenApi for CliApi {
        async fn get(&self, id: &str) -> std::result::Result<SecretString, VendorError> {
            let secret: Secret = self.json(&["secret", "get", id]).await?;
            Ok(SecretString::new(secret.value))
        }

        async fn list(&self, org_id: &str) -> std::result::Result<Vec<SecretSummary>, VendorError> {
            let secrets: Vec<Secret> = self.json(&["secret", "list"]).await?;
            Ok(secrets
                .into_iter()
                .filter(|s| s.organization_id == org_id)
                .map(|s| SecretSummary { id: s.id, organization_id: s.organization_id, key: s.key })
                .collect())
        }
    }
}

#[cfg(not(feature = "bitwarden"))]
mod live {
    use super::*;

    pub(super) fn connector() -> Option<Arc<dyn BitwardenConnector>> {
        None
    }
}
