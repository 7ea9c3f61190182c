//! Keeper Secrets Manager backend
//!
//! Runs the `ksm` CLI. A one-time access token is redeemed once into a
//! profile file that later calls reuse; a device configuration that was
//! already redeemed elsewhere is handed to the CLI through `KSM_CONFIG`.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use super::backend::{AuthenticatedClient, ProviderClient, ProviderKind, SecretsProvider, VendorError};
use crate::secrets::auth::{AuthMethod, AuthPlan, Fingerprint, LoginPlan};
use crate::secrets::error::{ErrorKind, Result, SecretsError};
use crate::secrets::schema::{NormalizedParameters, ParameterSchema, ParameterSpec};
use crate::secrets::types::SecretString;

const KIND: ProviderKind = ProviderKind::Keeper;

const DEFAULT_EXECUTABLE: &str = "ksm";

/// Standard record fields `type` may name
pub const FIELD_TYPES: &[&str] =
    &["login", "password", "url", "oneTimeCode", "host", "text", "secret", "note"];

/// `keeper` section of the providers settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeeperSettings {
    /// One-time access token used when a reference carries none
    pub token: Option<SecretString>,
    /// Device configuration JSON used when a reference carries none
    pub config: Option<SecretString>,
    /// Defaults to `ksm` on the PATH
    pub ksm_executable_path: Option<PathBuf>,
    /// Where redeemed token profiles are written; defaults to the temp dir
    pub profile_dir: Option<PathBuf>,
}

/// Credential the CLI is started with
#[derive(Debug, Clone)]
pub enum KeeperCredential {
    /// Redeemed into `profile` on first login
    Token { token: SecretString, profile: PathBuf },
    /// Base64 of the device configuration JSON
    Config(SecretString),
}

#[derive(Debug, Clone)]
pub struct KeeperLogin {
    pub executable: PathBuf,
    pub credential: KeeperCredential,
}

/// How a reference names its record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordRef {
    Uid(String),
    Title(String),
}

impl RecordRef {
    fn from_params(params: &NormalizedParameters) -> Result<Self> {
        match (params.get("uid"), params.get("name")) {
            (Some(uid), _) => Ok(Self::Uid(uid.to_string())),
            (None, Some(name)) => Ok(Self::Title(name.to_string())),
            (None, None) => Err(SecretsError::parameter(
                KIND.as_str(),
                "One of 'name' or 'uid' must be provided",
                ["name", "uid"],
            )),
        }
    }

    /// Keeper notation for one field of this record.
    pub fn notation(&self, field: &str) -> String {
        let record = match self {
            Self::Uid(uid) => uid.clone(),
            Self::Title(title) => title.replace('\\', "\\\\").replace('/', "\\/"),
        };
        format!("keeper://{}/field/{}", record, field)
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uid(uid) => write!(f, "uid '{}'", uid),
            Self::Title(title) => write!(f, "title '{}'", title),
        }
    }
}

#[async_trait]
pub trait KeeperConnector: Send + Sync {
    async fn connect(&self, login: &KeeperLogin) -> std::result::Result<Arc<dyn KeeperApi>, VendorError>;
}

#[async_trait]
pub trait KeeperApi: Send + Sync {
    /// Value of `field` on the record, or `None` when the field is empty.
    async fn field(
        &self,
        record: &RecordRef,
        field: &str,
    ) -> std::result::Result<Option<SecretString>, VendorError>;
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
    if lower.contains("access denied") || lower.contains("invalid token") || lower.contains("signature is invalid") {
        "access_denied"
    } else if lower.contains("not found") || lower.contains("could not find") || lower.contains("no records") {
        "not_found"
    } else {
        "exit_status"
    }
}

/// Keeper Secrets Manager adapter
pub struct KeeperProvider {
    settings: Option<KeeperSettings>,
    connector: Option<Arc<dyn KeeperConnector>>,
    schema: ParameterSchema,
}

impl fmt::Debug for KeeperProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeeperProvider")
            .field("settings", &self.settings)
            .field("available", &self.connector.is_some())
            .finish()
    }
}

impl KeeperProvider {
    pub fn new(settings: Option<KeeperSettings>, connector: Option<Arc<dyn KeeperConnector>>) -> Self {
        let schema = ParameterSchema::new(vec![
            ParameterSpec::text("name", "Secret Name", "The record title").length(Some(5), Some(30)),
            ParameterSpec::text("uid", "Secret UID", "The record uid").length(Some(20), Some(25)),
            ParameterSpec::text("token", "Token", "The one-time access token").length(Some(20), Some(40)),
            ParameterSpec::text("config", "Config", "The device configuration JSON").length(Some(70), None),
            ParameterSpec::choice("type", "Type", "The record field to retrieve", FIELD_TYPES).required(),
        ])
        .one_of(&["name", "uid"])
        .exclusive(&["token", "config"]);
        Self { settings, connector, schema }
    }

    /// Connector that spawns the CLI, when compiled in
    pub fn live_connector() -> Option<Arc<dyn KeeperConnector>> {
        live::connector()
    }

    fn credential(&self, params: &NormalizedParameters) -> Result<(AuthMethod, SecretString)> {
        let settings = self.settings.as_ref();
        if let Some(config) = params.get("config") {
            return Ok((AuthMethod::DeviceConfig, encode_config(config, "config", true)?));
        }
        if let Some(token) = params.get("token") {
            return Ok((AuthMethod::OneTimeToken, SecretString::new(token)));
        }
        if let Some(config) = settings.and_then(|s| s.config.as_ref()).filter(|c| !c.is_blank()) {
            return Ok((AuthMethod::DeviceConfig, encode_config(config.expose_secret(), "keeper.config", false)?));
        }
        if let Some(token) = settings.and_then(|s| s.token.clone()).filter(|t| !t.is_blank()) {
            return Ok((AuthMethod::OneTimeToken, token));
        }
        Err(SecretsError::auth_config(
            KIND.as_str(),
            "At least the token or config must be provided, in the reference or in the 'keeper' settings",
        ))
    }
}

/// Check that `config` is a JSON object and base64 it for `KSM_CONFIG`.
fn encode_config(config: &str, source: &str, from_params: bool) -> Result<SecretString> {
    match serde_json::from_str::<serde_json::Value>(config) {
        Ok(serde_json::Value::Object(_)) => {
            Ok(SecretString::new(base64::engine::general_purpose::STANDARD.encode(config)))
        }
        _ => {
            let message = format!("'{}' must be a JSON object", source);
            if from_params {
                Err(SecretsError::parameter(KIND.as_str(), message, ["config"]))
            } else {
                Err(SecretsError::auth_config(KIND.as_str(), message))
            }
        }
    }
}

#[async_trait]
impl SecretsProvider for KeeperProvider {
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
        let executable = self
            .settings
            .as_ref()
            .and_then(|s| s.ksm_executable_path.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EXECUTABLE));
        let (method, secret) = self.credential(params)?;
        let config_name = executable.display().to_string();

        let fingerprint = Fingerprint::new(KIND)
            .field("executable", &config_name)
            .field("method", method.as_str())
            .secret("credential", Some(&secret))
            .finish();

        let credential = match method {
            AuthMethod::OneTimeToken => {
                let dir = self
                    .settings
                    .as_ref()
                    .and_then(|s| s.profile_dir.clone())
                    .unwrap_or_else(std::env::temp_dir);
                let stem = fingerprint.get(..16).unwrap_or(&fingerprint);
                KeeperCredential::Token {
                    token: secret,
                    profile: dir.join(format!("latchkey-ksm-{}.ini", stem)),
                }
            }
            _ => KeeperCredential::Config(secret),
        };

        Ok(AuthPlan {
            provider: KIND,
            config_name,
            method,
            fingerprint,
            login: LoginPlan::Keeper(KeeperLogin { executable, credential }),
        })
    }

    async fn authenticate(&self, plan: AuthPlan) -> Result<AuthenticatedClient> {
        let LoginPlan::Keeper(login) = &plan.login else {
            return Err(plan.mismatched(KIND));
        };
        let connector = self.connector.as_ref().ok_or_else(|| {
            SecretsError::not_configured(KIND.as_str(), "Keeper CLI support is not available")
        })?;
        let api = connector.connect(login).await.map_err(|e| e.classify(KIND, error_kind))?;

        info!(executable = %login.executable.display(), method = %plan.method, "Using Keeper Secrets Manager CLI");
        Ok(AuthenticatedClient::new(ProviderClient::Keeper(api), plan.method))
    }

    async fn fetch(
        &self,
        client: &AuthenticatedClient,
        params: &NormalizedParameters,
    ) -> Result<SecretString> {
        let ProviderClient::Keeper(api) = &client.client else {
            return Err(client.client.mismatched(KIND));
        };
        let record = RecordRef::from_params(params)?;
        let field = params.require("type")?;

        debug!(record = %record, field = %field, "Fetching Keeper record field");

        api.field(&record, field)
            .await
            .map_err(|e| e.classify(KIND, error_kind))?
            .filter(|value| !value.is_empty())
            .ok_or_else(|| SecretsError::missing_key(KIND.as_str(), field))
    }
}

#[cfg(feature = "keeper")]
mod live {
    use super::*;
    use std::path::Path;
    use tokio::process::Command;

    pub(super) fn connector() -> Option<Arc<dyn KeeperConnector>> {
        Some(Arc::new(ProcessConnector))
    }

    async fn run(mut command: Command, executable: &Path) -> std::result::Result<String, VendorError> {
        let output = command
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| VendorError::new("spawn", format!("{}: {}", executable.display(), e)))?;

        if output.status.success() {
            return String::from_utf8(output.stdout)
                .map_err(|_| VendorError::new("output", "ksm printed invalid UTF-8"));
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let message = if stderr.is_empty() { stdout } else { stderr };
        Err(VendorError::new(cli_error_code(&message), message))
    }

    struct ProcessConnector;

    #[async_trait]
    impl KeeperConnector for ProcessConnector {
        async fn connect(&self, login: &KeeperLogin) -> std::result::Result<Arc<dyn KeeperApi>, VendorError> {
            match &login.credential {
                KeeperCredential::Token { token, profile } => {
                    // A token can be redeemed once; an existing profile is reused
                    let redeemed = tokio::fs::try_exists(profile).await.unwrap_or(false);
                    if !redeemed {
                        let mut init = Command::new(&login.executable);
                        init.arg("--ini-file")
                            .arg(profile)
                            .args(["profile", "init", "--token"])
                            .arg(token.expose_secret());
                        run(init, &login.executable).await?;
                        debug!(profile = %profile.display(), "Redeemed Keeper one-time token");
                    }
                    Ok(Arc::new(CliApi {
                        executable: login.executable.clone(),
                        profile: Some(profile.clone()),
                        config: None,
                    }))
                }
                KeeperCredential::Config(config) => Ok(Arc::new(CliApi {
                    executable: login.executable.clone(),
                    profile: None,
                    config: Some(config.clone()),
                })),
            }
        }
    }

    struct CliApi {
        executable: PathBuf,
        profile: Option<PathBuf>,
        config: Option<SecretString>,
    }

    #[async_trait]
    impl KeeperApi for CliApi {
        async fn field(
            &self,
            record: &RecordRef,
            field: &str,
        ) -> std::result::Result<Option<SecretString>, VendorError> {
            let mut command = Command::new(&self.executable);
            if let Some(profile) = &self.profile {
                command.arg("--ini-file").arg(profile);
            }
            if let Some(config) = &self.config {
                command.env("KSM_CONFIG", config.expose_secret());
            }
            command.args(["secret", "notation"]).arg(record.notation(field));

            let stdout = run(command, &self.executable).await?;
            let value = stdout.trim_end_matches(['\r', '\n']);
            Ok((!value.is_empty()).then(|| SecretString::new(value)))
        }
    }
}

#[cfg(not(feature = "keeper"))]
mod live {
    use super::*;

    pub(super) fn connector() -> Option<Arc<dyn KeeperConnector>> {
        None
    }
}
