//! CyberArk Credential Provider backend
//!
//! Runs the local `GetPassword` CLI shipped with the Credential Provider. The
//! host's own identity is what CyberArk authorizes, so there is no login
//! beyond checking that the executable exists.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
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

const KIND: ProviderKind = ProviderKind::CyberArkCli;

const DEFAULT_FOLDER: &str = "Root";
const DEFAULT_DELIMITER: &str = ",";

lazy_static! {
    static ref MESSAGE_CODE: Regex =
        Regex::new(r"APPAP\d{3}[EW]").expect("MESSAGE_CODE should be a valid regex pattern");
}

/// `cyberark` section of the providers settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CyberArkSettings {
    pub sdk_executable_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CyberArkLogin {
    pub executable: PathBuf,
}

#[async_trait]
pub trait CyberArkConnector: Send + Sync {
    async fn connect(&self, login: &CyberArkLogin) -> std::result::Result<Arc<dyn PasswordSdk>, VendorError>;
}

/// The `GetPassword` CLI
#[async_trait]
pub trait PasswordSdk: Send + Sync {
    /// Run the CLI with `args` and return its standard output.
    async fn get_password(&self, args: Vec<String>) -> std::result::Result<String, VendorError>;
}

/// Pick the first `APPAPnnnX` message id out of CLI output.
pub fn message_code(output: &str) -> Option<&str> {
    MESSAGE_CODE.find(output).map(|m| m.as_str())
}

fn error_kind(e: &VendorError) -> Option<ErrorKind> {
    match e.code.as_str() {
        // Password object matching query was not found
        "APPAP004E" => Some(ErrorKind::ValueNotFound),
        // Invalid query or argument
        "APPAP008E" => Some(ErrorKind::Parameter),
        "spawn" => Some(ErrorKind::ProviderNotConfigured),
        _ => None,
    }
}

/// CyberArk CLI Password SDK adapter
pub struct CyberArkProvider {
    settings: Option<CyberArkSettings>,
    connector: Option<Arc<dyn CyberArkConnector>>,
    schema: ParameterSchema,
}

impl fmt::Debug for CyberArkProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CyberArkProvider")
            .field("settings", &self.settings)
            .field("available", &self.connector.is_some())
            .finish()
    }
}

fn text(name: &'static str, label: &'static str, help: &'static str) -> ParameterSpec {
    ParameterSpec::text(name, label, help).length(Some(3), Some(300))
}

impl CyberArkProvider {
    pub fn new(settings: Option<CyberArkSettings>, connector: Option<Arc<dyn CyberArkConnector>>) -> Self {
        let schema = ParameterSchema::new(vec![
            text("app_id", "App ID", "The application id registered in CyberArk").required(),
            text("safe", "Safe", "The safe holding the account").required(),
            text("object", "Object", "The account object name; pass this or username"),
            text("username", "Username", "The account user name; pass this or object"),
            text("output", "Output", "Output field(s), e.g. Password or PassProps.Username").required(),
            text("folder", "Folder", "The folder within the safe (defaults to Root)"),
            text("address", "Address", "The account address"),
            text("database", "Database", "The account database"),
            ParameterSpec::integer("policyid", "Policy ID", "The account platform id", Some(0), Some(30000)),
            text("reason", "Reason", "The access reason"),
            ParameterSpec::integer("query_format", "Query format", "The query format", Some(0), Some(300)),
            ParameterSpec::integer("connport", "Connection port", "The connection port", Some(1), Some(65535)),
            ParameterSpec::text("delimiter", "Delimiter", "Delimiter between multiple output fields")
                .length(Some(1), Some(1))
                .aliases(&["delimeter"]),
        ])
        .one_of(&["object", "username"]);
        Self { settings, connector, schema }
    }

    /// Connector that spawns the CLI, when compiled in
    pub fn live_connector() -> Option<Arc<dyn CyberArkConnector>> {
        live::connector()
    }
}

/// Outputs requested by the reference, in order.
fn outputs(params: &NormalizedParameters) -> Result<Vec<&str>> {
    Ok(params.require("output")?.split(',').map(str::trim).filter(|o| !o.is_empty()).collect())
}

/// Command line for one `GetPassword` call.
pub fn get_password_args(params: &NormalizedParameters) -> Result<Vec<String>> {
    let mut query = format!(
        "Safe={};Folder={}",
        params.require("safe")?,
        params.get_or("folder", DEFAULT_FOLDER)
    );
    match (params.get("object"), params.get("username")) {
        (Some(object), _) => query.push_str(&format!(";Object={}", object)),
        (None, Some(username)) => query.push_str(&format!(";UserName={}", username)),
        (None, None) => {
            return Err(SecretsError::parameter(
                KIND.as_str(),
                "One of 'object' or 'username' must be provided",
                ["object", "username"],
            ))
        }
    }
    for (param, attribute) in [("address", "Address"), ("database", "Database"), ("policyid", "PolicyID")] {
        if let Some(value) = params.get(param) {
            query.push_str(&format!(";{}={}", attribute, value));
        }
    }

    let mut args = vec![
        "GetPassword".to_string(),
        "-p".to_string(),
        format!("AppDescs.AppID={}", params.require("app_id")?),
        "-p".to_string(),
        format!("Query={}", query),
        "-o".to_string(),
        outputs(params)?.join(","),
    ];
    for (param, property) in [("query_format", "QueryFormat"), ("reason", "Reason"), ("connport", "ConnectionPort")] {
        if let Some(value) = params.get(param) {
            args.push("-p".to_string());
            args.push(format!("{}={}", property, value));
        }
    }
    if let Some(delimiter) = params.get("delimiter") {
        args.push("-d".to_string());
        args.push(delimiter.to_string());
    }
    Ok(args)
}

#[async_trait]
impl SecretsProvider for CyberArkProvider {
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
        let executable = self
            .settings
            .as_ref()
            .and_then(|s| s.sdk_executable_path.clone())
            .ok_or_else(|| {
                SecretsError::not_configured(KIND.as_str(), "'cyberark.sdk_executable_path' is not set")
            })?;
        if !executable.exists() {
            return Err(SecretsError::not_configured(
                KIND.as_str(),
                format!("the CLI SDK executable was not found: {}", executable.display()),
            ));
        }
        let config_name = executable.display().to_string();
        Ok(AuthPlan {
            provider: KIND,
            fingerprint: Fingerprint::new(KIND).field("executable", &config_name).finish(),
            config_name,
            method: AuthMethod::HostIdentity,
            login: LoginPlan::CyberArk(CyberArkLogin { executable }),
        })
    }

    async fn authenticate(&self, plan: AuthPlan) -> Result<AuthenticatedClient> {
        let LoginPlan::CyberArk(login) = &plan.login else {
            return Err(plan.mismatched(KIND));
        };
        let connector = self.connector.as_ref().ok_or_else(|| {
            SecretsError::not_configured(KIND.as_str(), "CyberArk CLI support is not available")
        })?;
        let sdk = connector.connect(login).await.map_err(|e| e.classify(KIND, error_kind))?;

        info!(executable = %login.executable.display(), "Using CyberArk CLI Password SDK");
        Ok(AuthenticatedClient::new(ProviderClient::CyberArk(sdk), plan.method))
    }

    async fn fetch(
        &self,
        client: &AuthenticatedClient,
        params: &NormalizedParameters,
    ) -> Result<SecretString> {
        let ProviderClient::CyberArk(sdk) = &client.client else {
            return Err(client.client.mismatched(KIND));
        };
        let args = get_password_args(params)?;
        let outputs = outputs(params)?;

        debug!(safe = %params.get_or("safe", ""), outputs = ?outputs, "Running CyberArk GetPassword");

        let stdout = sdk.get_password(args).await.map_err(|e| e.classify(KIND, error_kind))?;
        let line = stdout.trim_end_matches(['\r', '\n']);

        if outputs.len() == 1 {
            return Ok(SecretString::new(line));
        }
        let delimiter = params.get_or("delimiter", DEFAULT_DELIMITER);
        let values: Vec<&str> = line.split(delimiter).collect();
        if values.len() != outputs.len() {
            return Err(SecretsError::not_found(
                KIND.as_str(),
                format!("expected {} output fields, got {}", outputs.len(), values.len()),
            ));
        }
        let fields: serde_json::Map<String, serde_json::Value> = outputs
            .iter()
            .zip(values)
            .map(|(name, value)| (name.to_string(), serde_json::Value::String(value.to_string())))
            .collect();
        Ok(SecretString::new(serde_json::Value::Object(fields).to_string()))
    }
}

#[cfg(feature = "cyberark")]
mod live {
    use super::*;
    use tokio::process::Command;

    pub(super) fn connector() -> Option<Arc<dyn CyberArkConnector>> {
        Some(Arc::new(ProcessConnector))
    }

    struct ProcessConnector;

    #[async_trait]
    impl CyberArkConnector for ProcessConnector {
        async fn connect(&self, login: &CyberArkLogin) -> std::result::Result<Arc<dyn PasswordSdk>, VendorError> {
            Ok(Arc::new(CliSdk { executable: login.executable.clone() }))
        }
    }

    struct CliSdk {
        executable: PathBuf,
    }

    #[async_trait]
    impl PasswordSdk for CliSdk {
        async fn get_password(&self, args: Vec<String>) -> std::result::Result<String, VendorError> {
            let output = Command::new(&self.executable)
                .args(&args)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| VendorError::new("spawn", format!("{}: {}", self.executable.display(), e)))?;

            if output.status.success() {
                return String::from_utf8(output.stdout)
                    .map_err(|_| VendorError::new("output", "GetPassword printed invalid UTF-8"));
            }
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let message = if stderr.is_empty() { stdout } else { stderr };
            let code = message_code(&message).unwrap_or("exit_status").to_string();
            Err(VendorError::new(code, message))
        }
    }
}

#[cfg(not(feature = "cyberark"))]
mod live {
    use super::*;

    pub(super) fn connector() -> Option<Arc<dyn CyberArkConnector>> {
        None
    }
}
