//! Secrets provider trait and shared types
//!
//! Defines the closed set of backends and the interface every adapter
//! implements: parameter schema, auth selection, login and fetch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::aws::{ParameterStoreApi, SecretsManagerApi};
use super::azure::KeyVaultApi;
use super::bitwarden::BitwardenApi;
use super::cyberark::PasswordSdk;
use super::keeper::KeeperApi;
use super::one_password::ConnectApi;
use super::secret_server::SecretServerApi;
use super::vault::VaultKv;
use crate::secrets::auth::{AuthMethod, AuthPlan};
use crate::secrets::error::{ErrorKind, Result, SecretsError};
use crate::secrets::schema::{NormalizedParameters, ParameterSchema, ParameterSpec};
use crate::secrets::types::SecretString;

/// Cached clients this close to expiry are treated as expired
const EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// Backends known to latchkey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// HashiCorp Vault KV v1/v2
    HashicorpVault,
    /// AWS Secrets Manager
    AwsSecretsManager,
    /// AWS Systems Manager Parameter Store
    AwsParameterStore,
    /// Delinea Secret Server, lookup by secret id
    DelineaTssId,
    /// Delinea Secret Server, lookup by secret path
    DelineaTssPath,
    /// Secret Server under its former Thycotic name
    ThycoticTss,
    /// Azure Key Vault
    AzureKeyVault,
    /// 1Password Connect
    OnePassword,
    /// CyberArk Credential Provider `GetPassword` executable
    CyberArkCli,
    /// Keeper Secrets Manager, via the `ksm` CLI
    Keeper,
    /// Bitwarden Secrets Manager
    Bitwarden,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 11] = [
        Self::HashicorpVault,
        Self::AwsSecretsManager,
        Self::AwsParameterStore,
        Self::DelineaTssId,
        Self::DelineaTssPath,
        Self::ThycoticTss,
        Self::AzureKeyVault,
        Self::OnePassword,
        Self::CyberArkCli,
        Self::Keeper,
        Self::Bitwarden,
    ];

    /// Backend id used in references
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HashicorpVault => "hashicorp-vault",
            Self::AwsSecretsManager => "aws-secrets-manager",
            Self::AwsParameterStore => "aws-sm-parameter-store",
            Self::DelineaTssId => "delinea-tss-id",
            Self::DelineaTssPath => "delinea-tss-path",
            Self::ThycoticTss => "thycotic-tss",
            Self::AzureKeyVault => "azure-key-vault",
            Self::OnePassword => "one-password",
            Self::CyberArkCli => "cyberark-cli-password-sdk",
            Self::Keeper => "keeper-secret-manager",
            Self::Bitwarden => "bitwarden",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::HashicorpVault => "HashiCorp Vault",
            Self::AwsSecretsManager => "AWS Secrets Manager",
            Self::AwsParameterStore => "AWS Systems Manager Parameter Store",
            Self::DelineaTssId => "Delinea Secret Server by ID",
            Self::DelineaTssPath => "Delinea Secret Server by Path",
            Self::ThycoticTss => "Thycotic Secret Server",
            Self::AzureKeyVault => "Azure Key Vault",
            Self::OnePassword => "1Password Vault",
            Self::CyberArkCli => "CyberArk CLI Password SDK",
            Self::Keeper => "Keeper Secret Manager",
            Self::Bitwarden => "Bitwarden",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = SecretsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "hashicorp-vault" => Ok(Self::HashicorpVault),
            "aws-secrets-manager" => Ok(Self::AwsSecretsManager),
            // Earlier releases registered Parameter Store under this id
            "aws-sm-parameter-store" | "aws-ssm-manager" => Ok(Self::AwsParameterStore),
            "delinea-tss-id" => Ok(Self::DelineaTssId),
            "delinea-tss-path" => Ok(Self::DelineaTssPath),
            "thycotic-tss" => Ok(Self::ThycoticTss),
            "azure-key-vault" => Ok(Self::AzureKeyVault),
            "one-password" => Ok(Self::OnePassword),
            "cyberark-cli-password-sdk" => Ok(Self::CyberArkCli),
            "keeper-secret-manager" => Ok(Self::Keeper),
            "bitwarden" => Ok(Self::Bitwarden),
            other => Err(SecretsError::unknown_provider(other)),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure reported by a vendor client before classification.
///
/// `code` is the vendor's own error code (an AWS exception name, an HTTP
/// status text, a CLI message id). Each adapter owns the table that maps
/// codes to an [`ErrorKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorError {
    pub code: String,
    pub status: Option<u16>,
    pub message: String,
}

impl VendorError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), status: None, message: message.into() }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self { code: format!("http_{}", status), status: Some(status), message: message.into() }
    }

    /// Connection, TLS or decoding failure below the vendor API
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new("transport", message)
    }

    /// Classify with `table`; anything the table does not know is a provider error.
    pub fn classify(
        self,
        provider: ProviderKind,
        table: impl Fn(&VendorError) -> Option<ErrorKind>,
    ) -> SecretsError {
        let kind = table(&self).unwrap_or(ErrorKind::Provider);
        let message = if self.message.is_empty() {
            self.code.clone()
        } else {
            format!("{}: {}", self.code, self.message)
        };
        SecretsError::classified(kind, provider.as_str(), message)
    }
}

impl fmt::Display for VendorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Vendor client handle, one variant per vendor API.
#[derive(Clone)]
pub enum ProviderClient {
    Vault(Arc<dyn VaultKv>),
    SecretsManager(Arc<dyn SecretsManagerApi>),
    ParameterStore(Arc<dyn ParameterStoreApi>),
    SecretServer(Arc<dyn SecretServerApi>),
    KeyVault(Arc<dyn KeyVaultApi>),
    OnePassword(Arc<dyn ConnectApi>),
    CyberArk(Arc<dyn PasswordSdk>),
    Keeper(Arc<dyn KeeperApi>),
    Bitwarden(Arc<dyn BitwardenApi>),
}

impl ProviderClient {
    fn variant(&self) -> &'static str {
        match self {
            Self::Vault(_) => "Vault",
            Self::SecretsManager(_) => "SecretsManager",
            Self::ParameterStore(_) => "ParameterStore",
            Self::SecretServer(_) => "SecretServer",
            Self::KeyVault(_) => "KeyVault",
            Self::OnePassword(_) => "OnePassword",
            Self::CyberArk(_) => "CyberArk",
            Self::Keeper(_) => "Keeper",
            Self::Bitwarden(_) => "Bitwarden",
        }
    }

    /// Error for a client handed to the wrong adapter.
    pub fn mismatched(&self, expected: ProviderKind) -> SecretsError {
        SecretsError::provider(
            expected.as_str(),
            format!("{} client cannot be used here", self.variant()),
        )
    }
}

impl fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderClient::{}", self.variant())
    }
}

/// A logged-in vendor client plus how and when it was created.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    pub client: ProviderClient,
    pub method: AuthMethod,
    pub created_at: Instant,
    /// Set when the backend issued a leased credential
    pub expires_at: Option<Instant>,
}

impl AuthenticatedClient {
    pub fn new(client: ProviderClient, method: AuthMethod) -> Self {
        Self { client, method, created_at: Instant::now(), expires_at: None }
    }

    /// Record the lease duration returned by the login, if any.
    pub fn with_lease(mut self, lease: Option<Duration>) -> Self {
        self.expires_at = lease.filter(|d| !d.is_zero()).map(|d| self.created_at + d);
        self
    }

    pub fn is_valid(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Instant::now() + EXPIRY_SKEW < expires_at,
            None => true,
        }
    }
}

/// What the registry publishes about an available backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderDescriptor {
    pub id: &'static str,
    pub display_name: &'static str,
    pub required_parameters: Vec<&'static str>,
    pub parameters: Vec<ParameterSpec>,
}

/// Adapter for one secrets backend.
///
/// Implementations must be Send + Sync; one instance serves every concurrent
/// resolution for its backend.
#[async_trait]
pub trait SecretsProvider: Send + Sync + fmt::Debug {
    fn kind(&self) -> ProviderKind;

    fn schema(&self) -> &ParameterSchema;

    /// True only when the vendor client could be constructed at startup.
    fn is_available(&self) -> bool;

    /// Pick the auth method for the configuration these parameters select.
    ///
    /// Must not perform network I/O.
    fn select_auth(&self, params: &NormalizedParameters) -> Result<AuthPlan>;

    /// Perform the login described by `plan`.
    async fn authenticate(&self, plan: AuthPlan) -> Result<AuthenticatedClient>;

    /// Perform exactly one logical read and extract the requested value.
    async fn fetch(
        &self,
        client: &AuthenticatedClient,
        params: &NormalizedParameters,
    ) -> Result<SecretString>;

    /// Validate raw parameters against this backend's schema.
    fn validate(&self, raw: &BTreeMap<String, String>) -> Result<NormalizedParameters> {
        self.schema().validate(self.kind().as_str(), raw)
    }

    fn descriptor(&self) -> ProviderDescriptor {
        let kind = self.kind();
        ProviderDescriptor {
            id: kind.as_str(),
            display_name: kind.display_name(),
            required_parameters: self.schema().required_parameters(),
            parameters: self.schema().parameters().to_vec(),
        }
    }
}

/// Pick `key` out of a JSON object payload; a missing key or a non-object
/// payload means the value is not there.
pub fn extract_json_key(
    provider: ProviderKind,
    payload: &serde_json::Value,
    key: &str,
) -> Result<SecretString> {
    match payload.get(key) {
        Some(serde_json::Value::String(s)) => Ok(SecretString::new(s.as_str())),
        Some(serde_json::Value::Null) | None => Err(SecretsError::missing_key(provider.as_str(), key)),
        Some(other) => Ok(SecretString::new(other.to_string())),
    }
}
