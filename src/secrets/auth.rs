//! # Auth Strategy Selection
//!
//! Adapters turn their settings into an [`AuthPlan`] without touching the
//! network. The plan names the chosen [`AuthMethod`], carries everything the
//! login needs, and fingerprints the auth-relevant settings so that a change
//! to any of them lands on a fresh cache key.

use std::fmt;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::backends::aws::AwsLogin;
use super::backends::cyberark::CyberArkLogin;
use super::backends::azure::AzureLogin;
use super::backends::bitwarden::BitwardenLogin;
use super::backends::backend::ProviderKind;
use super::backends::cache::CacheKey;
use super::backends::keeper::KeeperLogin;
use super::backends::one_password::OnePasswordLogin;
use super::backends::secret_server::SecretServerLogin;
use super::backends::vault::VaultLogin;
use super::error::{Result, SecretsError};
use super::types::SecretString;

/// One of the mutually exclusive ways to authenticate to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Static Vault token
    Token,
    AppRole,
    Kubernetes,
    /// Vault login with a signed STS GetCallerIdentity request
    AwsIam,
    /// OAuth2 password grant
    Password,
    /// OAuth2 password grant against a Windows domain
    DomainPassword,
    /// Pre-issued bearer token
    AccessToken,
    /// OAuth2 client credentials grant
    ClientSecret,
    /// Instance metadata identity
    ManagedIdentity,
    /// Cloud SDK default credential chain
    AmbientCredentials,
    /// Host identity of a local SDK executable
    HostIdentity,
    /// One-time token redeemed for a device configuration
    OneTimeToken,
    /// Previously redeemed device configuration
    DeviceConfig,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::AppRole => "approle",
            Self::Kubernetes => "kubernetes",
            Self::AwsIam => "aws",
            Self::Password => "password",
            Self::DomainPassword => "domain_password",
            Self::AccessToken => "access_token",
            Self::ClientSecret => "client_secret",
            Self::ManagedIdentity => "managed_identity",
            Self::AmbientCredentials => "ambient_credentials",
            Self::HostIdentity => "host_identity",
            Self::OneTimeToken => "one_time_token",
            Self::DeviceConfig => "device_config",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vendor-specific login payload chosen by `select_auth`.
#[derive(Debug, Clone)]
pub enum LoginPlan {
    Vault(VaultLogin),
    Aws(AwsLogin),
    SecretServer(SecretServerLogin),
    Azure(AzureLogin),
    OnePassword(OnePasswordLogin),
    CyberArk(CyberArkLogin),
    Keeper(KeeperLogin),
    Bitwarden(BitwardenLogin),
}

/// Result of auth selection for one backend configuration.
#[derive(Debug, Clone)]
pub struct AuthPlan {
    pub provider: ProviderKind,
    /// Named configuration (vault instance, region, 1Password vault, ...)
    pub config_name: String,
    pub method: AuthMethod,
    /// SHA-256 over every auth-relevant setting, credentials included
    pub fingerprint: String,
    pub login: LoginPlan,
}

impl AuthPlan {
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.provider, &self.config_name, &self.fingerprint)
    }

    /// Error for a plan handed to the wrong adapter.
    pub fn mismatched(&self, expected: ProviderKind) -> SecretsError {
        SecretsError::provider(
            expected.as_str(),
            format!("auth plan for '{}' cannot be used here", self.provider),
        )
    }
}

/// Builder for the settings fingerprint that is part of every cache key.
///
/// Credential material is hashed too; the digest never leaves the process
/// but still changes whenever a credential is rotated in the settings.
#[derive(Clone)]
pub struct Fingerprint(Sha256);

impl Fingerprint {
    pub fn new(provider: ProviderKind) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_str().as_bytes());
        Self(hasher)
    }

    pub fn field(mut self, name: &str, value: impl AsRef<str>) -> Self {
        self.write(name, Some(value.as_ref().as_bytes()));
        self
    }

    pub fn optional(mut self, name: &str, value: Option<impl AsRef<str>>) -> Self {
        let value = value.as_ref().map(|v| v.as_ref().as_bytes().to_vec());
        self.write(name, value.as_deref());
        self
    }

    pub fn secret(mut self, name: &str, value: Option<&SecretString>) -> Self {
        self.write(name, value.map(|v| v.expose_secret().as_bytes()));
        self
    }

    pub fn bytes(mut self, name: &str, value: Option<&[u8]>) -> Self {
        self.write(name, value);
        self
    }

    // Length-prefixed so that ("ab","c") and ("a","bc") differ
    fn write(&mut self, name: &str, value: Option<&[u8]>) {
        self.0.update((name.len() as u64).to_be_bytes());
        self.0.update(name.as_bytes());
        match value {
            Some(bytes) => {
                self.0.update([1u8]);
                self.0.update((bytes.len() as u64).to_be_bytes());
                self.0.update(bytes);
            }
            None => self.0.update([0u8]),
        }
    }

    pub fn finish(self) -> String {
        hex::encode(self.0.finalize())
    }
}

/// Read a credential file such as a Kubernetes service-account token.
///
/// An unreadable or empty file means the selected method cannot work, which
/// is an auth configuration problem.
pub fn read_token_file(provider: ProviderKind, path: &Path) -> Result<SecretString> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        SecretsError::auth_config(
            provider.as_str(),
            format!("token file '{}' is not readable: {}", path.display(), e),
        )
    })?;
    let token = SecretString::new(contents.trim());
    if token.is_empty() {
        return Err(SecretsError::auth_config(
            provider.as_str(),
            format!("token file '{}' is empty", path.display()),
        ));
    }
    Ok(token)
}

/// Read a PEM trust bundle that is handed to the vendor client constructor.
pub fn read_trust_bundle(provider: ProviderKind, path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        SecretsError::not_configured(
            provider.as_str(),
            format!("CA bundle '{}' is not readable: {}", path.display(), e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::error::ErrorKind;
    use std::io::Write;

    #[test]
    fn test_fingerprint_changes_with_credentials() {
        let base = || Fingerprint::new(ProviderKind::HashicorpVault).field("url", "https://vault:8200");
        let a = base().secret("token", Some(&SecretString::new("s.one"))).finish();
        let b = base().secret("token", Some(&SecretString::new("s.two"))).finish();
        let c = base().secret("token", Some(&SecretString::new("s.one"))).finish();
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_distinguishes_absent_and_empty() {
        let absent = Fingerprint::new(ProviderKind::DelineaTssId).optional("domain", None::<&str>).finish();
        let empty = Fingerprint::new(ProviderKind::DelineaTssId).optional("domain", Some("")).finish();
        assert_ne!(absent, empty);
    }

    #[test]
    fn test_fingerprint_is_not_ambiguous_across_fields() {
        let a = Fingerprint::new(ProviderKind::AzureKeyVault).field("ab", "c").finish();
        let b = Fingerprint::new(ProviderKind::AzureKeyVault).field("a", "bc").finish();
        assert_ne!(a, b);
    }

    #[test]
    fn test_read_token_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "eyJhbGciOi.jwt").unwrap();
        let token = read_token_file(ProviderKind::HashicorpVault, file.path()).unwrap();
        assert_eq!(token.expose_secret(), "eyJhbGciOi.jwt");

        let err = read_token_file(ProviderKind::HashicorpVault, Path::new("/nonexistent/token"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthConfig);
    }

    #[test]
    fn test_missing_trust_bundle_is_not_configured() {
        let err = read_trust_bundle(ProviderKind::DelineaTssPath, Path::new("/nonexistent/ca.pem"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderNotConfigured);
    }

    #[test]
    fn test_auth_method_labels() {
        assert_eq!(AuthMethod::AppRole.to_string(), "approle");
        assert_eq!(AuthMethod::DomainPassword.as_str(), "domain_password");
    }
}
