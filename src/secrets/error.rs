//! Error taxonomy for secret resolution.
//!
//! Every backend maps its failures into exactly one of these kinds at the
//! adapter boundary. Once classified, an error keeps its kind all the way back
//! to the caller; the resolver only attaches the reference name.

use std::fmt;
use thiserror::Error;

/// Result type for secrets operations.
pub type Result<T> = std::result::Result<T, SecretsError>;

/// Kind of a [`SecretsError`], for matching without destructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnknownProvider,
    ProviderNotConfigured,
    Parameter,
    AuthConfig,
    AuthRejected,
    ValueNotFound,
    Provider,
    Timeout,
}

impl ErrorKind {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownProvider => "unknown_provider",
            Self::ProviderNotConfigured => "provider_not_configured",
            Self::Parameter => "parameter",
            Self::AuthConfig => "auth_config",
            Self::AuthRejected => "auth_rejected",
            Self::ValueNotFound => "value_not_found",
            Self::Provider => "provider",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn for_secret(secret: &Option<String>) -> String {
    match secret {
        Some(name) => format!(" (secret '{}')", name),
        None => String::new(),
    }
}

/// Errors that can occur while resolving a secret reference.
///
/// `Clone` so that the outcome of one in-flight login can be handed to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretsError {
    /// The reference names a backend that is not registered.
    #[error("Unknown secrets provider '{provider}'{}", for_secret(.secret))]
    UnknownProvider { provider: String, secret: Option<String> },

    /// The backend has no usable startup configuration.
    #[error("Provider '{provider}' is not configured{}: {message}", for_secret(.secret))]
    ProviderNotConfigured { provider: String, secret: Option<String>, message: String },

    /// The reference's parameters are missing, conflicting or invalid.
    #[error("Invalid parameters for provider '{provider}'{}: {message}", for_secret(.secret))]
    Parameter { provider: String, secret: Option<String>, message: String, fields: Vec<String> },

    /// The configuration is incomplete for the selected auth method.
    #[error("Authentication is misconfigured for provider '{provider}'{}: {message}", for_secret(.secret))]
    AuthConfig { provider: String, secret: Option<String>, message: String },

    /// The backend rejected the credentials.
    #[error("Authentication rejected by provider '{provider}'{}: {message}", for_secret(.secret))]
    AuthRejected { provider: String, secret: Option<String>, message: String },

    /// The backend was reached but the record or field does not exist.
    #[error("Secret value not found in provider '{provider}'{}: {message}", for_secret(.secret))]
    ValueNotFound { provider: String, secret: Option<String>, message: String, key: Option<String> },

    /// Generic backend or network failure.
    #[error("Provider '{provider}' failed{}: {message}", for_secret(.secret))]
    Provider { provider: String, secret: Option<String>, message: String },

    /// An authentication or fetch call exceeded its deadline.
    #[error("Provider '{provider}' timed out{} during {operation} after {duration_ms}ms", for_secret(.secret))]
    Timeout { provider: String, secret: Option<String>, operation: String, duration_ms: u64 },
}

impl SecretsError {
    /// Create an unknown provider error.
    pub fn unknown_provider(provider: impl Into<String>) -> Self {
        Self::UnknownProvider { provider: provider.into(), secret: None }
    }

    /// Create a provider-not-configured error.
    pub fn not_configured(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderNotConfigured { provider: provider.into(), secret: None, message: message.into() }
    }

    /// Create a parameter error naming the offending fields.
    pub fn parameter<I, S>(provider: impl Into<String>, message: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Parameter {
            provider: provider.into(),
            secret: None,
            message: message.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Create an auth configuration error.
    pub fn auth_config(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthConfig { provider: provider.into(), secret: None, message: message.into() }
    }

    /// Create an auth rejected error.
    pub fn auth_rejected(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthRejected { provider: provider.into(), secret: None, message: message.into() }
    }

    /// Create a value-not-found error for a record lookup.
    pub fn not_found(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValueNotFound { provider: provider.into(), secret: None, message: message.into(), key: None }
    }

    /// Create a value-not-found error for a missing field within a record.
    pub fn missing_key(provider: impl Into<String>, key: impl Into<String>) -> Self {
        let key = key.into();
        Self::ValueNotFound {
            provider: provider.into(),
            secret: None,
            message: format!("The secret value could not be retrieved using key '{}'", key),
            key: Some(key),
        }
    }

    /// Create a generic provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider { provider: provider.into(), secret: None, message: message.into() }
    }

    /// Create a timeout error.
    pub fn timeout(provider: impl Into<String>, operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout { provider: provider.into(), secret: None, operation: operation.into(), duration_ms }
    }

    /// Build an error from a kind chosen by a backend's error-code table.
    pub fn classified(kind: ErrorKind, provider: impl Into<String>, message: impl Into<String>) -> Self {
        let provider = provider.into();
        let message = message.into();
        match kind {
            ErrorKind::UnknownProvider => Self::unknown_provider(provider),
            ErrorKind::ProviderNotConfigured => Self::not_configured(provider, message),
            ErrorKind::Parameter => Self::parameter(provider, message, Vec::<String>::new()),
            ErrorKind::AuthConfig => Self::auth_config(provider, message),
            ErrorKind::AuthRejected => Self::auth_rejected(provider, message),
            ErrorKind::ValueNotFound => Self::not_found(provider, message),
            ErrorKind::Provider => Self::provider(provider, message),
            ErrorKind::Timeout => Self::timeout(provider, message, 0),
        }
    }

    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownProvider { .. } => ErrorKind::UnknownProvider,
            Self::ProviderNotConfigured { .. } => ErrorKind::ProviderNotConfigured,
            Self::Parameter { .. } => ErrorKind::Parameter,
            Self::AuthConfig { .. } => ErrorKind::AuthConfig,
            Self::AuthRejected { .. } => ErrorKind::AuthRejected,
            Self::ValueNotFound { .. } => ErrorKind::ValueNotFound,
            Self::Provider { .. } => ErrorKind::Provider,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// The backend id this error belongs to.
    pub fn provider_id(&self) -> &str {
        match self {
            Self::UnknownProvider { provider, .. }
            | Self::ProviderNotConfigured { provider, .. }
            | Self::Parameter { provider, .. }
            | Self::AuthConfig { provider, .. }
            | Self::AuthRejected { provider, .. }
            | Self::ValueNotFound { provider, .. }
            | Self::Provider { provider, .. }
            | Self::Timeout { provider, .. } => provider,
        }
    }

    /// The reference name, once the resolver has attached it.
    pub fn secret_name(&self) -> Option<&str> {
        match self {
            Self::UnknownProvider { secret, .. }
            | Self::ProviderNotConfigured { secret, .. }
            | Self::Parameter { secret, .. }
            | Self::AuthConfig { secret, .. }
            | Self::AuthRejected { secret, .. }
            | Self::ValueNotFound { secret, .. }
            | Self::Provider { secret, .. }
            | Self::Timeout { secret, .. } => secret.as_deref(),
        }
    }

    /// Attach the reference name without changing the kind.
    pub fn with_secret(mut self, name: impl Into<String>) -> Self {
        let name = Some(name.into());
        match &mut self {
            Self::UnknownProvider { secret, .. }
            | Self::ProviderNotConfigured { secret, .. }
            | Self::Parameter { secret, .. }
            | Self::AuthConfig { secret, .. }
            | Self::AuthRejected { secret, .. }
            | Self::ValueNotFound { secret, .. }
            | Self::Provider { secret, .. }
            | Self::Timeout { secret, .. } => *secret = name,
        }
        self
    }

    /// Fields named by a parameter error.
    pub fn fields(&self) -> &[String] {
        match self {
            Self::Parameter { fields, .. } => fields,
            _ => &[],
        }
    }

    /// Only timeouts are worth retrying by the caller; everything else needs a
    /// different question or an operator.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let err = SecretsError::missing_key("hashicorp-vault", "location");
        assert_eq!(err.kind(), ErrorKind::ValueNotFound);
        assert!(err.to_string().contains("location"));

        let err = SecretsError::parameter("aws-secrets-manager", "missing field 'region'", ["region"]);
        assert_eq!(err.kind(), ErrorKind::Parameter);
        assert_eq!(err.fields(), &["region".to_string()]);

        let err = SecretsError::auth_config("hashicorp-vault", "role_name is required");
        assert_eq!(err.kind(), ErrorKind::AuthConfig);
    }

    #[test]
    fn test_with_secret_preserves_kind() {
        let err = SecretsError::auth_rejected("delinea-tss-id", "invalid_grant").with_secret("switch-admin");
        assert_eq!(err.kind(), ErrorKind::AuthRejected);
        assert_eq!(err.secret_name(), Some("switch-admin"));
        assert_eq!(err.provider_id(), "delinea-tss-id");
        assert!(err.to_string().contains("secret 'switch-admin'"));
    }

    #[test]
    fn test_classified_matches_kind() {
        for kind in [
            ErrorKind::ProviderNotConfigured,
            ErrorKind::Parameter,
            ErrorKind::AuthConfig,
            ErrorKind::AuthRejected,
            ErrorKind::ValueNotFound,
            ErrorKind::Provider,
            ErrorKind::Timeout,
        ] {
            assert_eq!(SecretsError::classified(kind, "p", "m").kind(), kind);
        }
    }

    #[test]
    fn test_only_timeout_is_retryable() {
        assert!(SecretsError::timeout("azure-key-vault", "fetch", 30_000).is_retryable());
        assert!(!SecretsError::provider("azure-key-vault", "boom").is_retryable());
        assert!(!SecretsError::auth_rejected("azure-key-vault", "no").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SecretsError::timeout("hashicorp-vault", "authentication", 1500);
        assert_eq!(
            err.to_string(),
            "Provider 'hashicorp-vault' timed out during authentication after 1500ms"
        );
        assert_eq!(SecretsError::unknown_provider("nope").to_string(), "Unknown secrets provider 'nope'");
    }
}
