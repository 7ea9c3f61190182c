//! # Error Types
//!
//! Startup and configuration errors for latchkey using `thiserror`.
//! Resolution failures have their own taxonomy in [`crate::secrets::SecretsError`].

/// Custom result type for latchkey startup operations
pub type Result<T> = std::result::Result<T, LatchkeyError>;

/// Main error type for process-level failures
#[derive(thiserror::Error, Debug)]
pub enum LatchkeyError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    /// No backend survived availability filtering
    #[error("No secrets providers are available; enable at least one backend feature")]
    NoProvidersAvailable,

    /// I/O errors with additional context
    #[error("I/O error: {context}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
}

impl LatchkeyError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    /// Create a validation error with field information
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }
}

impl From<std::io::Error> for LatchkeyError {
    fn from(error: std::io::Error) -> Self {
        Self::Io { source: error, context: "I/O operation failed".to_string() }
    }
}

impl From<config::ConfigError> for LatchkeyError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Configuration loading failed", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for LatchkeyError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut messages = Vec::new();
        collect_validation_messages("", &errors, &mut messages);
        Self::validation(format!("Validation failed: {}", messages.join("; ")))
    }
}

// Nested sections report their errors under `section.field`
fn collect_validation_messages(
    prefix: &str,
    errors: &validator::ValidationErrors,
    out: &mut Vec<String>,
) {
    use validator::ValidationErrorsKind;

    let mut entries: Vec<_> = errors.errors().iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));

    for (field, kind) in entries {
        let path = if prefix.is_empty() { field.to_string() } else { format!("{}.{}", prefix, field) };
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string()))
                    .collect();
                out.push(format!("{}: {}", path, error_messages.join(", ")));
            }
            ValidationErrorsKind::Struct(nested) => collect_validation_messages(&path, nested, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_validation_messages(&format!("{}[{}]", path, index), nested, out);
                }
            }
        }
    }
}
