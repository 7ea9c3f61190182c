//! # latchkey
//!
//! Resolves secret references against external secret-management backends:
//! HashiCorp Vault, AWS Secrets Manager and Parameter Store, Delinea (Thycotic)
//! Secret Server, Azure Key Vault, 1Password Connect, the CyberArk
//! Credential Provider, Keeper Secrets Manager and Bitwarden Secrets Manager.
//!
//! ## Architecture
//!
//! ```text
//! SecretReference → ProviderRegistry → ParameterSchema → select_auth
//!                                                          ↓
//!                         SecretString ← fetch ← ClientCache (one login per configuration)
//! ```
//!
//! ## Core Components
//!
//! - **Resolver**: [`secrets::SecretResolver`], the single entry point for callers
//! - **Adapters**: one [`secrets::SecretsProvider`] per backend, owning its
//!   parameter schema, auth selection and error classification
//! - **Client cache**: authenticated vendor clients keyed by backend,
//!   configuration name and a settings fingerprint
//! - **Configuration**: YAML/TOML file plus `LATCHKEY__*` environment variables
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use latchkey::config::load_config;
//! use latchkey::secrets::{SecretReference, SecretResolver};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(None)?;
//!     let resolver = SecretResolver::from_config(&config)?;
//!
//!     let reference = SecretReference::new("db-password", "hashicorp-vault")
//!         .with_parameter("path", "apps/billing")
//!         .with_parameter("key", "password");
//!     let value = resolver.resolve(&reference).await?;
//!     assert!(!value.is_empty());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod errors;
pub mod observability;
pub mod secrets;

// Re-export commonly used types and traits
pub use config::{load_config, AppConfig};
pub use errors::{Error, Result};
pub use secrets::{SecretReference, SecretResolver, SecretString, SecretsError};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
