//! Secret reference resolution.
//!
//! Callers describe a secret with a [`SecretReference`]: a name, a backend id
//! and backend-specific parameters. [`SecretResolver::resolve`] validates the
//! parameters against the backend's schema, selects an auth method from the
//! startup settings, reuses or creates an authenticated client, and performs
//! one read.
//!
//! # Example
//!
//! ```rust,ignore
//! use latchkey::config::load_config;
//! use latchkey::secrets::{SecretReference, SecretResolver};
//!
//! let config = load_config(None)?;
//! let resolver = SecretResolver::from_config(&config)?;
//!
//! let reference = SecretReference::new("db-password", "hashicorp-vault")
//!     .with_parameter("path", "apps/billing")
//!     .with_parameter("key", "password");
//! let value = resolver.resolve(&reference).await?;
//! ```
//!
//! # Security Considerations
//!
//! - Secret values are wrapped in [`SecretString`], which redacts itself in
//!   `Debug`, `Display` and `Serialize` and zeroizes on drop
//! - Credentials are hashed into cache keys, never logged
//! - Failures carry the reference name and the backend id, never the value

pub mod auth;
pub mod backends;
pub mod error;
pub mod reference;
pub mod resolver;
pub mod schema;
pub mod types;

pub use auth::{AuthMethod, AuthPlan, LoginPlan};
pub use backends::{
    ProviderDescriptor, ProviderKind, ProviderRegistry, SecretsProvider, VendorError,
};
pub use error::{ErrorKind, Result, SecretsError};
pub use reference::SecretReference;
pub use resolver::SecretResolver;
pub use schema::{NormalizedParameters, ParameterKind, ParameterSchema, ParameterSpec};
pub use types::SecretString;
