//! Pluggable secrets backends
//!
//! Every backend is an adapter implementing [`SecretsProvider`]. The adapter
//! owns the backend's parameter schema, its auth selection rules and the
//! table that classifies vendor errors. The vendor client itself sits behind
//! a connector trait so that a build without the backend's cargo feature, or
//! a test, can supply its own.
//!
//! ## Supported Backends
//!
//! - **HashiCorp Vault**: KV v1/v2 with token, AppRole, Kubernetes and AWS IAM logins
//! - **AWS Secrets Manager** and **Parameter Store**: (Optional feature `aws`)
//! - **Delinea / Thycotic Secret Server**: lookup by id or by path
//! - **Azure Key Vault**: client secret or managed identity
//! - **1Password Connect**
//! - **CyberArk Credential Provider**: the `GetPassword` executable
//! - **Keeper Secrets Manager**: the `ksm` CLI
//! - **Bitwarden Secrets Manager**: machine account access tokens

pub mod aws;
pub mod azure;
pub mod backend;
pub mod bitwarden;
pub mod cache;
pub mod cyberark;
pub(crate) mod http;
pub mod keeper;
pub mod one_password;
pub mod registry;
pub mod secret_server;
pub mod vault;

pub use aws::{AwsProvider, AwsSettings};
pub use azure::{AzureKeyVaultProvider, AzureSettings};
pub use backend::{
    AuthenticatedClient, ProviderClient, ProviderDescriptor, ProviderKind, SecretsProvider,
    VendorError,
};
pub use bitwarden::{BitwardenProvider, BitwardenSettings};
pub use cache::{CacheKey, ClientCache};
pub use cyberark::{CyberArkProvider, CyberArkSettings};
pub use keeper::{KeeperProvider, KeeperSettings};
pub use one_password::{OnePasswordProvider, OnePasswordSettings};
pub use registry::ProviderRegistry;
pub use secret_server::{SecretServerProvider, SecretServerSettings};
pub use vault::{VaultProvider, VaultSettings};
