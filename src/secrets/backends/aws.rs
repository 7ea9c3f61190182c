//! AWS Secrets Manager and Systems Manager Parameter Store backends
//!
//! Both services store a JSON document and a reference selects one key of
//! it. Credentials come from the SDK's default chain, so the only auth
//! decision is which region (and optionally profile or endpoint) to use.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::backend::{
    extract_json_key, AuthenticatedClient, ProviderClient, ProviderKind, SecretsProvider,
    VendorError,
};
use crate::secrets::auth::{AuthMethod, AuthPlan, Fingerprint, LoginPlan};
use crate::secrets::error::{ErrorKind, Result, SecretsError};
use crate::secrets::schema::{NormalizedParameters, ParameterSchema, ParameterSpec};
use crate::secrets::types::SecretString;

/// `aws` section of the providers settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsSettings {
    /// Named profile from the shared AWS config files
    pub profile: Option<String>,
    /// Endpoint override, e.g. a VPC endpoint or LocalStack
    pub endpoint_url: Option<String>,
}

/// Client construction parameters for one region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsLogin {
    pub region: String,
    pub profile: Option<String>,
    pub endpoint_url: Option<String>,
}

/// Payload of a Secrets Manager secret
#[derive(Debug, Clone, Default)]
pub struct SecretPayload {
    pub string: Option<SecretString>,
    pub binary: Option<Vec<u8>>,
}

/// Builds regional AWS clients from the default credential chain
#[async_trait]
pub trait AwsConnector: Send + Sync {
    async fn secrets_manager(
        &self,
        login: &AwsLogin,
    ) -> std::result::Result<Arc<dyn SecretsManagerApi>, VendorError>;

    async fn parameter_store(
        &self,
        login: &AwsLogin,
    ) -> std::result::Result<Arc<dyn ParameterStoreApi>, VendorError>;
}

#[async_trait]
pub trait SecretsManagerApi: Send + Sync {
    async fn get_secret_value(&self, name: &str) -> std::result::Result<SecretPayload, VendorError>;
}

#[async_trait]
pub trait ParameterStoreApi: Send + Sync {
    /// Get a parameter with decryption; `None` when it has no value.
    async fn get_parameter(&self, name: &str) -> std::result::Result<Option<SecretString>, VendorError>;
}

const REJECTED_CODES: &[&str] = &[
    "AccessDeniedException",
    "UnrecognizedClientException",
    "ExpiredTokenException",
    "InvalidSignatureException",
];

fn secrets_manager_error_kind(e: &VendorError) -> Option<ErrorKind> {
    match e.code.as_str() {
        "ResourceNotFoundException" => Some(ErrorKind::ValueNotFound),
        "InvalidParameterException" => Some(ErrorKind::Parameter),
        code if REJECTED_CODES.contains(&code) => Some(ErrorKind::AuthRejected),
        // DecryptionFailure, InternalServiceError, InvalidRequestException, ...
        _ => None,
    }
}

fn parameter_store_error_kind(e: &VendorError) -> Option<ErrorKind> {
    match e.code.as_str() {
        "ParameterNotFound" | "ParameterVersionNotFound" => Some(ErrorKind::ValueNotFound),
        "ValidationException" => Some(ErrorKind::Parameter),
        code if REJECTED_CODES.contains(&code) => Some(ErrorKind::AuthRejected),
        _ => None,
    }
}

/// AWS Secrets Manager or Parameter Store adapter
pub struct AwsProvider {
    kind: ProviderKind,
    settings: AwsSettings,
    connector: Option<Arc<dyn AwsConnector>>,
    schema: ParameterSchema,
}

impl fmt::Debug for AwsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsProvider")
            .field("kind", &self.kind)
            .field("settings", &self.settings)
            .field("available", &self.connector.is_some())
            .finish()
    }
}

impl AwsProvider {
    fn new(
        kind: ProviderKind,
        settings: Option<AwsSettings>,
        connector: Option<Arc<dyn AwsConnector>>,
    ) -> Self {
        let name_help = match kind {
            ProviderKind::AwsParameterStore => "The name of the parameter",
            _ => "The name or ARN of the secret",
        };
        let schema = ParameterSchema::new(vec![
            ParameterSpec::text("name", "Name", name_help).required(),
            ParameterSpec::text("region", "Region", "The AWS region, e.g. eu-west-1").required(),
            ParameterSpec::text("key", "Key", "The key of the value within the JSON document")
                .required(),
        ]);
        Self { kind, settings: settings.unwrap_or_default(), connector, schema }
    }

    pub fn secrets_manager(
        settings: Option<AwsSettings>,
        connector: Option<Arc<dyn AwsConnector>>,
    ) -> Self {
        Self::new(ProviderKind::AwsSecretsManager, settings, connector)
    }

    pub fn parameter_store(
        settings: Option<AwsSettings>,
        connector: Option<Arc<dyn AwsConnector>>,
    ) -> Self {
        Self::new(ProviderKind::AwsParameterStore, settings, connector)
    }

    /// Connector backed by the AWS SDK, when compiled in
    pub fn live_connector() -> Option<Arc<dyn AwsConnector>> {
        live::connector()
    }

    fn decode_document(&self, text: &str) -> Result<serde_json::Value> {
        serde_json::from_str(text).map_err(|_| {
            SecretsError::not_found(self.kind.as_str(), "the stored value is not a JSON document")
        })
    }
}

#[async_trait]
impl SecretsProvider for AwsProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    fn is_available(&self) -> bool {
        self.connector.is_some()
    }

    fn select_auth(&self, params: &NormalizedParameters) -> Result<AuthPlan> {
        let login = AwsLogin {
            region: params.require("region")?.to_string(),
            profile: self.settings.profile.clone(),
            endpoint_url: self.settings.endpoint_url.clone(),
        };
        let fingerprint = Fingerprint::new(self.kind)
            .field("region", &login.region)
            .optional("profile", login.profile.as_deref())
            .optional("endpoint_url", login.endpoint_url.as_deref())
            .finish();

        Ok(AuthPlan {
            provider: self.kind,
            config_name: login.region.clone(),
            method: AuthMethod::AmbientCredentials,
            fingerprint,
            login: LoginPlan::Aws(login),
        })
    }

    async fn authenticate(&self, plan: AuthPlan) -> Result<AuthenticatedClient> {
        let LoginPlan::Aws(login) = &plan.login else {
            return Err(plan.mismatched(self.kind));
        };
        let connector = self.connector.as_ref().ok_or_else(|| {
            SecretsError::not_configured(self.kind.as_str(), "AWS SDK is not available")
        })?;

        let client = match self.kind {
            ProviderKind::AwsParameterStore => connector
                .parameter_store(login)
                .await
                .map(ProviderClient::ParameterStore)
                .map_err(|e| e.classify(self.kind, parameter_store_error_kind))?,
            _ => connector
                .secrets_manager(login)
                .await
                .map(ProviderClient::SecretsManager)
                .map_err(|e| e.classify(self.kind, secrets_manager_error_kind))?,
        };

        info!(provider = %self.kind, region = %login.region, "Created AWS client");
        Ok(AuthenticatedClient::new(client, plan.method))
    }

    async fn fetch(
        &self,
        client: &AuthenticatedClient,
        params: &NormalizedParameters,
    ) -> Result<SecretString> {
        let name = params.require("name")?;
        let key = params.require("key")?;

        let document = match &client.client {
            ProviderClient::SecretsManager(api) if self.kind == ProviderKind::AwsSecretsManager => {
                debug!(secret_name = %name, "Fetching AWS Secrets Manager secret");
                let payload = api
                    .get_secret_value(name)
                    .await
                    .map_err(|e| e.classify(self.kind, secrets_manager_error_kind))?;
                match (payload.string, payload.binary) {
                    (Some(text), _) => self.decode_document(text.expose_secret())?,
                    (None, Some(bytes)) => match serde_json::from_slice(&bytes) {
                        Ok(document) => document,
                        Err(_) => {
                            let decoded = STANDARD.decode(&bytes).map_err(|_| {
                                SecretsError::not_found(
                                    self.kind.as_str(),
                                    "the binary secret is neither JSON nor base64",
                                )
                            })?;
                            self.decode_document(&String::from_utf8_lossy(&decoded))?
                        }
                    },
                    (None, None) => {
                        return Err(SecretsError::not_found(self.kind.as_str(), "the secret has no value"))
                    }
                }
            }
            ProviderClient::ParameterStore(api) if self.kind == ProviderKind::AwsParameterStore => {
                debug!(parameter_name = %name, "Fetching AWS Parameter Store parameter");
                let value = api
                    .get_parameter(name)
                    .await
                    .map_err(|e| e.classify(self.kind, parameter_store_error_kind))?
                    .ok_or_else(|| {
                        SecretsError::not_found(self.kind.as_str(), "the parameter has no value")
                    })?;
                self.decode_document(value.expose_secret())?
            }
            other => return Err(other.mismatched(self.kind)),
        };

        extract_json_key(self.kind, &document, key)
    }
}

#[cfg(feature = "aws")]
mod live {
    use super::*;
    use aws_config::{BehaviorVersion, Region, SdkConfig};
    use aws_sdk_secretsmanager::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

    pub(super) fn connector() -> Option<Arc<dyn AwsConnector>> {
        Some(Arc::new(SdkConnector))
    }

    fn sdk_error<E, R>(e: SdkError<E, R>) -> VendorError
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: fmt::Debug,
    {
        match e.code() {
            Some(code) => VendorError::new(code, e.message().unwrap_or_default()),
            None => VendorError::transport(DisplayErrorContext(&e).to_string()),
        }
    }

    async fn load_config(login: &AwsLogin) -> SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(login.region.clone()));
        if let Some(profile) = &login.profile {
            loader = loader.profile_name(profile);
        }
        loader.load().await
    }

    struct SdkConnector;

    #[async_trait]
    impl AwsConnector for SdkConnector {
        async fn secrets_manager(
            &self,
            login: &AwsLogin,
        ) -> std::result::Result<Arc<dyn SecretsManagerApi>, VendorError> {
            let sdk_config = load_config(login).await;
            let mut builder = aws_sdk_secretsmanager::config::Builder::from(&sdk_config);
            if let Some(endpoint_url) = &login.endpoint_url {
                builder = builder.endpoint_url(endpoint_url);
            }
            Ok(Arc::new(aws_sdk_secretsmanager::Client::from_conf(builder.build())))
        }

        async fn parameter_store(
            &self,
            login: &AwsLogin,
        ) -> std::result::Result<Arc<dyn ParameterStoreApi>, VendorError> {
            let sdk_config = load_config(login).await;
            let mut builder = aws_sdk_ssm::config::Builder::from(&sdk_config);
            if let Some(endpoint_url) = &login.endpoint_url {
                builder = builder.endpoint_url(endpoint_url);
            }
            Ok(Arc::new(aws_sdk_ssm::Client::from_conf(builder.build())))
        }
    }

    #[async_trait]
    impl SecretsManagerApi for aws_sdk_secretsmanager::Client {
        async fn get_secret_value(&self, name: &str) -> std::result::Result<SecretPayload, VendorError> {
            let output = self.get_secret_value().secret_id(name).send().await.map_err(sdk_error)?;
            Ok(SecretPayload {
                string: output.secret_string().map(SecretString::new),
                binary: output.secret_binary().map(|blob| blob.as_ref().to_vec()),
            })
        }
    }

    #[async_trait]
    impl ParameterStoreApi for aws_sdk_ssm::Client {
        async fn get_parameter(&self, name: &str) -> std::result::Result<Option<SecretString>, VendorError> {
            let output = self
                .get_parameter()
                .name(name)
                .with_decryption(true)
                .send()
                .await
                .map_err(sdk_error)?;
            Ok(output.parameter().and_then(|p| p.value()).map(SecretString::new))
        }
    }
}

#[cfg(not(feature = "aws"))]
mod live {
    use super::*;

    pub(super) fn connector() -> Option<Arc<dyn AwsConnector>> {
        None
    }
}
