//! 1Password backend, via a 1Password Connect server
//!
//! Only vaults listed in the settings can be referenced. Each vault may carry
//! its own Connect token and gets its own cached client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::backend::{AuthenticatedClient, ProviderClient, ProviderKind, SecretsProvider, VendorError};
use crate::secrets::auth::{AuthMethod, AuthPlan, Fingerprint, LoginPlan};
use crate::secrets::error::{ErrorKind, Result, SecretsError};
use crate::secrets::schema::{NormalizedParameters, ParameterSchema, ParameterSpec};
use crate::secrets::types::SecretString;

const KIND: ProviderKind = ProviderKind::OnePassword;

/// One vault that references may name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnePasswordVaultSettings {
    /// Vault UUID; looked up by name when absent
    pub id: Option<String>,
    /// Token scoped to this vault, overriding the global one
    pub token: Option<SecretString>,
}

/// `one_password` section of the providers settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnePasswordSettings {
    /// Connect server URL
    pub url: Option<String>,
    pub token: Option<SecretString>,
    #[serde(default)]
    pub vaults: BTreeMap<String, OnePasswordVaultSettings>,
}

#[derive(Debug, Clone)]
pub struct OnePasswordLogin {
    pub url: String,
    pub token: SecretString,
}

/// One field of an item, with the label of the section it belongs to
#[derive(Debug, Clone)]
pub struct ItemField {
    pub id: String,
    pub label: String,
    pub section: Option<String>,
    pub value: Option<SecretString>,
}

#[async_trait]
pub trait OnePasswordConnector: Send + Sync {
    async fn connect(&self, login: &OnePasswordLogin) -> std::result::Result<Arc<dyn ConnectApi>, VendorError>;
}

#[async_trait]
pub trait ConnectApi: Send + Sync {
    async fn vault_id(&self, name: &str) -> std::result::Result<Option<String>, VendorError>;

    /// Fields of the item titled `title`, or `None` when there is no such item.
    async fn item_fields(
        &self,
        vault_id: &str,
        title: &str,
    ) -> std::result::Result<Option<Vec<ItemField>>, VendorError>;
}

fn error_kind(e: &VendorError) -> Option<ErrorKind> {
    match e.status {
        Some(401) | Some(403) => Some(ErrorKind::AuthRejected),
        Some(404) => Some(ErrorKind::ValueNotFound),
        Some(400) => Some(ErrorKind::Parameter),
        _ => None,
    }
}

/// 1Password Connect adapter
pub struct OnePasswordProvider {
    settings: Option<OnePasswordSettings>,
    connector: Option<Arc<dyn OnePasswordConnector>>,
    schema: ParameterSchema,
}

impl fmt::Debug for OnePasswordProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnePasswordProvider")
            .field("vaults", &self.settings.as_ref().map(|s| s.vaults.keys().collect::<Vec<_>>()))
            .field("available", &self.connector.is_some())
            .finish()
    }
}

impl OnePasswordProvider {
    pub fn new(
        settings: Option<OnePasswordSettings>,
        connector: Option<Arc<dyn OnePasswordConnector>>,
    ) -> Self {
        let schema = ParameterSchema::new(vec![
            ParameterSpec::text("vault", "Vault", "1Password vault to retrieve the secret from")
                .required(),
            ParameterSpec::text("item", "Item", "The item in 1Password").required(),
            ParameterSpec::text("section", "Section", "The section the field is part of"),
            ParameterSpec::text("field", "Field", "The field where the secret is located")
                .required(),
        ]);
        Self { settings, connector, schema }
    }

    /// Connector backed by reqwest, when compiled in
    pub fn live_connector() -> Option<Arc<dyn OnePasswordConnector>> {
        live::connector()
    }

    fn settings(&self) -> Result<&OnePasswordSettings> {
        self.settings.as_ref().ok_or_else(|| {
            SecretsError::not_configured(KIND.as_str(), "no 'one_password' section in the providers settings")
        })
    }

    fn vault(&self, name: &str) -> Result<&OnePasswordVaultSettings> {
        let settings = self.settings()?;
        settings.vaults.get(name).ok_or_else(|| {
            let known: Vec<&str> = settings.vaults.keys().map(String::as_str).collect();
            SecretsError::parameter(
                KIND.as_str(),
                format!("vault '{}' is not configured; expected one of: {}", name, known.join(", ")),
                ["vault"],
            )
        })
    }
}

#[async_trait]
impl SecretsProvider for OnePasswordProvider {
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
        let settings = self.settings()?;
        let url = settings.url.clone().filter(|u| !u.is_empty()).ok_or_else(|| {
            SecretsError::not_configured(KIND.as_str(), "'one_password' settings have no 'url'")
        })?;
        let vault_name = params.require("vault")?;
        let vault = self.vault(vault_name)?;
        let token = vault
            .token
            .clone()
            .or_else(|| settings.token.clone())
            .filter(|t| !t.is_blank())
            .ok_or_else(|| {
                SecretsError::auth_config(
                    KIND.as_str(),
                    format!("no token configured for vault '{}' and no global 'token'", vault_name),
                )
            })?;

        let fingerprint = Fingerprint::new(KIND)
            .field("url", &url)
            .field("vault", vault_name)
            .optional("vault_id", vault.id.as_deref())
            .secret("token", Some(&token))
            .finish();

        Ok(AuthPlan {
            provider: KIND,
            config_name: vault_name.to_string(),
            method: AuthMethod::AccessToken,
            fingerprint,
            login: LoginPlan::OnePassword(OnePasswordLogin { url, token }),
        })
    }

    async fn authenticate(&self, plan: AuthPlan) -> Result<AuthenticatedClient> {
        let LoginPlan::OnePassword(login) = &plan.login else {
            return Err(plan.mismatched(KIND));
        };
        let connector = self.connector.as_ref().ok_or_else(|| {
            SecretsError::not_configured(KIND.as_str(), "1Password Connect client is not available")
        })?;
        let api = connector.connect(login).await.map_err(|e| e.classify(KIND, error_kind))?;

        info!(vault = %plan.config_name, url = %login.url, "Connected to 1Password");
        Ok(AuthenticatedClient::new(ProviderClient::OnePassword(api), plan.method))
    }

    async fn fetch(
        &self,
        client: &AuthenticatedClient,
        params: &NormalizedParameters,
    ) -> Result<SecretString> {
        let ProviderClient::OnePassword(api) = &client.client else {
            return Err(client.client.mismatched(KIND));
        };
        let vault_name = params.require("vault")?;
        let item = params.require("item")?;
        let field = params.require("field")?;
        let section = params.get("section");

        let vault_id = match &self.vault(vault_name)?.id {
            Some(id) => id.clone(),
            None => api
                .vault_id(vault_name)
                .await
                .map_err(|e| e.classify(KIND, error_kind))?
                .ok_or_else(|| {
                    SecretsError::not_found(KIND.as_str(), format!("vault '{}' not found", vault_name))
                })?,
        };

        debug!(vault = %vault_name, item = %item, section = ?section, "Fetching 1Password item");

        let fields = api
            .item_fields(&vault_id, item)
            .await
            .map_err(|e| e.classify(KIND, error_kind))?
            .ok_or_else(|| {
                SecretsError::not_found(
                    KIND.as_str(),
                    format!("item '{}' not found in vault '{}'", item, vault_name),
                )
            })?;

        fields
            .into_iter()
            .filter(|f| f.label == field || f.id == field)
            .find(|f| section.is_none() || f.section.as_deref() == section)
            .and_then(|f| f.value)
            .ok_or_else(|| SecretsError::missing_key(KIND.as_str(), field))
    }
}

#[cfg(feature = "onepassword")]
mod live {
    use super::*;
    use crate::secrets::backends::http::{build_client, join, json_response, send_error};
    use reqwest::Client;

    pub(super) fn connector() -> Option<Arc<dyn OnePasswordConnector>> {
        Some(Arc::new(ReqwestConnector))
    }

    #[derive(Deserialize)]
    struct Summary {
        id: String,
    }

    #[derive(Deserialize)]
    struct FullItem {
        #[serde(default)]
        fields: Vec<Field>,
        #[serde(default)]
        sections: Vec<Section>,
    }

    #[derive(Deserialize)]
    struct Field {
        id: String,
        #[serde(default)]
        label: String,
        value: Option<String>,
        section: Option<SectionRef>,
    }

    #[derive(Deserialize)]
    struct SectionRef {
        id: String,
    }

    #[derive(Deserialize)]
    struct Section {
        id: String,
        label: Option<String>,
    }

    fn title_filter(attribute: &str, value: &str) -> String {
        format!("{} eq \"{}\"", attribute, value.replace('"', "\\\""))
    }

    struct ReqwestConnector;

    #[async_trait]
    impl OnePasswordConnector for ReqwestConnector {
        async fn connect(&self, login: &OnePasswordLogin) -> std::result::Result<Arc<dyn ConnectApi>, VendorError> {
            let client = build_client(None)?;
            Ok(Arc::new(RestApi { client, url: login.url.clone(), token: login.token.clone() }))
        }
    }

    struct RestApi {
        client: Client,
        url: String,
        token: SecretString,
    }

    impl RestApi {
        async fn get<T: serde::de::DeserializeOwned>(
            &self,
            path: &str,
            filter: Option<String>,
        ) -> std::result::Result<T, VendorError> {
            let mut request = self.client.get(join(&self.url, path)).bearer_auth(self.token.expose_secret());
            if let Some(filter) = filter {
                request = request.query(&[("filter", filter)]);
            }
            json_response(request.send().await.map_err(send_error)?).await
        }
    }

    #[async_trait]
    impl ConnectApi for RestApi {
        async fn vault_id(&self, name: &str) -> std::result::Result<Option<String>, VendorError> {
            let vaults: Vec<Summary> = self.get("v1/vaults", Some(title_filter("name", name))).await?;
            Ok(vaults.into_iter().next().map(|v| v.id))
        }

        async fn item_fields(
            &self,
            vault_id: &str,
            title: &str,
        ) -> std::result::Result<Option<Vec<ItemField>>, VendorError> {
            let items: Vec<Summary> = self
                .get(&format!("v1/vaults/{}/items", vault_id), Some(title_filter("title", title)))
                .await?;
            let Some(summary) = items.into_iter().next() else {
                return Ok(None);
            };
            let item: FullItem =
                self.get(&format!("v1/vaults/{}/items/{}", vault_id, summary.id), None).await?;

            let section_label = |id: &str| {
                item.sections
                    .iter()
                    .find(|s| s.id == id)
                    .map(|s| s.label.clone().unwrap_or_else(|| s.id.clone()))
            };
            let fields = item
                .fields
                .iter()
                .map(|f| ItemField {
                    id: f.id.clone(),
                    label: f.label.clone(),
                    section: f.section.as_ref().and_then(|s| section_label(&s.id)),
                    value: f.value.clone().map(SecretString::new),
                })
                .collect();
            Ok(Some(fields))
        }
    }
}

#[cfg(not(feature = "onepassword"))]
mod live {
    use super::*;

    pub(super) fn connector() -> Option<Arc<dyn OnePasswordConnector>> {
        None
    }
}
