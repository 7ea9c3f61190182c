//! Secret references and templated parameter rendering.

use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{Result, SecretsError};

/// A caller-owned description of which secret to fetch, from which backend,
/// with which parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretReference {
    /// Identity carried in every error about this reference
    pub name: String,
    /// Backend id, e.g. `hashicorp-vault`
    pub provider: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Object that `{{ obj.field }}` placeholders in parameters render against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl SecretReference {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            parameters: BTreeMap::new(),
            context: None,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Parameters with placeholders rendered against the context.
    ///
    /// Without a context the parameters are returned as-is.
    pub fn rendered_parameters(&self) -> Result<BTreeMap<String, String>> {
        match &self.context {
            None => Ok(self.parameters.clone()),
            Some(context) => self
                .parameters
                .iter()
                .map(|(name, value)| {
                    render(value, context)
                        .map(|rendered| (name.clone(), rendered))
                        .map_err(|path| {
                            SecretsError::parameter(
                                &self.provider,
                                format!(
                                    "Parameter '{}' references '{}' which is not present in the context",
                                    name, path
                                ),
                                [name.as_str()],
                            )
                        })
                })
                .collect(),
        }
    }
}

lazy_static! {
    // {{ obj }} or {{ obj.site.slug }}
    static ref PLACEHOLDER: Regex = Regex::new(r"\{\{\s*obj((?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
        .expect("PLACEHOLDER should be a valid regex pattern");
}

/// Render `{{ obj.a.b }}` placeholders. Returns the unresolved path on failure.
fn render(template: &str, context: &Value) -> std::result::Result<String, String> {
    let mut missing = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
        let path = &caps[1];
        let mut current = context;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            let next = match current {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => {
                    missing.get_or_insert_with(|| format!("obj{}", path));
                    return String::new();
                }
            }
        }
        match current {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    });
    match missing {
        Some(path) => Err(path),
        None => Ok(rendered.into_owned()),
    }
}
