//! `latchkey resolve`
//!
//! Resolves one reference from the command line. The value is only printed
//! with `--reveal`; otherwise the command reports success and the length.

use anyhow::{Context, Result};
use std::collections::BTreeMap;

use crate::secrets::{SecretReference, SecretResolver};

/// Parse a `key=value` pair; the value may itself contain `=`
pub(crate) fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid KEY=VALUE: empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

pub(crate) fn build_reference(
    provider: String,
    params: Vec<(String, String)>,
    name: Option<String>,
    context: Option<String>,
) -> Result<SecretReference> {
    let context = context
        .map(|raw| serde_json::from_str::<serde_json::Value>(&raw))
        .transpose()
        .context("--context must be a JSON object")?;

    let mut parameters = BTreeMap::new();
    for (key, value) in params {
        if parameters.insert(key.clone(), value).is_some() {
            anyhow::bail!("parameter '{}' given more than once", key);
        }
    }

    Ok(SecretReference {
        name: name.unwrap_or_else(|| provider.clone()),
        provider,
        parameters,
        context,
    })
}

pub async fn handle_resolve_command(
    resolver: &SecretResolver,
    reference: SecretReference,
    reveal: bool,
) -> Result<()> {
    match resolver.resolve(&reference).await {
        Ok(value) if reveal => {
            println!("{}", value.expose_secret());
            Ok(())
        }
        Ok(value) => {
            println!(
                "Resolved secret '{}' from {} ({} characters). Use --reveal to print it.",
                reference.name,
                reference.provider,
                value.len()
            );
            Ok(())
        }
        Err(e) => anyhow::bail!("{} [{}]", e, e.kind()),
    }
}
