//! # Parameter Schema
//!
//! Each backend declares the named parameters a reference must carry. The
//! schema normalizes aliases, drops empty values, enforces required fields and
//! mutually exclusive groups, and checks lengths, ranges and choices before
//! any backend is contacted.

use std::collections::BTreeMap;

use serde::Serialize;
use url::Url;
use uuid::Uuid;

use super::error::{Result, SecretsError};

/// Type and constraints of one parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    Text {
        #[serde(skip_serializing_if = "Option::is_none")]
        min_len: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_len: Option<usize>,
    },
    Integer {
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    /// Absolute URL with one of the listed schemes and a host.
    Url { schemes: &'static [&'static str] },
    Uuid,
    /// Must be one of the listed values when supplied.
    Choice { choices: &'static [&'static str] },
    /// Picks one sibling field out of the fetched record. Checked after the
    /// fetch, so an unknown value is a lookup failure rather than a parameter
    /// failure.
    Selector { choices: &'static [&'static str] },
}

/// One named parameter of a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub help: &'static str,
    pub required: bool,
    #[serde(flatten)]
    pub kind: ParameterKind,
    #[serde(skip_serializing_if = "no_aliases")]
    pub aliases: &'static [&'static str],
}

fn no_aliases(aliases: &&'static [&'static str]) -> bool {
    aliases.is_empty()
}

impl ParameterSpec {
    fn new(name: &'static str, label: &'static str, help: &'static str, kind: ParameterKind) -> Self {
        Self { name, label, help, required: false, kind, aliases: &[] }
    }

    pub fn text(name: &'static str, label: &'static str, help: &'static str) -> Self {
        Self::new(name, label, help, ParameterKind::Text { min_len: None, max_len: None })
    }

    pub fn integer(
        name: &'static str,
        label: &'static str,
        help: &'static str,
        min: Option<i64>,
        max: Option<i64>,
    ) -> Self {
        Self::new(name, label, help, ParameterKind::Integer { min, max })
    }

    pub fn url(
        name: &'static str,
        label: &'static str,
        help: &'static str,
        schemes: &'static [&'static str],
    ) -> Self {
        Self::new(name, label, help, ParameterKind::Url { schemes })
    }

    pub fn uuid(name: &'static str, label: &'static str, help: &'static str) -> Self {
        Self::new(name, label, help, ParameterKind::Uuid)
    }

    pub fn choice(
        name: &'static str,
        label: &'static str,
        help: &'static str,
        choices: &'static [&'static str],
    ) -> Self {
        Self::new(name, label, help, ParameterKind::Choice { choices })
    }

    pub fn selector(
        name: &'static str,
        label: &'static str,
        help: &'static str,
        choices: &'static [&'static str],
    ) -> Self {
        Self::new(name, label, help, ParameterKind::Selector { choices })
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    /// Bound the length of a text parameter, in characters.
    pub fn length(mut self, min: Option<usize>, max: Option<usize>) -> Self {
        if let ParameterKind::Text { min_len, max_len } = &mut self.kind {
            *min_len = min;
            *max_len = max;
        }
        self
    }

    fn check(&self, value: &str) -> std::result::Result<(), String> {
        match &self.kind {
            ParameterKind::Text { min_len, max_len } => {
                let len = value.chars().count();
                if let Some(min) = min_len {
                    if len < *min {
                        return Err(format!("'{}' must be at least {} characters", self.name, min));
                    }
                }
                if let Some(max) = max_len {
                    if len > *max {
                        return Err(format!("'{}' must be at most {} characters", self.name, max));
                    }
                }
                Ok(())
            }
            ParameterKind::Integer { min, max } => {
                let parsed: i64 = value
                    .parse()
                    .map_err(|_| format!("'{}' must be an integer, got '{}'", self.name, value))?;
                if let Some(min) = min {
                    if parsed < *min {
                        return Err(format!("'{}' must be at least {}", self.name, min));
                    }
                }
                if let Some(max) = max {
                    if parsed > *max {
                        return Err(format!("'{}' must be at most {}", self.name, max));
                    }
                }
                Ok(())
            }
            ParameterKind::Url { schemes } => match Url::parse(value) {
                Ok(url) if schemes.contains(&url.scheme()) && url.host_str().is_some() => Ok(()),
                _ => Err(format!(
                    "'{}' must be an absolute {} URL, got '{}'",
                    self.name,
                    schemes.join(" or "),
                    value
                )),
            },
            ParameterKind::Uuid => Uuid::parse_str(value)
                .map(|_| ())
                .map_err(|_| format!("'{}' must be a UUID, got '{}'", self.name, value)),
            ParameterKind::Choice { choices } => {
                if choices.contains(&value) {
                    Ok(())
                } else {
                    Err(format!(
                        "'{}' must be one of {}, got '{}'",
                        self.name,
                        choices.join(", "),
                        value
                    ))
                }
            }
            ParameterKind::Selector { .. } => Ok(()),
        }
    }
}

/// The declared parameters of one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParameterSchema {
    parameters: Vec<ParameterSpec>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    one_of: Vec<&'static [&'static str]>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    exclusive: Vec<&'static [&'static str]>,
}

impl ParameterSchema {
    pub fn new(parameters: Vec<ParameterSpec>) -> Self {
        Self { parameters, one_of: Vec::new(), exclusive: Vec::new() }
    }

    /// Require exactly one of `fields` to be supplied.
    pub fn one_of(mut self, fields: &'static [&'static str]) -> Self {
        self.one_of.push(fields);
        self
    }

    /// Allow at most one of `fields` to be supplied.
    pub fn exclusive(mut self, fields: &'static [&'static str]) -> Self {
        self.exclusive.push(fields);
        self
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn spec(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Names of parameters that are always required.
    pub fn required_parameters(&self) -> Vec<&'static str> {
        self.parameters.iter().filter(|p| p.required).map(|p| p.name).collect()
    }

    fn canonical_name<'a>(&self, name: &'a str) -> &'a str {
        self.parameters
            .iter()
            .find(|p| p.aliases.contains(&name))
            .map(|p| p.name)
            .unwrap_or(name)
    }

    fn in_group(&self, name: &str) -> bool {
        self.one_of.iter().any(|group| group.contains(&name))
    }

    /// Validate and normalize raw parameters.
    ///
    /// Unknown parameters are passed through untouched. Optional parameters
    /// are not defaulted here.
    pub fn validate(
        &self,
        provider: &str,
        raw: &BTreeMap<String, String>,
    ) -> Result<NormalizedParameters> {
        let mut values = BTreeMap::new();
        // Canonical names first so they take precedence over aliases
        let mut entries: Vec<(&String, &String)> = raw.iter().collect();
        entries.sort_by_key(|(name, _)| self.canonical_name(name) != name.as_str());
        for (name, value) in entries {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let canonical = self.canonical_name(name).to_string();
            values.entry(canonical).or_insert_with(|| value.to_string());
        }

        let missing: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required && !self.in_group(p.name) && !values.contains_key(p.name))
            .map(|p| p.name)
            .collect();
        if !missing.is_empty() {
            let quoted: Vec<String> = missing.iter().map(|m| format!("'{}'", m)).collect();
            return Err(SecretsError::parameter(
                provider,
                format!("Missing required parameter(s): {}", quoted.join(", ")),
                missing,
            ));
        }

        let groups = self
            .one_of
            .iter()
            .map(|group| (group, true))
            .chain(self.exclusive.iter().map(|group| (group, false)));
        for (group, at_least_one) in groups {
            let supplied: Vec<&str> =
                group.iter().copied().filter(|f| values.contains_key(*f)).collect();
            let quoted: Vec<String> = group.iter().map(|f| format!("'{}'", f)).collect();
            match supplied.len() {
                0 if at_least_one => {
                    return Err(SecretsError::parameter(
                        provider,
                        format!("One of {} must be provided", quoted.join(" or ")),
                        group.iter().copied(),
                    ));
                }
                0 | 1 => {}
                _ => {
                    return Err(SecretsError::parameter(
                        provider,
                        format!(
                            "Only one of {} may be provided, got {}",
                            quoted.join(" or "),
                            supplied.join(" and ")
                        ),
                        supplied,
                    ));
                }
            }
        }

        let mut problems = Vec::new();
        let mut fields = Vec::new();
        for spec in &self.parameters {
            if let Some(value) = values.get(spec.name) {
                if let Err(problem) = spec.check(value) {
                    problems.push(problem);
                    fields.push(spec.name);
                }
            }
        }
        if !problems.is_empty() {
            return Err(SecretsError::parameter(provider, problems.join("; "), fields));
        }

        Ok(NormalizedParameters { provider: provider.to_string(), values })
    }

    /// Check a selector value against its allowed choices after the fetch.
    pub fn check_selector(&self, provider: &str, name: &str, value: &str) -> Result<()> {
        match self.spec(name).map(|s| &s.kind) {
            Some(ParameterKind::Selector { choices }) if !choices.contains(&value) => {
                Err(SecretsError::ValueNotFound {
                    provider: provider.to_string(),
                    secret: None,
                    message: format!(
                        "'{}' is not a selectable value; expected one of {}",
                        value,
                        choices.join(", ")
                    ),
                    key: Some(value.to_string()),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Parameters after alias normalization and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedParameters {
    provider: String,
    values: BTreeMap<String, String>,
}

impl NormalizedParameters {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Value of a parameter the schema guarantees.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name).ok_or_else(|| {
            SecretsError::parameter(
                &self.provider,
                format!("Missing required parameter '{}'", name),
                [name],
            )
        })
    }

    pub fn get_i64(&self, name: &str) -> Result<Option<i64>> {
        self.get(name)
            .map(|v| {
                v.parse::<i64>().map_err(|_| {
                    SecretsError::parameter(
                        &self.provider,
                        format!("'{}' must be an integer", name),
                        [name],
                    )
                })
            })
            .transpose()
    }

    pub fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
