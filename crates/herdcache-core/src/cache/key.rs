//! Canonical cache keys and segment-bounded pattern matching.
//!
//! Key layout: `<resource path>:<params>|<scope>`, for example
//! `cattle:byFarm:farm=7|u=42` or `farms:list:-|shared`. Parameters are
//! rendered in sorted name order so logically identical requests share a key,
//! and the owning user is always part of the key so two accounts never collide.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::error::CacheError;
use super::resource::Resource;

/// Placeholder for a request with no parameters.
const NO_PARAMS: &str = "-";

/// Scope segment for entries not owned by any user.
const SHARED_SCOPE: &str = "shared";

const USER_SCOPE_PREFIX: &str = "u=";

/// Request parameters, kept sorted by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter. Values that cannot be represented as JSON are stored
    /// as null and rejected if the resource requires them.
    pub fn with(mut self, name: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.0.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// A canonical key produced by [`KeyRegistry::build_key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub struct KeyRegistry;

impl KeyRegistry {
    /// Build the canonical key for `resource` with `params` under `user_scope`.
    ///
    /// Fails when a required parameter is missing or null, when a parameter
    /// name is malformed, or when a per-user resource is requested without a user.
    pub fn build_key(
        resource: &Resource,
        params: &Params,
        user_scope: Option<&str>,
    ) -> Result<CacheKey, CacheError> {
        for required in resource.required {
            match params.get(required) {
                None => {
                    return Err(CacheError::key_construction(
                        resource.path,
                        format!("missing required parameter '{}'", required),
                    ))
                }
                Some(Value::Null) => {
                    return Err(CacheError::key_construction(
                        resource.path,
                        format!("required parameter '{}' is null", required),
                    ))
                }
                Some(_) => {}
            }
        }

        let mut rendered = Vec::with_capacity(params.0.len());
        for (name, value) in params.iter() {
            if !Self::is_valid_param_name(name) {
                return Err(CacheError::key_construction(
                    resource.path,
                    format!("invalid parameter name '{}'", name),
                ));
            }
            // Optional params left null carry no information
            if value.is_null() {
                continue;
            }
            let raw = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            rendered.push(format!("{}={}", name, escape(&raw)));
        }
        let params_segment = if rendered.is_empty() {
            NO_PARAMS.to_string()
        } else {
            rendered.join("&")
        };

        let scope_segment = if resource.user_scoped {
            match user_scope {
                Some(user) if !user.is_empty() => format!("{}{}", USER_SCOPE_PREFIX, escape(user)),
                _ => {
                    return Err(CacheError::key_construction(
                        resource.path,
                        "per-user resource requested without a user",
                    ))
                }
            }
        } else {
            SHARED_SCOPE.to_string()
        };

        Ok(CacheKey(format!(
            "{}:{}|{}",
            resource.path, params_segment, scope_segment
        )))
    }

    /// Segment-bounded prefix match: `cattle` matches `cattle:byFarm:...` and
    /// `cattle` itself, but never `cattleSummary:...`.
    pub fn matches(key: &str, pattern: &str) -> bool {
        if pattern.is_empty() {
            return false;
        }
        match key.strip_prefix(pattern) {
            Some("") => true,
            Some(rest) => rest.starts_with([':', '/', '|']),
            None => false,
        }
    }

    /// The user that owns `key`, or `None` for shared (or unparseable) keys.
    pub fn scope_of(key: &str) -> Option<String> {
        let (_, scope) = key.rsplit_once('|')?;
        scope.strip_prefix(USER_SCOPE_PREFIX).map(unescape)
    }

    /// First path segment of `key`, used to group stats.
    pub fn prefix_of(key: &str) -> &str {
        key.split([':', '/', '|']).next().unwrap_or(key)
    }

    fn is_valid_param_name(name: &str) -> bool {
        !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

/// Escape the characters that delimit key segments.
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            '|' => out.push_str("%7C"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(escaped: &str) -> String {
    escaped
        .replace("%7C", "|")
        .replace("%3D", "=")
        .replace("%26", "&")
        .replace("%25", "%")
}
