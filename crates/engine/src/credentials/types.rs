//! Credential references and resolved material.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a credential reference is resolved from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Credential store lookup by key.
    #[default]
    Store,
    /// Process environment variable named by `key`.
    Env,
    /// Literal `value` carried in the playbook.
    Inline,
}

impl std::fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CredentialSource::Store => "store",
            CredentialSource::Env => "env",
            CredentialSource::Inline => "inline",
        };
        write!(f, "{}", s)
    }
}

/// Declarative pointer to secret material.
///
/// In a playbook either a bare key (`auth: pg_prod`) or a mapping
/// (`auth: {source: env, key: API_TOKEN}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ReferenceForm")]
pub struct CredentialReference {
    pub source: CredentialSource,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl CredentialReference {
    pub fn store(key: impl Into<String>) -> Self {
        Self {
            source: CredentialSource::Store,
            key: key.into(),
            scope: None,
            value: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReferenceForm {
    Key(String),
    Full {
        #[serde(default)]
        source: CredentialSource,
        key: String,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        value: Option<serde_json::Value>,
    },
}

impl From<ReferenceForm> for CredentialReference {
    fn from(form: ReferenceForm) -> Self {
        match form {
            ReferenceForm::Key(key) => CredentialReference::store(key),
            ReferenceForm::Full {
                source,
                key,
                scope,
                value,
            } => CredentialReference {
                source,
                key,
                scope,
                value,
            },
        }
    }
}

/// Secret material that never prints itself.
#[derive(Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SecretValue(serde_json::Value);

impl SecretValue {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &serde_json::Value {
        &self.0
    }

    /// Every string or number leaf, as it could appear inside other text.
    pub fn leaves(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_leaves(&self.0, &mut out);
        out
    }
}

fn collect_leaves(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => out.push(s.clone()),
        serde_json::Value::Number(n) => out.push(n.to_string()),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_leaves(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_leaves(v, out)),
        _ => {}
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

/// Credential material resolved for one dispatch; lives only in memory.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedCredential {
    pub key: String,
    pub source: CredentialSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub material: SecretValue,
}

impl ResolvedCredential {
    /// Marker recorded in place of the material.
    pub fn marker(&self) -> String {
        redaction_marker(&self.key)
    }
}

/// `<redacted:key>`
pub fn redaction_marker(key: &str) -> String {
    format!("<redacted:{}>", key)
}

/// Stored credential as returned by a credential store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub key: String,
    pub data: serde_json::Value,
    /// Scopes this credential may be used for; empty means unrestricted.
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    pub fn new(key: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            data,
            scopes: Vec::new(),
            expires_at: None,
        }
    }

    pub fn with_scopes(mut self, scopes: &[&str]) -> Self {
        self.scopes = scopes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reference_from_bare_key() {
        let reference: CredentialReference = serde_json::from_value(json!("pg_prod")).unwrap();
        assert_eq!(reference.source, CredentialSource::Store);
        assert_eq!(reference.key, "pg_prod");
        assert!(reference.scope.is_none());
    }

    #[test]
    fn test_reference_from_mapping() {
        let reference: CredentialReference =
            serde_json::from_value(json!({"source": "env", "key": "API_TOKEN", "scope": "read"}))
                .unwrap();
        assert_eq!(reference.source, CredentialSource::Env);
        assert_eq!(reference.scope.as_deref(), Some("read"));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SecretValue::new(json!({"password": "hunter2"}));
        let printed = format!("{:?}", secret);
        assert!(!printed.contains("hunter2"));
        assert_eq!(secret.leaves(), vec!["hunter2".to_string()]);
    }
}
