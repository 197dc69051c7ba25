//! Credential resolution at dispatch time.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::credentials::store::CredentialStore;
use crate::credentials::types::{
    CredentialReference, CredentialSource, ResolvedCredential, SecretValue,
};
use crate::error::{AppError, ErrorKind};
use crate::playbook::Step;
use crate::template::{Context, TemplateRenderer};

/// Alias under which a step's `auth` credential is exposed to the tool.
pub const DEFAULT_ALIAS: &str = "default";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Credential '{key}' not found in {origin}")]
    NotFound { key: String, origin: CredentialSource },

    #[error("Credential '{key}' expired at {expires_at}")]
    Expired {
        key: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Credential '{key}' is not valid for scope '{scope}'")]
    ScopeMismatch { key: String, scope: String },

    #[error("Invalid credential reference: {0}")]
    Invalid(String),

    #[error("Credential store error: {0}")]
    Store(#[from] AppError),
}

impl CredentialError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CredentialError::NotFound { .. } => ErrorKind::CredentialNotFound,
            CredentialError::Expired { .. } => ErrorKind::CredentialExpired,
            CredentialError::ScopeMismatch { .. } => ErrorKind::ScopeMismatch,
            CredentialError::Invalid(_) => ErrorKind::Configuration,
            CredentialError::Store(_) => ErrorKind::Transient,
        }
    }
}

/// Resolves credential references against the store, the environment, or
/// inline values.
#[derive(Clone)]
pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Resolve one reference.
    ///
    /// The reference's own scope takes precedence over `scope`. A record that
    /// lists scopes only serves requests naming one of them.
    pub async fn resolve(
        &self,
        reference: &CredentialReference,
        scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ResolvedCredential, CredentialError> {
        let scope = reference.scope.as_deref().or(scope);
        let material = match reference.source {
            CredentialSource::Store => {
                let record = self
                    .store
                    .lookup(&reference.key, scope)
                    .await?
                    .ok_or_else(|| CredentialError::NotFound {
                        key: reference.key.clone(),
                        origin: CredentialSource::Store,
                    })?;

                if let Some(expires_at) = record.expires_at {
                    if expires_at <= now {
                        return Err(CredentialError::Expired {
                            key: reference.key.clone(),
                            expires_at,
                        });
                    }
                }

                if !record.scopes.is_empty()
                    && !scope.is_some_and(|s| record.scopes.iter().any(|r| r == s))
                {
                    return Err(CredentialError::ScopeMismatch {
                        key: reference.key.clone(),
                        scope: scope.unwrap_or("<none>").to_string(),
                    });
                }
                record.data
            }
            CredentialSource::Env => match std::env::var(&reference.key) {
                Ok(value) => serde_json::Value::String(value),
                Err(_) => {
                    return Err(CredentialError::NotFound {
                        key: reference.key.clone(),
                        origin: CredentialSource::Env,
                    })
                }
            },
            CredentialSource::Inline => reference.value.clone().ok_or_else(|| {
                CredentialError::Invalid(format!(
                    "inline credential '{}' has no value",
                    reference.key
                ))
            })?,
        };

        debug!(key = %reference.key, source = %reference.source, "Resolved credential");

        Ok(ResolvedCredential {
            key: reference.key.clone(),
            source: reference.source,
            scope: scope.map(str::to_string),
            material: SecretValue::new(material),
        })
    }

    /// Resolve `auth` (as alias `default`) and every `credentials` alias of
    /// a step.
    ///
    /// Key and scope templates are rendered against `context` first. When a
    /// reference names no scope the tool kind is requested as the scope.
    pub async fn resolve_step(
        &self,
        step: &Step,
        context: &Context,
        renderer: &TemplateRenderer,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, ResolvedCredential>, CredentialError> {
        let mut references: Vec<(String, &CredentialReference)> = Vec::new();
        if let Some(ref auth) = step.auth {
            references.push((DEFAULT_ALIAS.to_string(), auth));
        }
        for (alias, reference) in &step.credentials {
            references.push((alias.clone(), reference));
        }

        let default_scope = step.tool.kind().as_str();
        let mut resolved = BTreeMap::new();
        for (alias, reference) in references {
            let rendered = render_reference(reference, context, renderer)?;
            match self.resolve(&rendered, Some(default_scope), now).await {
                Ok(credential) => {
                    resolved.insert(alias, credential);
                }
                Err(e) => {
                    warn!(step = %step.step, alias = %alias, kind = %e.kind(), "Credential resolution failed: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(resolved)
    }
}

fn render_reference(
    reference: &CredentialReference,
    context: &Context,
    renderer: &TemplateRenderer,
) -> Result<CredentialReference, CredentialError> {
    let render = |text: &str| {
        renderer
            .render(text, context)
            .map_err(|e| CredentialError::Invalid(e.to_string()))
    };

    let key = render(&reference.key)?;
    if key.trim().is_empty() {
        return Err(CredentialError::Invalid(format!(
            "credential key '{}' rendered empty",
            reference.key
        )));
    }

    Ok(CredentialReference {
        source: reference.source,
        key,
        scope: reference.scope.as_deref().map(render).transpose()?,
        value: match reference.value {
            Some(ref value) => Some(
                renderer
                    .render_value(value, context)
                    .map_err(|e| CredentialError::Invalid(e.to_string()))?,
            ),
            None => None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::store::InMemoryCredentialStore;
    use crate::credentials::types::CredentialRecord;
    use chrono::Duration;
    use serde_json::json;

    fn resolver(records: Vec<CredentialRecord>) -> CredentialResolver {
        CredentialResolver::new(Arc::new(InMemoryCredentialStore::with_records(records)))
    }

    #[tokio::test]
    async fn test_resolve_store_reference() {
        let resolver = resolver(vec![CredentialRecord::new("pg_prod", json!({"user": "etl"}))]);
        let resolved = resolver
            .resolve(&CredentialReference::store("pg_prod"), None, Utc::now())
            .await
            .unwrap();
        assert_eq!(resolved.material.expose()["user"], "etl");
        assert_eq!(resolved.marker(), "<redacted:pg_prod>");
    }

    #[tokio::test]
    async fn test_not_found() {
        let err = resolver(vec![])
            .resolve(&CredentialReference::store("missing"), None, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CredentialNotFound);
    }

    #[tokio::test]
    async fn test_expired() {
        let now = Utc::now();
        let record = CredentialRecord::new("old", json!("x")).expiring_at(now - Duration::seconds(1));
        let err = resolver(vec![record])
            .resolve(&CredentialReference::store("old"), None, now)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CredentialExpired);

        let boundary = CredentialRecord::new("edge", json!("x")).expiring_at(now);
        let err = resolver(vec![boundary])
            .resolve(&CredentialReference::store("edge"), None, now)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CredentialExpired);
    }

    #[tokio::test]
    async fn test_scope_mismatch() {
        let record = CredentialRecord::new("warehouse", json!("x")).with_scopes(&["postgres"]);
        let resolver = resolver(vec![record]);
        let reference = CredentialReference::store("warehouse");

        assert!(resolver.resolve(&reference, Some("postgres"), Utc::now()).await.is_ok());

        let err = resolver
            .resolve(&reference, Some("http"), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScopeMismatch);

        let explicit = reference.clone().with_scope("http");
        let err = resolver
            .resolve(&explicit, Some("postgres"), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScopeMismatch);
    }

    #[tokio::test]
    async fn test_inline_and_env_sources() {
        let resolver = resolver(vec![]);
        let inline = CredentialReference {
            source: CredentialSource::Inline,
            key: "lit".to_string(),
            scope: None,
            value: Some(json!({"user": "u"})),
        };
        let resolved = resolver.resolve(&inline, None, Utc::now()).await.unwrap();
        assert_eq!(resolved.material.expose()["user"], "u");

        let env = CredentialReference {
            source: CredentialSource::Env,
            key: "NOETL_TEST_SURELY_UNSET_VARIABLE".to_string(),
            scope: None,
            value: None,
        };
        let err = resolver.resolve(&env, None, Utc::now()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CredentialNotFound);
    }

    #[tokio::test]
    async fn test_resolve_step_renders_keys() {
        let resolver = resolver(vec![
            CredentialRecord::new("pg_dev", json!({"user": "dev"})),
            CredentialRecord::new("api", json!("k")),
        ]);
        let mut step = Step::new("load");
        step.auth = Some(CredentialReference::store("pg_{{ env_name }}"));
        step.credentials
            .insert("upstream".to_string(), CredentialReference::store("api"));

        let mut context = Context::new();
        context.insert("env_name".to_string(), json!("dev"));

        let resolved = resolver
            .resolve_step(&step, &context, &TemplateRenderer::new(), Utc::now())
            .await
            .unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[DEFAULT_ALIAS].key, "pg_dev");
        assert_eq!(resolved["upstream"].material.expose(), &json!("k"));
    }
}
