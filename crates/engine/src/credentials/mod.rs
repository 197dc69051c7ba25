//! Credential references, stores, and dispatch-time resolution.

pub mod resolver;
pub mod store;
pub mod types;

pub use resolver::{CredentialError, CredentialResolver, DEFAULT_ALIAS};
pub use store::{CredentialStore, InMemoryCredentialStore, PgCredentialStore};
pub use types::{
    redaction_marker, CredentialRecord, CredentialReference, CredentialSource,
    ResolvedCredential, SecretValue,
};
