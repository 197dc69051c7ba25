//! Playbook model.
//!
//! Immutable in-memory representation of a parsed playbook: steps,
//! transitions, workload defaults and resource pool declarations.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Map;
use std::collections::BTreeMap;

use crate::credentials::CredentialReference;
use crate::error::ErrorKind;

/// Tool kinds known to the engine and the reference worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Http,
    Postgres,
    Duckdb,
    Python,
    Shell,
    Playbook,
    Noop,
}

impl ToolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Http => "http",
            ToolKind::Postgres => "postgres",
            ToolKind::Duckdb => "duckdb",
            ToolKind::Python => "python",
            ToolKind::Shell => "shell",
            ToolKind::Playbook => "playbook",
            ToolKind::Noop => "noop",
        }
    }

    /// Pool a step of this kind requests when it declares none, if that pool exists.
    pub fn default_pool(&self) -> Option<&'static str> {
        match self {
            ToolKind::Http => Some("http_pool"),
            ToolKind::Postgres => Some("pg_pool"),
            ToolKind::Duckdb => Some("duckdb_host"),
            _ => None,
        }
    }

    /// Duration assumed by the offline planner when a step gives no estimate.
    pub fn default_duration_ms(&self) -> u64 {
        match self {
            ToolKind::Http => 1000,
            ToolKind::Postgres => 2000,
            ToolKind::Duckdb => 3000,
            ToolKind::Python => 1500,
            ToolKind::Shell => 1000,
            ToolKind::Playbook => 5000,
            ToolKind::Noop => 0,
        }
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tool descriptor: one variant per tool kind, selected by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolSpec {
    Http {
        #[serde(default = "default_method")]
        method: String,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        params: Map<String, serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
    },
    Postgres {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection: Option<String>,
    },
    Duckdb {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        database: Option<String>,
    },
    Python {
        code: String,
    },
    Shell {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Playbook {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    #[default]
    Noop,
}

fn default_method() -> String {
    "GET".to_string()
}

impl ToolSpec {
    pub fn kind(&self) -> ToolKind {
        match self {
            ToolSpec::Http { .. } => ToolKind::Http,
            ToolSpec::Postgres { .. } => ToolKind::Postgres,
            ToolSpec::Duckdb { .. } => ToolKind::Duckdb,
            ToolSpec::Python { .. } => ToolKind::Python,
            ToolSpec::Shell { .. } => ToolKind::Shell,
            ToolSpec::Playbook { .. } => ToolKind::Playbook,
            ToolSpec::Noop => ToolKind::Noop,
        }
    }
}

/// Iterator declaration: evaluate `in` once, bind each element to `iterator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loop {
    /// Expression (`"{{ workload.items }}"`) or a literal list.
    #[serde(rename = "in")]
    pub in_expr: serde_json::Value,

    /// Variable name for each item.
    pub iterator: String,
}

/// One transition rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextTarget {
    pub step: String,

    /// Guard evaluated after the step completes; absent means always.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    /// Templates rendered into the child token's context.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, serde_json::Value>,
}

impl NextTarget {
    pub fn to(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            when: None,
            args: Map::new(),
        }
    }
}

/// Element of a `next:` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextItem {
    Name(String),
    Target(NextTarget),
}

/// `next:` accepts a step name, a list of names, or a list of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NextSpec {
    Single(String),
    List(Vec<NextItem>),
}

impl NextSpec {
    /// Normalize to an ordered list of rules.
    pub fn targets(&self) -> Vec<NextTarget> {
        match self {
            NextSpec::Single(step) => vec![NextTarget::to(step.clone())],
            NextSpec::List(items) => items
                .iter()
                .map(|item| match item {
                    NextItem::Name(step) => NextTarget::to(step.clone()),
                    NextItem::Target(target) => target.clone(),
                })
                .collect(),
        }
    }
}

/// Backoff schedule between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        #[serde(default = "default_initial_ms")]
        initial_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default = "default_max_ms")]
        max_ms: u64,
    },
}

fn default_initial_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_ms() -> u64 {
    10_000
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial_ms: default_initial_ms(),
            multiplier: default_multiplier(),
            max_ms: default_max_ms(),
        }
    }
}

/// Step retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,

    /// Kinds that may be retried; defaults to transient and timeout.
    #[serde(default = "ErrorKind::default_retryable")]
    pub retryable_error_kinds: Vec<ErrorKind>,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            retryable_error_kinds: ErrorKind::default_retryable(),
        }
    }
}

/// Workflow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique within playbook).
    pub step: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,

    #[serde(default)]
    pub tool: ToolSpec,

    /// Single credential, exposed to the tool under the alias `default`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<CredentialReference>,

    /// Alias to credential mapping.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, CredentialReference>,

    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub r#loop: Option<Loop>,

    /// Enable guard evaluated when the step is activated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    /// Step input templates.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<NextSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Requested pools; `None` falls back to the tool kind's default pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,

    /// Ceiling on running time, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Duration hint for the offline planner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            step: name.into(),
            desc: None,
            tool: ToolSpec::Noop,
            auth: None,
            credentials: BTreeMap::new(),
            r#loop: None,
            when: None,
            args: Map::new(),
            next: None,
            retry: None,
            resources: None,
            timeout: None,
            estimated_duration_ms: None,
        }
    }

    /// Ordered transition rules.
    pub fn transitions(&self) -> Vec<NextTarget> {
        self.next.as_ref().map(NextSpec::targets).unwrap_or_default()
    }

    /// Effective retry policy; a step without one gets a single attempt.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or(RetryPolicy {
            max_attempts: 1,
            backoff: Backoff::default(),
            retryable_error_kinds: Vec::new(),
        })
    }

    /// Pools requested by this step given the pools the playbook declares.
    pub fn requested_pools(&self, declared: &[ResourceDecl]) -> Vec<String> {
        match &self.resources {
            Some(pools) => {
                let mut pools = pools.clone();
                pools.sort();
                pools.dedup();
                pools
            }
            None => self
                .tool
                .kind()
                .default_pool()
                .filter(|pool| declared.iter().any(|d| d.name == *pool))
                .map(|pool| vec![pool.to_string()])
                .unwrap_or_default(),
        }
    }
}

/// Pool access mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    #[default]
    Shared,
    Exclusive,
}

/// Named capacity constraint declared by a playbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    pub name: String,
    pub capacity: i64,
    #[serde(default)]
    pub mode: PoolMode,
}

/// Playbook metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,

    /// Catalog path; defaults to the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_version",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn deserialize_version<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Version {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(Option::<Version>::deserialize(deserializer)?.map(|v| match v {
        Version::Text(s) => s,
        Version::Int(i) => i.to_string(),
        Version::Float(f) => f.to_string(),
    }))
}

/// Registration identity of a playbook.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlaybookId {
    pub path: String,
    pub version: String,
}

impl std::fmt::Display for PlaybookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.path, self.version)
    }
}

/// Complete playbook definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    pub metadata: Metadata,

    /// Default parameters, merged with trigger payload at start.
    #[serde(default)]
    pub workload: Map<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceDecl>,

    pub workflow: Vec<Step>,
}

impl Playbook {
    pub fn id(&self) -> PlaybookId {
        PlaybookId {
            path: self
                .metadata
                .path
                .clone()
                .unwrap_or_else(|| self.metadata.name.clone()),
            version: self
                .metadata
                .version
                .clone()
                .unwrap_or_else(|| "1".to_string()),
        }
    }

    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.workflow.iter().find(|s| s.step == name)
    }

    /// Declaration index, used as the scheduling tie-break.
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.workflow.iter().position(|s| s.step == name)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.workflow.iter().map(|s| s.step.as_str()).collect()
    }
}
