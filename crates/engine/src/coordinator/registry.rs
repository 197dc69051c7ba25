//! Registered playbooks, keyed by `(path, version)`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::playbook::{parse_playbook, Playbook, PlaybookId, StepGraph};

/// A playbook together with its static step graph.
#[derive(Debug)]
pub struct RegisteredPlaybook {
    pub playbook: Playbook,
    pub graph: StepGraph,
}

#[derive(Debug, Default)]
pub struct PlaybookRegistry {
    playbooks: BTreeMap<PlaybookId, Arc<RegisteredPlaybook>>,
}

impl PlaybookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an immutable playbook version.
    ///
    /// Registering identical content again is a no-op; different content
    /// under an existing id is a conflict.
    pub fn register(&mut self, playbook: Playbook) -> AppResult<PlaybookId> {
        let id = playbook.id();
        if let Some(existing) = self.playbooks.get(&id) {
            if existing.playbook == playbook {
                return Ok(id);
            }
            return Err(AppError::Conflict(format!(
                "playbook {} is already registered with different content",
                id
            )));
        }

        let graph = StepGraph::new(&playbook);
        self.playbooks
            .insert(id.clone(), Arc::new(RegisteredPlaybook { playbook, graph }));
        Ok(id)
    }

    pub fn contains(&self, id: &PlaybookId) -> bool {
        self.playbooks.contains_key(id)
    }

    /// Look up a playbook; without a version the latest one is returned.
    pub fn get(&self, path: &str, version: Option<&str>) -> AppResult<Arc<RegisteredPlaybook>> {
        let found = match version {
            Some(version) => self.playbooks.get(&PlaybookId {
                path: path.to_string(),
                version: version.to_string(),
            }),
            None => self
                .playbooks
                .iter()
                .filter(|(id, _)| id.path == path)
                .max_by(|(a, _), (b, _)| compare_versions(&a.version, &b.version))
                .map(|(_, entry)| entry),
        };

        found.cloned().ok_or_else(|| {
            AppError::NotFound(format!(
                "playbook {}@{}",
                path,
                version.unwrap_or("latest")
            ))
        })
    }

    pub fn ids(&self) -> impl Iterator<Item = &PlaybookId> {
        self.playbooks.keys()
    }

    pub fn len(&self) -> usize {
        self.playbooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.playbooks.is_empty()
    }
}

/// Numeric versions compare numerically, anything else lexically.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Parse every `.yaml`/`.yml` file in `dir`, sorted by file name.
///
/// Files that fail to parse are logged and skipped.
pub fn load_playbooks(dir: &Path) -> AppResult<Vec<Playbook>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| AppError::Config(format!("cannot read playbook dir {}: {}", dir.display(), e)))?;

    let mut files: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    files.sort();

    let mut playbooks = Vec::new();
    for file in files {
        let text = match std::fs::read_to_string(&file) {
            Ok(text) => text,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "Skipping unreadable playbook");
                continue;
            }
        };
        match parse_playbook(&text) {
            Ok(playbook) => {
                info!(file = %file.display(), id = %playbook.id(), "Loaded playbook");
                playbooks.push(playbook);
            }
            Err(e) => warn!(file = %file.display(), error = %e, "Skipping invalid playbook"),
        }
    }
    Ok(playbooks)
}
