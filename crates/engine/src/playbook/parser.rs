//! Playbook YAML parsing and static validation.

use std::collections::HashSet;

use crate::error::{AppError, AppResult};
use crate::playbook::types::Playbook;

/// Parse a playbook from YAML and validate it.
pub fn parse_playbook(yaml: &str) -> AppResult<Playbook> {
    let playbook: Playbook = serde_yaml::from_str(yaml)
        .map_err(|e| AppError::Parse(format!("Failed to parse playbook YAML: {}", e)))?;

    validate_playbook(&playbook)?;

    Ok(playbook)
}

/// Check structure and reference integrity.
///
/// Pool capacities are checked by the scheduler, which owns the pool rules.
pub fn validate_playbook(playbook: &Playbook) -> AppResult<()> {
    if !playbook.api_version.starts_with("noetl.io/") {
        return Err(AppError::Validation(format!(
            "Unsupported apiVersion: {}",
            playbook.api_version
        )));
    }

    if playbook.kind != "Playbook" {
        return Err(AppError::Validation(format!(
            "Invalid kind: expected 'Playbook', got '{}'",
            playbook.kind
        )));
    }

    if playbook.workflow.is_empty() {
        return Err(AppError::Validation(
            "Workflow must contain at least one step".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for step in &playbook.workflow {
        if step.step.trim().is_empty() {
            return Err(AppError::Validation("Step name must not be empty".to_string()));
        }
        if !names.insert(step.step.as_str()) {
            return Err(AppError::Validation(format!(
                "Duplicate step name: {}",
                step.step
            )));
        }
    }

    for step in &playbook.workflow {
        for target in step.transitions() {
            if !names.contains(target.step.as_str()) {
                return Err(AppError::Validation(format!(
                    "Step '{}' references unknown next step '{}'",
                    step.step, target.step
                )));
            }
        }

        if let Some(ref lp) = step.r#loop {
            if lp.iterator.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "Step '{}' loop must name its iterator variable",
                    step.step
                )));
            }
        }

        if let Some(ref retry) = step.retry {
            if retry.max_attempts == 0 {
                return Err(AppError::Validation(format!(
                    "Step '{}' retry.max_attempts must be at least 1",
                    step.step
                )));
            }
        }
    }

    let mut pools = HashSet::new();
    for decl in &playbook.resources {
        if !pools.insert(decl.name.as_str()) {
            return Err(AppError::Validation(format!(
                "Duplicate resource pool: {}",
                decl.name
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: basic
  path: examples/basic
workload:
  items: [1, 2, 3]
resources:
  - name: duckdb_host
    capacity: 1
    mode: exclusive
workflow:
  - step: start
    next:
      - step: fetch
  - step: fetch
    tool:
      kind: http
      url: "https://example.com"
    auth: api_creds
    retry:
      max_attempts: 3
      backoff:
        type: fixed
        delay_ms: 100
    next:
      - step: end
        when: "{{ result.ok }}"
  - step: end
"#;

    #[test]
    fn test_parse_basic() {
        let playbook = parse_playbook(BASIC).unwrap();
        assert_eq!(playbook.metadata.name, "basic");
        assert_eq!(playbook.id().path, "examples/basic");
        assert_eq!(playbook.workflow.len(), 3);
        assert_eq!(playbook.resources[0].capacity, 1);
        let fetch = playbook.get_step("fetch").unwrap();
        assert_eq!(fetch.auth.as_ref().unwrap().key, "api_creds");
        assert_eq!(fetch.retry_policy().max_attempts, 3);
    }

    #[test]
    fn test_reject_wrong_kind() {
        let yaml = BASIC.replace("kind: Playbook", "kind: Workbook");
        let err = parse_playbook(&yaml).unwrap_err();
        assert!(err.to_string().contains("Invalid kind"));
    }

    #[test]
    fn test_reject_unknown_next() {
        let yaml = BASIC.replace("- step: end\n        when", "- step: missing\n        when");
        let err = parse_playbook(&yaml).unwrap_err();
        assert!(err.to_string().contains("unknown next step 'missing'"));
    }

    #[test]
    fn test_reject_duplicate_step() {
        let yaml = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: dup
workflow:
  - step: a
  - step: a
"#;
        let err = parse_playbook(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate step name"));
    }

    #[test]
    fn test_reject_malformed_yaml() {
        let err = parse_playbook("workflow: [").unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
    }
}
