//! Context assembly for templates and conditions.

use serde_json::{Map, Value};

use crate::engine::state::{Activation, ExecutionInstance, StepInstance};
use crate::template::Context;

/// Variable bound to an iteration's index.
pub const INDEX_VAR: &str = "_index";

/// Merge `overlay` into `base`: objects merge key by key, anything else in
/// `overlay` replaces the value in `base`.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Playbook workload with the trigger payload applied on top.
pub fn merge_workload(defaults: &Map<String, Value>, payload: &Map<String, Value>) -> Map<String, Value> {
    let mut workload = defaults.clone();
    deep_merge(&mut workload, payload);
    workload
}

/// Workload keys at top level and under `workload`, then `scope` on top.
pub fn base_context(exec: &ExecutionInstance, scope: &Map<String, Value>) -> Context {
    let mut context = exec.workload.clone();
    context.insert("workload".to_string(), Value::Object(exec.workload.clone()));
    context.insert(
        "execution_id".to_string(),
        Value::String(exec.execution_id.to_string()),
    );
    for (key, value) in scope {
        context.insert(key.clone(), value.clone());
    }
    context
}

/// Context a step instance is dispatched with: the activation context plus
/// the iterator binding.
pub fn instance_context(
    exec: &ExecutionInstance,
    activation: &Activation,
    instance: &StepInstance,
    iterator: Option<&str>,
) -> Context {
    let mut context = base_context(exec, &activation.context);
    if let (Some(name), Some(item)) = (iterator, instance.item.as_ref()) {
        context.insert(name.to_string(), item.clone());
    }
    if let Some(index) = instance.iteration_index {
        context.insert(INDEX_VAR.to_string(), Value::from(index));
    }
    context
}

/// Context transition rules are evaluated in.
pub fn transition_context(
    exec: &ExecutionInstance,
    activation: &Activation,
    status: &str,
    result: &Value,
    error: Option<&Value>,
) -> Context {
    let mut context = base_context(exec, &activation.context);
    context.insert("result".to_string(), result.clone());
    context.insert("status".to_string(), Value::String(status.to_string()));
    context.insert("error".to_string(), error.cloned().unwrap_or(Value::Null));
    context.insert(activation.step_name.clone(), result.clone());
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_deep_merge_objects_recursive_arrays_replaced() {
        let defaults = map(json!({
            "db": {"host": "localhost", "port": 5432},
            "items": [1, 2, 3],
            "mode": "full"
        }));
        let payload = map(json!({
            "db": {"host": "prod"},
            "items": [9],
            "extra": true
        }));

        let merged = merge_workload(&defaults, &payload);
        assert_eq!(merged["db"], json!({"host": "prod", "port": 5432}));
        assert_eq!(merged["items"], json!([9]));
        assert_eq!(merged["mode"], "full");
        assert_eq!(merged["extra"], true);
    }

    #[test]
    fn test_scalar_replaces_object() {
        let mut base = map(json!({"db": {"host": "x"}}));
        deep_merge(&mut base, &map(json!({"db": null})));
        assert_eq!(base["db"], Value::Null);
    }
}
