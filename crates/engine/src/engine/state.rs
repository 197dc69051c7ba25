//! Execution state reconstruction from events.
//!
//! `ExecutionInstance` is a pure fold over an execution's event log. The
//! coordinator keeps one live copy per execution and applies every event it
//! appends; recovery builds the same value with `from_events`.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{AppError, AppResult, StepError};
use crate::events::{ActivationOutcome, Event, EventPayload, ExecutionStatus, InstanceSeed, Token};

/// State of one step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Skipped,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Failed | StepState::Skipped
        )
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// A token plus where and when it arrived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: Token,
    pub arrived_at: DateTime<Utc>,
    pub arrival_event: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed_by: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub activation_id: u64,
    pub step_name: String,
    pub consumed_tokens: Vec<u64>,
    pub context: Map<String, Value>,
    pub instances: Vec<u64>,
    /// Arrival of the latest consumed token; the scheduling order key.
    pub arrived_at: DateTime<Utc>,
    pub arrival_event: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Set once transitions have been evaluated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ActivationOutcome>,
    /// Whether evaluation produced at least one live token.
    pub fired_live: bool,
}

impl Activation {
    /// True when the activation fans out over an iterator.
    pub fn is_iteration(&self, exec: &ExecutionInstance) -> bool {
        match self.instances.first() {
            Some(id) => exec
                .instances
                .get(id)
                .is_some_and(|i| i.iteration_index.is_some()),
            None => self.error.is_none() && self.skip_reason.is_none(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepInstance {
    pub step_instance_id: u64,
    pub activation_id: u64,
    pub step_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<Value>,
    pub state: StepState,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_eligible_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Pools requested at scheduling.
    pub pools: Vec<String>,
    /// Whether `pools` currently count against capacity.
    pub holds_pools: bool,
    pub late_results: u32,
    /// Every state entered, in order.
    pub history: Vec<StepState>,
}

impl StepInstance {
    fn new(activation_id: u64, step_name: &str, seed: &InstanceSeed) -> Self {
        Self {
            step_instance_id: seed.step_instance_id,
            activation_id,
            step_name: step_name.to_string(),
            iteration_index: seed.iteration_index,
            item: seed.item.clone(),
            state: StepState::Pending,
            attempt: 0,
            next_eligible_at: None,
            deadline: None,
            worker_id: None,
            result: None,
            error: None,
            pools: Vec::new(),
            holds_pools: false,
            late_results: 0,
            history: vec![StepState::Pending],
        }
    }

    fn enter(&mut self, state: StepState) {
        self.state = state;
        self.history.push(state);
        if state.is_terminal() {
            self.holds_pools = false;
            self.next_eligible_at = None;
            self.deadline = None;
        }
    }
}

/// Projection of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInstance {
    pub execution_id: Uuid,
    pub path: String,
    pub version: String,
    pub workload: Map<String, Value>,
    pub status: ExecutionStatus,
    pub tokens: BTreeMap<u64, TokenRecord>,
    pub activations: BTreeMap<u64, Activation>,
    pub instances: BTreeMap<u64, StepInstance>,
    pub failed_steps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub last_event_id: u64,
}

impl ExecutionInstance {
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            path: String::new(),
            version: String::new(),
            workload: Map::new(),
            status: ExecutionStatus::Running,
            tokens: BTreeMap::new(),
            activations: BTreeMap::new(),
            instances: BTreeMap::new(),
            failed_steps: Vec::new(),
            cancel_reason: None,
            started_at: None,
            finished_at: None,
            last_event_id: 0,
        }
    }

    /// Reconstruct an execution from its full log.
    pub fn from_events(execution_id: Uuid, events: &[Event]) -> AppResult<Self> {
        let start = Instant::now();

        if events.is_empty() {
            return Err(AppError::NotFound(format!("execution {}", execution_id)));
        }

        let mut state = Self::new(execution_id);
        for event in events {
            state.apply(event)?;
        }

        let duration = start.elapsed();
        tracing::info!(
            target: "noetl.performance",
            execution_id = %execution_id,
            phase = "state_reconstruction",
            event_count = events.len(),
            instance_count = state.instances.len(),
            duration_ms = %duration.as_millis(),
            "State reconstructed from events"
        );

        if duration.as_millis() > 100 {
            tracing::warn!(
                target: "noetl.performance",
                execution_id = %execution_id,
                event_count = events.len(),
                duration_ms = %duration.as_millis(),
                "Slow state reconstruction detected"
            );
        }

        Ok(state)
    }

    /// Id the next appended event must carry.
    pub fn next_event_id(&self) -> u64 {
        self.last_event_id + 1
    }

    pub fn next_token_id(&self) -> u64 {
        self.tokens.keys().next_back().map_or(1, |id| id + 1)
    }

    pub fn next_activation_id(&self) -> u64 {
        self.activations.keys().next_back().map_or(1, |id| id + 1)
    }

    pub fn next_instance_id(&self) -> u64 {
        self.instances.keys().next_back().map_or(1, |id| id + 1)
    }

    pub fn instance(&self, step_instance_id: u64) -> AppResult<&StepInstance> {
        self.instances.get(&step_instance_id).ok_or_else(|| {
            AppError::NotFound(format!(
                "step instance {} of execution {}",
                step_instance_id, self.execution_id
            ))
        })
    }

    /// Tokens that have not enabled an activation yet, in arrival order.
    pub fn unconsumed_tokens(&self) -> impl Iterator<Item = &TokenRecord> {
        self.tokens.values().filter(|t| t.consumed_by.is_none())
    }

    /// Instances waiting for capacity.
    pub fn pending_instances(&self) -> impl Iterator<Item = &StepInstance> {
        self.instances
            .values()
            .filter(|i| i.state == StepState::Pending)
    }

    /// Pools held by instances of this execution, with the holder count.
    pub fn pools_in_use(&self) -> BTreeMap<String, i64> {
        let mut in_use = BTreeMap::new();
        for instance in self.instances.values().filter(|i| i.holds_pools) {
            for pool in &instance.pools {
                *in_use.entry(pool.clone()).or_insert(0) += 1;
            }
        }
        in_use
    }

    /// Step states by name, in instance order.
    pub fn step_states(&self) -> Vec<(String, StepState)> {
        self.instances
            .values()
            .map(|i| (i.step_name.clone(), i.state))
            .collect()
    }

    pub fn apply(&mut self, event: &Event) -> AppResult<()> {
        if event.execution_id != self.execution_id {
            return Err(AppError::Internal(format!(
                "event {} belongs to execution {}, not {}",
                event.event_id, event.execution_id, self.execution_id
            )));
        }
        if event.event_id != self.next_event_id() {
            return Err(AppError::Conflict(format!(
                "execution {} expected event {} but got {}",
                self.execution_id,
                self.next_event_id(),
                event.event_id
            )));
        }

        match &event.payload {
            EventPayload::ExecutionStarted {
                path,
                version,
                workload,
                tokens,
            } => {
                self.path = path.clone();
                self.version = version.clone();
                self.workload = workload.clone();
                self.status = ExecutionStatus::Running;
                self.started_at = Some(event.timestamp);
                self.add_tokens(tokens, event);
            }
            EventPayload::ActivationCreated {
                activation_id,
                step_name,
                consumed_tokens,
                context,
                instances,
                skip_reason,
                error,
            } => {
                let mut arrived_at = event.timestamp;
                let mut arrival_event = event.event_id;
                let mut first = true;
                for id in consumed_tokens {
                    let record = self.tokens.get_mut(id).ok_or_else(|| {
                        AppError::Internal(format!("activation consumes unknown token {}", id))
                    })?;
                    record.consumed_by = Some(*activation_id);
                    if first || (record.arrived_at, record.arrival_event) > (arrived_at, arrival_event) {
                        arrived_at = record.arrived_at;
                        arrival_event = record.arrival_event;
                        first = false;
                    }
                }

                for seed in instances {
                    let mut instance = StepInstance::new(*activation_id, step_name, seed);
                    if skip_reason.is_some() {
                        instance.enter(StepState::Skipped);
                    }
                    self.instances.insert(seed.step_instance_id, instance);
                }

                self.activations.insert(
                    *activation_id,
                    Activation {
                        activation_id: *activation_id,
                        step_name: step_name.clone(),
                        consumed_tokens: consumed_tokens.clone(),
                        context: context.clone(),
                        instances: instances.iter().map(|s| s.step_instance_id).collect(),
                        arrived_at,
                        arrival_event,
                        skip_reason: skip_reason.clone(),
                        error: error.clone(),
                        outcome: None,
                        fired_live: false,
                    },
                );
            }
            EventPayload::StepScheduled {
                attempt,
                pools,
                deadline,
            } => {
                let instance = self.instance_mut(event)?;
                instance.attempt = *attempt;
                instance.pools = pools.clone();
                instance.holds_pools = true;
                instance.next_eligible_at = None;
                instance.deadline = *deadline;
                instance.enter(StepState::Scheduled);
            }
            EventPayload::StepStarted {
                worker_id,
                deadline,
                ..
            } => {
                let instance = self.instance_mut(event)?;
                instance.worker_id = Some(worker_id.clone());
                if deadline.is_some() {
                    instance.deadline = *deadline;
                }
                instance.enter(StepState::Running);
            }
            EventPayload::StepSucceeded { result, .. } => {
                let instance = self.instance_mut(event)?;
                instance.result = Some(result.clone());
                instance.error = None;
                instance.enter(StepState::Succeeded);
            }
            EventPayload::StepRetrying {
                error,
                next_eligible_at,
                ..
            } => {
                let instance = self.instance_mut(event)?;
                instance.error = Some(error.clone());
                instance.deadline = None;
                instance.enter(StepState::Retrying);
                instance.next_eligible_at = Some(*next_eligible_at);
            }
            EventPayload::StepFailed { error, .. } => {
                let instance = self.instance_mut(event)?;
                instance.error = Some(error.clone());
                instance.enter(StepState::Failed);
            }
            EventPayload::StepSkipped { .. } => {
                let instance = self.instance_mut(event)?;
                instance.enter(StepState::Skipped);
            }
            EventPayload::LateResultRecorded { .. } => {
                let instance = self.instance_mut(event)?;
                instance.late_results += 1;
            }
            EventPayload::TransitionsEvaluated {
                activation_id,
                outcome,
                tokens,
            } => {
                let activation = self.activations.get_mut(activation_id).ok_or_else(|| {
                    AppError::Internal(format!("transitions for unknown activation {}", activation_id))
                })?;
                activation.outcome = Some(*outcome);
                activation.fired_live = tokens.iter().any(|t| t.live);
                self.add_tokens(tokens, event);
            }
            EventPayload::ExecutionCancelled { reason } => {
                self.status = ExecutionStatus::Cancelled;
                self.cancel_reason = Some(reason.clone());
                self.finished_at = Some(event.timestamp);
            }
            EventPayload::ExecutionCompleted {
                status,
                failed_steps,
            } => {
                self.status = *status;
                self.failed_steps = failed_steps.clone();
                self.finished_at = Some(event.timestamp);
            }
        }

        self.last_event_id = event.event_id;
        Ok(())
    }

    fn add_tokens(&mut self, tokens: &[Token], event: &Event) {
        for token in tokens {
            self.tokens.insert(
                token.token_id,
                TokenRecord {
                    token: token.clone(),
                    arrived_at: event.timestamp,
                    arrival_event: event.event_id,
                    consumed_by: None,
                },
            );
        }
    }

    fn instance_mut(&mut self, event: &Event) -> AppResult<&mut StepInstance> {
        let id = event.step_instance_id.ok_or_else(|| {
            AppError::Internal(format!(
                "{} event {} has no step instance",
                event.kind_name(),
                event.event_id
            ))
        })?;
        let execution_id = self.execution_id;
        self.instances.get_mut(&id).ok_or_else(|| {
            AppError::Internal(format!(
                "event {} references unknown instance {} of execution {}",
                event.event_id, id, execution_id
            ))
        })
    }

    /// Aggregate outcome of an activation whose instances are all terminal.
    pub fn activation_outcome(&self, activation: &Activation) -> ActivationOutcome {
        if activation.error.is_some() {
            return ActivationOutcome::Failed;
        }
        if activation.skip_reason.is_some() {
            return ActivationOutcome::Skipped;
        }
        let failed = activation
            .instances
            .iter()
            .filter_map(|id| self.instances.get(id))
            .any(|i| i.state == StepState::Failed);
        if failed {
            ActivationOutcome::Failed
        } else {
            ActivationOutcome::Succeeded
        }
    }

    /// Single instance result, or iteration results in index order.
    pub fn activation_result(&self, activation: &Activation) -> Value {
        let results: Vec<Value> = activation
            .instances
            .iter()
            .filter_map(|id| self.instances.get(id))
            .map(|i| i.result.clone().unwrap_or(Value::Null))
            .collect();

        if activation.is_iteration(self) {
            Value::Array(results)
        } else {
            results.into_iter().next().unwrap_or(Value::Null)
        }
    }

    /// First failure recorded for an activation.
    pub fn activation_error(&self, activation: &Activation) -> Option<StepError> {
        activation.error.clone().or_else(|| {
            activation
                .instances
                .iter()
                .filter_map(|id| self.instances.get(id))
                .find(|i| i.state == StepState::Failed)
                .and_then(|i| i.error.clone())
        })
    }

    pub fn activation_terminal(&self, activation: &Activation) -> bool {
        activation
            .instances
            .iter()
            .filter_map(|id| self.instances.get(id))
            .all(|i| i.state.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn token(id: u64, target: &str) -> Token {
        Token {
            token_id: id,
            target: target.to_string(),
            iteration_index: None,
            context: Map::new(),
            parent_token_id: None,
            source_step: None,
            source_activation: None,
            live: true,
        }
    }

    fn events(exec: Uuid) -> Vec<Event> {
        let now = Utc::now();
        let mk = |id: u64, instance: Option<u64>, payload: EventPayload| {
            Event::new(id, exec, instance, now, payload)
        };
        vec![
            mk(
                1,
                None,
                EventPayload::ExecutionStarted {
                    path: "p".to_string(),
                    version: "1".to_string(),
                    workload: Map::new(),
                    tokens: vec![token(1, "a")],
                },
            ),
            mk(
                2,
                None,
                EventPayload::ActivationCreated {
                    activation_id: 1,
                    step_name: "a".to_string(),
                    consumed_tokens: vec![1],
                    context: Map::new(),
                    instances: vec![InstanceSeed {
                        step_instance_id: 1,
                        iteration_index: None,
                        item: None,
                    }],
                    skip_reason: None,
                    error: None,
                },
            ),
            mk(
                3,
                Some(1),
                EventPayload::StepScheduled {
                    attempt: 1,
                    pools: vec!["pg_pool".to_string()],
                    deadline: None,
                },
            ),
            mk(
                4,
                Some(1),
                EventPayload::StepRetrying {
                    attempt: 1,
                    error: StepError::new(ErrorKind::Transient, "reset"),
                    next_eligible_at: now,
                },
            ),
            mk(
                5,
                Some(1),
                EventPayload::StepScheduled {
                    attempt: 2,
                    pools: vec!["pg_pool".to_string()],
                    deadline: None,
                },
            ),
            mk(
                6,
                Some(1),
                EventPayload::StepSucceeded {
                    attempt: 2,
                    result: json!({"rows": 1}),
                    duration_ms: None,
                },
            ),
        ]
    }

    #[test]
    fn test_fold_instance_lifecycle() {
        let exec = Uuid::new_v4();
        let log = events(exec);

        let mut state = ExecutionInstance::new(exec);
        state.apply(&log[0]).unwrap();
        state.apply(&log[1]).unwrap();
        state.apply(&log[2]).unwrap();
        assert_eq!(state.pools_in_use().get("pg_pool"), Some(&1));
        state.apply(&log[3]).unwrap();
        assert_eq!(state.pools_in_use().get("pg_pool"), Some(&1));

        let state = ExecutionInstance::from_events(exec, &log).unwrap();
        let instance = state.instance(1).unwrap();
        assert_eq!(instance.state, StepState::Succeeded);
        assert_eq!(instance.attempt, 2);
        assert_eq!(
            instance.history,
            vec![
                StepState::Pending,
                StepState::Scheduled,
                StepState::Retrying,
                StepState::Scheduled,
                StepState::Succeeded
            ]
        );
        assert!(state.pools_in_use().is_empty());
        assert_eq!(state.tokens[&1].consumed_by, Some(1));
    }

    #[test]
    fn test_gap_in_event_ids_rejected() {
        let exec = Uuid::new_v4();
        let log = events(exec);
        let mut state = ExecutionInstance::new(exec);
        state.apply(&log[0]).unwrap();
        assert!(matches!(state.apply(&log[2]), Err(AppError::Conflict(_))));
    }

    #[test]
    fn test_replay_is_byte_identical() {
        let exec = Uuid::new_v4();
        let log = events(exec);
        let a = serde_json::to_string(&ExecutionInstance::from_events(exec, &log).unwrap()).unwrap();
        let b = serde_json::to_string(&ExecutionInstance::from_events(exec, &log).unwrap()).unwrap();
        assert_eq!(a, b);
    }
}
