//! Execution state machine.
//!
//! Decisions are pure functions of a projection and `now`: each call yields
//! at most one event payload. The coordinator appends it, applies it to the
//! projection and asks again until nothing is left to decide.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::engine::context::{base_context, deep_merge, transition_context};
use crate::engine::evaluator::TransitionEvaluator;
use crate::engine::retry::{self, RetryDecision};
use crate::engine::state::{ExecutionInstance, StepInstance, StepState};
use crate::error::{AppError, AppResult, ErrorKind, StepError};
use crate::events::{ActivationOutcome, EventPayload, ExecutionStatus, InstanceSeed, Token};
use crate::playbook::{Playbook, RetryPolicy, Step, StepGraph};
use crate::scheduler::ReadyStep;

pub const SKIP_DEAD_PATH: &str = "dead_path";
pub const SKIP_WHEN_FALSE: &str = "when_false";
pub const SKIP_CANCELLED: &str = "cancelled";

/// One event to append, optionally scoped to a step instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub step_instance_id: Option<u64>,
    pub payload: EventPayload,
}

impl Decision {
    fn execution(payload: EventPayload) -> Self {
        Self {
            step_instance_id: None,
            payload,
        }
    }

    fn instance(step_instance_id: u64, payload: EventPayload) -> Self {
        Self {
            step_instance_id: Some(step_instance_id),
            payload,
        }
    }
}

/// Result reported by a worker for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success {
        result: Value,
        duration_ms: Option<u64>,
    },
    Failure {
        error: StepError,
    },
}

/// Decision logic for executions of one playbook.
pub struct StateMachine<'a> {
    playbook: &'a Playbook,
    graph: &'a StepGraph,
    evaluator: &'a TransitionEvaluator,
}

impl<'a> StateMachine<'a> {
    pub fn new(playbook: &'a Playbook, graph: &'a StepGraph, evaluator: &'a TransitionEvaluator) -> Self {
        Self {
            playbook,
            graph,
            evaluator,
        }
    }

    /// `ExecutionStarted` with one live token per root step.
    pub fn start(&self, workload: Map<String, Value>) -> EventPayload {
        let id = self.playbook.id();
        let tokens = self
            .graph
            .roots()
            .iter()
            .enumerate()
            .map(|(i, root)| Token {
                token_id: i as u64 + 1,
                target: root.clone(),
                iteration_index: None,
                context: Map::new(),
                parent_token_id: None,
                source_step: None,
                source_activation: None,
                live: true,
            })
            .collect();

        EventPayload::ExecutionStarted {
            path: id.path,
            version: id.version,
            workload,
            tokens,
        }
    }

    /// Next event the execution needs, if any.
    pub fn decide(&self, exec: &ExecutionInstance, now: DateTime<Utc>) -> Option<Decision> {
        match exec.status {
            ExecutionStatus::Running => self
                .evaluate_transitions(exec)
                .or_else(|| self.activate(exec))
                .or_else(|| self.release_retries(exec, now))
                .or_else(|| self.expire_deadlines(exec, now))
                .or_else(|| self.complete(exec)),
            // Running attempts of a cancelled execution still time out so
            // their pools are released.
            ExecutionStatus::Cancelled => self.expire_deadlines(exec, now),
            ExecutionStatus::Completed | ExecutionStatus::Failed => None,
        }
    }

    /// Pending instances, in the shape the scheduler admits.
    pub fn ready_steps(&self, exec: &ExecutionInstance) -> Vec<ReadyStep> {
        if exec.status != ExecutionStatus::Running {
            return Vec::new();
        }
        exec.pending_instances()
            .filter_map(|instance| {
                let activation = exec.activations.get(&instance.activation_id)?;
                let step = self.playbook.get_step(&instance.step_name)?;
                Some(ReadyStep {
                    execution_id: exec.execution_id,
                    step_instance_id: instance.step_instance_id,
                    step_name: instance.step_name.clone(),
                    pools: step.requested_pools(&self.playbook.resources),
                    arrived_at: activation.arrived_at,
                    arrival_event: activation.arrival_event,
                    declaration_index: self.playbook.step_index(&instance.step_name).unwrap_or(usize::MAX),
                    iteration_index: instance.iteration_index,
                })
            })
            .collect()
    }

    /// `StepScheduled` for an admitted pending instance.
    pub fn schedule(
        &self,
        exec: &ExecutionInstance,
        step_instance_id: u64,
        pools: Vec<String>,
        now: DateTime<Utc>,
    ) -> AppResult<Decision> {
        let instance = exec.instance(step_instance_id)?;
        if instance.state != StepState::Pending {
            return Err(AppError::Conflict(format!(
                "instance {} is {}, not pending",
                step_instance_id, instance.state
            )));
        }
        Ok(Decision::instance(
            step_instance_id,
            EventPayload::StepScheduled {
                attempt: instance.attempt + 1,
                pools,
                deadline: self.deadline_for(&instance.step_name, now),
            },
        ))
    }

    /// `StepStarted` when a worker acknowledges the current attempt.
    pub fn on_ack(
        &self,
        exec: &ExecutionInstance,
        step_instance_id: u64,
        attempt: u32,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Decision> {
        let instance = exec.instances.get(&step_instance_id)?;
        if instance.state != StepState::Scheduled || instance.attempt != attempt {
            return None;
        }
        Some(Decision::instance(
            step_instance_id,
            EventPayload::StepStarted {
                attempt,
                worker_id: worker_id.to_string(),
                deadline: self.deadline_for(&instance.step_name, now),
            },
        ))
    }

    /// Record a worker result.
    ///
    /// A result for the current attempt of a scheduled or running instance
    /// settles it (a missing ack is implied). Anything else is late.
    pub fn on_result(
        &self,
        exec: &ExecutionInstance,
        step_instance_id: u64,
        attempt: u32,
        outcome: StepOutcome,
        now: DateTime<Utc>,
    ) -> AppResult<Decision> {
        let instance = exec.instance(step_instance_id)?;
        let current = instance.attempt == attempt
            && matches!(instance.state, StepState::Scheduled | StepState::Running);

        if !current {
            let (status, error_kind) = match &outcome {
                StepOutcome::Success { .. } => ("success", None),
                StepOutcome::Failure { error } => ("failure", Some(error.kind)),
            };
            return Ok(Decision::instance(
                step_instance_id,
                EventPayload::LateResultRecorded {
                    attempt,
                    status: status.to_string(),
                    error_kind,
                },
            ));
        }

        Ok(match outcome {
            StepOutcome::Success {
                result,
                duration_ms,
            } => Decision::instance(
                step_instance_id,
                EventPayload::StepSucceeded {
                    attempt,
                    result,
                    duration_ms,
                },
            ),
            StepOutcome::Failure { error } => self.failure(exec, instance, error, now),
        })
    }

    /// Fail the current attempt of a scheduled or running instance through
    /// the retry policy (dispatch errors, timeouts).
    pub fn fail_attempt(
        &self,
        exec: &ExecutionInstance,
        step_instance_id: u64,
        error: StepError,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Decision>> {
        let instance = exec.instance(step_instance_id)?;
        if !matches!(instance.state, StepState::Scheduled | StepState::Running) {
            return Ok(None);
        }
        Ok(Some(self.failure(exec, instance, error, now)))
    }

    /// `ExecutionCancelled`, then a skip for every instance not yet running.
    pub fn cancel(&self, exec: &ExecutionInstance, reason: &str) -> Vec<Decision> {
        if exec.status.is_terminal() {
            return Vec::new();
        }
        let mut decisions = vec![Decision::execution(EventPayload::ExecutionCancelled {
            reason: reason.to_string(),
        })];
        for instance in exec.instances.values() {
            if matches!(
                instance.state,
                StepState::Pending | StepState::Scheduled | StepState::Retrying
            ) {
                decisions.push(Decision::instance(
                    instance.step_instance_id,
                    EventPayload::StepSkipped {
                        reason: SKIP_CANCELLED.to_string(),
                    },
                ));
            }
        }
        decisions
    }

    fn step(&self, name: &str) -> Option<&'a Step> {
        self.playbook.get_step(name)
    }

    fn policy_for(&self, name: &str) -> RetryPolicy {
        self.step(name)
            .map(Step::retry_policy)
            .unwrap_or_else(|| Step::new(name).retry_policy())
    }

    fn deadline_for(&self, name: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.step(name)
            .and_then(|s| s.timeout)
            .map(|secs| now + Duration::seconds(secs as i64))
    }

    fn failure(
        &self,
        exec: &ExecutionInstance,
        instance: &StepInstance,
        error: StepError,
        now: DateTime<Utc>,
    ) -> Decision {
        let attempt = instance.attempt;
        let decision = if exec.status == ExecutionStatus::Running {
            retry::decide(&self.policy_for(&instance.step_name), attempt, error.kind, now)
        } else {
            RetryDecision::Fail
        };

        let payload = match decision {
            RetryDecision::Retry { next_eligible_at } => EventPayload::StepRetrying {
                attempt,
                error,
                next_eligible_at,
            },
            RetryDecision::Fail => EventPayload::StepFailed { attempt, error },
        };
        Decision::instance(instance.step_instance_id, payload)
    }

    fn evaluate_transitions(&self, exec: &ExecutionInstance) -> Option<Decision> {
        let activation = exec
            .activations
            .values()
            .find(|a| a.outcome.is_none() && exec.activation_terminal(a))?;

        let outcome = exec.activation_outcome(activation);
        let mut next_token = exec.next_token_id();
        let mut tokens = Vec::new();
        let mut push = |target: String, source: &str, live: bool, context: Map<String, Value>| {
            tokens.push(Token {
                token_id: next_token,
                target,
                iteration_index: None,
                context,
                parent_token_id: activation.consumed_tokens.last().copied(),
                source_step: Some(source.to_string()),
                source_activation: Some(activation.activation_id),
                live,
            });
            next_token += 1;
        };

        match outcome {
            ActivationOutcome::Skipped => {
                for (pred, join) in self.graph.dead_join_edges(&activation.step_name) {
                    push(join, pred.as_str(), false, Map::new());
                }
            }
            ActivationOutcome::Succeeded | ActivationOutcome::Failed => {
                if let Some(step) = self.step(&activation.step_name) {
                    let result = exec.activation_result(activation);
                    let error = exec
                        .activation_error(activation)
                        .and_then(|e| serde_json::to_value(e).ok());
                    let status = match outcome {
                        ActivationOutcome::Succeeded => "succeeded",
                        _ => "failed",
                    };
                    let context = transition_context(exec, activation, status, &result, error.as_ref());

                    for rule in self.evaluator.evaluate_rules(step, outcome, &context) {
                        if rule.live {
                            let mut child = activation.context.clone();
                            child.insert(step.step.clone(), result.clone());
                            deep_merge(&mut child, &rule.args);
                            push(rule.target, step.step.as_str(), true, child);
                        } else if !self.graph.is_back_edge(&step.step, &rule.target) {
                            push(rule.target, step.step.as_str(), false, Map::new());
                        }
                    }
                }
            }
        }

        Some(Decision::execution(EventPayload::TransitionsEvaluated {
            activation_id: activation.activation_id,
            outcome,
            tokens,
        }))
    }

    fn activate(&self, exec: &ExecutionInstance) -> Option<Decision> {
        for record in exec.unconsumed_tokens() {
            let token = &record.token;
            let Some(step) = self.step(&token.target) else {
                continue;
            };

            let direct = match token.source_step.as_deref() {
                None => true,
                Some(source) => {
                    !self.graph.is_join(&token.target)
                        || self.graph.is_back_edge(source, &token.target)
                        || !self.graph.predecessors(&token.target).iter().any(|p| p == source)
                }
            };

            if direct {
                return Some(self.create_activation(
                    exec,
                    step,
                    vec![token.token_id],
                    token.live,
                    token.context.clone(),
                ));
            }

            if let Some((consumed, live, context)) = self.try_join(exec, &token.target) {
                return Some(self.create_activation(exec, step, consumed, live, context));
            }
        }
        None
    }

    /// Take the earliest waiting token from every predecessor of `join`.
    fn try_join(&self, exec: &ExecutionInstance, join: &str) -> Option<(Vec<u64>, bool, Map<String, Value>)> {
        let mut consumed = Vec::new();
        let mut live = false;
        let mut context = Map::new();

        for pred in self.graph.predecessors(join) {
            let record = exec.unconsumed_tokens().find(|t| {
                t.token.target == join && t.token.source_step.as_deref() == Some(pred.as_str())
            })?;
            consumed.push(record.token.token_id);
            if record.token.live {
                live = true;
                deep_merge(&mut context, &record.token.context);
            }
        }
        Some((consumed, live, context))
    }

    fn create_activation(
        &self,
        exec: &ExecutionInstance,
        step: &Step,
        consumed_tokens: Vec<u64>,
        live: bool,
        context: Map<String, Value>,
    ) -> Decision {
        let activation_id = exec.next_activation_id();
        let first_instance = exec.next_instance_id();
        let single = vec![InstanceSeed {
            step_instance_id: first_instance,
            iteration_index: None,
            item: None,
        }];

        let (instances, skip_reason, error) = if !live {
            (single, Some(SKIP_DEAD_PATH.to_string()), None)
        } else {
            let eval_context = base_context(exec, &context);
            if !self.evaluator.evaluate_guard(step, &eval_context) {
                (single, Some(SKIP_WHEN_FALSE.to_string()), None)
            } else if let Some(ref lp) = step.r#loop {
                match self.evaluator.evaluate_loop(lp, &eval_context) {
                    Ok(items) => (
                        items
                            .into_iter()
                            .enumerate()
                            .map(|(i, item)| InstanceSeed {
                                step_instance_id: first_instance + i as u64,
                                iteration_index: Some(i),
                                item: Some(item),
                            })
                            .collect(),
                        None,
                        None,
                    ),
                    Err(e) => {
                        warn!(step = %step.step, error = %e, "Iterator evaluation failed");
                        (Vec::new(), None, Some(e))
                    }
                }
            } else {
                (single, None, None)
            }
        };

        Decision::execution(EventPayload::ActivationCreated {
            activation_id,
            step_name: step.step.clone(),
            consumed_tokens,
            context,
            instances,
            skip_reason,
            error,
        })
    }

    fn release_retries(&self, exec: &ExecutionInstance, now: DateTime<Utc>) -> Option<Decision> {
        let instance = exec.instances.values().find(|i| {
            i.state == StepState::Retrying && i.next_eligible_at.is_some_and(|at| at <= now)
        })?;
        Some(Decision::instance(
            instance.step_instance_id,
            EventPayload::StepScheduled {
                attempt: instance.attempt + 1,
                pools: instance.pools.clone(),
                deadline: self.deadline_for(&instance.step_name, now),
            },
        ))
    }

    fn expire_deadlines(&self, exec: &ExecutionInstance, now: DateTime<Utc>) -> Option<Decision> {
        let instance = exec.instances.values().find(|i| {
            matches!(i.state, StepState::Scheduled | StepState::Running)
                && i.deadline.is_some_and(|at| at <= now)
        })?;
        let timeout = self.step(&instance.step_name).and_then(|s| s.timeout).unwrap_or(0);
        let error = StepError::new(
            ErrorKind::Timeout,
            format!("attempt {} exceeded timeout of {}s", instance.attempt, timeout),
        );
        Some(self.failure(exec, instance, error, now))
    }

    fn complete(&self, exec: &ExecutionInstance) -> Option<Decision> {
        if exec.activations.values().any(|a| a.outcome.is_none())
            || exec.instances.values().any(|i| !i.state.is_terminal())
        {
            return None;
        }

        let stranded = exec.unconsumed_tokens().filter(|t| t.token.live).count();
        if stranded > 0 {
            warn!(
                execution_id = %exec.execution_id,
                stranded,
                "Execution finished with live tokens waiting at joins"
            );
        }

        let mut failed_steps: Vec<String> = Vec::new();
        for activation in exec.activations.values() {
            if activation.outcome == Some(ActivationOutcome::Failed)
                && !activation.fired_live
                && !failed_steps.contains(&activation.step_name)
            {
                failed_steps.push(activation.step_name.clone());
            }
        }
        let status = if failed_steps.is_empty() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };

        Some(Decision::execution(EventPayload::ExecutionCompleted {
            status,
            failed_steps,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::playbook::parse_playbook;
    use serde_json::json;
    use uuid::Uuid;

    fn playbook(workflow: &str) -> Playbook {
        let yaml = format!(
            "apiVersion: noetl.io/v2\nkind: Playbook\nmetadata:\n  name: m\nworkflow:\n{}",
            workflow
        );
        parse_playbook(&yaml).unwrap()
    }

    fn apply(exec: &mut ExecutionInstance, decision: Decision, now: DateTime<Utc>) {
        let event = Event::new(
            exec.next_event_id(),
            exec.execution_id,
            decision.step_instance_id,
            now,
            decision.payload,
        );
        exec.apply(&event).unwrap();
    }

    fn settle(machine: &StateMachine, exec: &mut ExecutionInstance, now: DateTime<Utc>) {
        while let Some(decision) = machine.decide(exec, now) {
            apply(exec, decision, now);
        }
    }

    fn started(machine: &StateMachine, now: DateTime<Utc>) -> ExecutionInstance {
        let mut exec = ExecutionInstance::new(Uuid::new_v4());
        apply(&mut exec, Decision::execution(machine.start(Map::new())), now);
        settle(machine, &mut exec, now);
        exec
    }

    /// Run every pending instance to a result produced by `worker`.
    fn drive(
        machine: &StateMachine,
        exec: &mut ExecutionInstance,
        now: DateTime<Utc>,
        worker: impl Fn(&StepInstance) -> StepOutcome,
    ) {
        loop {
            settle(machine, exec, now);
            let ready: Vec<u64> = exec.pending_instances().map(|i| i.step_instance_id).collect();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                let decision = machine.schedule(exec, id, Vec::new(), now).unwrap();
                apply(exec, decision, now);
                let instance = exec.instance(id).unwrap().clone();
                let decision = machine
                    .on_result(exec, id, instance.attempt, worker(&instance), now)
                    .unwrap();
                apply(exec, decision, now);
            }
        }
    }

    fn states(exec: &ExecutionInstance) -> Vec<String> {
        exec.step_states()
            .into_iter()
            .map(|(name, state)| format!("{}:{}", name, state))
            .collect()
    }

    const CONDITIONAL: &str = r#"
  - step: A
    next:
      - step: B
        when: "{{ result.ok }}"
  - step: B
    next: C
  - step: C
"#;

    #[test]
    fn test_conditional_chain_taken() {
        let pb = playbook(CONDITIONAL);
        let graph = StepGraph::new(&pb);
        let evaluator = TransitionEvaluator::new();
        let machine = StateMachine::new(&pb, &graph, &evaluator);
        let now = Utc::now();

        let mut exec = started(&machine, now);
        drive(&machine, &mut exec, now, |_| StepOutcome::Success {
            result: json!({"ok": true}),
            duration_ms: None,
        });

        assert_eq!(states(&exec), vec!["A:succeeded", "B:succeeded", "C:succeeded"]);
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_conditional_chain_not_taken() {
        let pb = playbook(CONDITIONAL);
        let graph = StepGraph::new(&pb);
        let evaluator = TransitionEvaluator::new();
        let machine = StateMachine::new(&pb, &graph, &evaluator);
        let now = Utc::now();

        let mut exec = started(&machine, now);
        drive(&machine, &mut exec, now, |_| StepOutcome::Success {
            result: json!({"ok": false}),
            duration_ms: None,
        });

        assert_eq!(states(&exec), vec!["A:succeeded", "B:skipped"]);
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_unhandled_failure_fails_execution() {
        let pb = playbook(CONDITIONAL);
        let graph = StepGraph::new(&pb);
        let evaluator = TransitionEvaluator::new();
        let machine = StateMachine::new(&pb, &graph, &evaluator);
        let now = Utc::now();

        let mut exec = started(&machine, now);
        drive(&machine, &mut exec, now, |i| {
            if i.step_name == "B" {
                StepOutcome::Failure {
                    error: StepError::new(ErrorKind::Permanent, "boom"),
                }
            } else {
                StepOutcome::Success {
                    result: json!({"ok": true}),
                    duration_ms: None,
                }
            }
        });

        assert_eq!(states(&exec), vec!["A:succeeded", "B:failed", "C:skipped"]);
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.failed_steps, vec!["B"]);
    }

    #[test]
    fn test_failure_handler_rule() {
        let pb = playbook(
            r#"
  - step: A
    next:
      - step: done
      - step: recover
        when: "{{ status == 'failed' }}"
  - step: done
  - step: recover
"#,
        );
        let graph = StepGraph::new(&pb);
        let evaluator = TransitionEvaluator::new();
        let machine = StateMachine::new(&pb, &graph, &evaluator);
        let now = Utc::now();

        let mut exec = started(&machine, now);
        drive(&machine, &mut exec, now, |i| {
            if i.step_name == "A" {
                StepOutcome::Failure {
                    error: StepError::new(ErrorKind::Permanent, "boom"),
                }
            } else {
                StepOutcome::Success {
                    result: Value::Null,
                    duration_ms: None,
                }
            }
        });

        assert_eq!(
            states(&exec),
            vec!["A:failed", "done:skipped", "recover:succeeded"]
        );
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_diamond_join_with_dead_branch() {
        let pb = playbook(
            r#"
  - step: start
    next:
      - step: left
        when: "{{ workload.go_left | default(false) }}"
      - step: right
  - step: left
    next: merge
  - step: right
    next: merge
  - step: merge
"#,
        );
        let graph = StepGraph::new(&pb);
        let evaluator = TransitionEvaluator::new();
        let machine = StateMachine::new(&pb, &graph, &evaluator);
        let now = Utc::now();

        let mut exec = started(&machine, now);
        drive(&machine, &mut exec, now, |i| StepOutcome::Success {
            result: json!({"from": i.step_name}),
            duration_ms: None,
        });

        assert_eq!(
            states(&exec),
            vec!["start:succeeded", "left:skipped", "right:succeeded", "merge:succeeded"]
        );
        let merge = exec
            .activations
            .values()
            .find(|a| a.step_name == "merge")
            .unwrap();
        assert_eq!(merge.consumed_tokens.len(), 2);
        assert_eq!(merge.context["right"], json!({"from": "right"}));
    }

    #[test]
    fn test_iterator_fan_out_and_fan_in() {
        let pb = playbook(
            r#"
  - step: fan
    loop:
      in: [10, 20, 30, 40, 50]
      iterator: n
    next: collect
  - step: collect
"#,
        );
        let graph = StepGraph::new(&pb);
        let evaluator = TransitionEvaluator::new();
        let machine = StateMachine::new(&pb, &graph, &evaluator);
        let now = Utc::now();

        let mut exec = started(&machine, now);
        let fan: Vec<&StepInstance> = exec.instances.values().collect();
        assert_eq!(fan.len(), 5);
        let indexes: Vec<Option<usize>> = fan.iter().map(|i| i.iteration_index).collect();
        assert_eq!(indexes, vec![Some(0), Some(1), Some(2), Some(3), Some(4)]);

        drive(&machine, &mut exec, now, |i| StepOutcome::Success {
            result: json!(i.item.clone().unwrap_or(Value::Null)),
            duration_ms: None,
        });

        let collect: Vec<&StepInstance> = exec
            .instances
            .values()
            .filter(|i| i.step_name == "collect")
            .collect();
        assert_eq!(collect.len(), 1);
        let activation = &exec.activations[&collect[0].activation_id];
        assert_eq!(activation.context["fan"], json!([10, 20, 30, 40, 50]));
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_empty_iterator_succeeds() {
        let pb = playbook(
            r#"
  - step: fan
    loop:
      in: "{{ [] }}"
      iterator: n
    next: after
  - step: after
"#,
        );
        let graph = StepGraph::new(&pb);
        let evaluator = TransitionEvaluator::new();
        let machine = StateMachine::new(&pb, &graph, &evaluator);
        let now = Utc::now();

        let exec = started(&machine, now);
        let after = exec
            .activations
            .values()
            .find(|a| a.step_name == "after")
            .unwrap();
        assert_eq!(after.context["fan"], json!([]));
    }

    #[test]
    fn test_retry_exhaustion_history() {
        let pb = playbook(
            r#"
  - step: flaky
    retry:
      max_attempts: 3
      backoff:
        type: fixed
        delay_ms: 0
"#,
        );
        let graph = StepGraph::new(&pb);
        let evaluator = TransitionEvaluator::new();
        let machine = StateMachine::new(&pb, &graph, &evaluator);
        let now = Utc::now();

        let mut exec = started(&machine, now);
        let id = 1;
        let decision = machine.schedule(&exec, id, Vec::new(), now).unwrap();
        apply(&mut exec, decision, now);
        for _ in 0..3 {
            let attempt = exec.instance(id).unwrap().attempt;
            let decision = machine.on_ack(&exec, id, attempt, "w1", now).unwrap();
            apply(&mut exec, decision, now);
            let failure = StepOutcome::Failure {
                error: StepError::new(ErrorKind::Transient, "reset"),
            };
            let decision = machine.on_result(&exec, id, attempt, failure, now).unwrap();
            apply(&mut exec, decision, now);
            settle(&machine, &mut exec, now);
        }

        let instance = exec.instance(id).unwrap();
        assert_eq!(
            instance.history,
            vec![
                StepState::Pending,
                StepState::Scheduled,
                StepState::Running,
                StepState::Retrying,
                StepState::Scheduled,
                StepState::Running,
                StepState::Retrying,
                StepState::Scheduled,
                StepState::Running,
                StepState::Failed,
            ]
        );
        assert_eq!(exec.status, ExecutionStatus::Failed);
    }

    #[test]
    fn test_late_result_changes_nothing() {
        let pb = playbook("  - step: only\n    timeout: 1\n");
        let graph = StepGraph::new(&pb);
        let evaluator = TransitionEvaluator::new();
        let machine = StateMachine::new(&pb, &graph, &evaluator);
        let now = Utc::now();

        let mut exec = started(&machine, now);
        let decision = machine.schedule(&exec, 1, Vec::new(), now).unwrap();
        apply(&mut exec, decision, now);

        let later = now + Duration::seconds(5);
        settle(&machine, &mut exec, later);
        assert_eq!(exec.instance(1).unwrap().state, StepState::Failed);
        assert_eq!(
            exec.instance(1).unwrap().error.as_ref().unwrap().kind,
            ErrorKind::Timeout
        );

        let before = exec.clone();
        let success = StepOutcome::Success {
            result: json!(1),
            duration_ms: None,
        };
        let decision = machine.on_result(&exec, 1, 1, success, later).unwrap();
        assert!(matches!(decision.payload, EventPayload::LateResultRecorded { .. }));
        apply(&mut exec, decision, later);
        assert_eq!(exec.instance(1).unwrap().state, before.instance(1).unwrap().state);
        assert_eq!(exec.status, before.status);
    }

    #[test]
    fn test_step_when_false_skips() {
        let pb = playbook(
            r#"
  - step: gate
    when: "{{ workload.enabled | default(false) }}"
    next: after
  - step: after
"#,
        );
        let graph = StepGraph::new(&pb);
        let evaluator = TransitionEvaluator::new();
        let machine = StateMachine::new(&pb, &graph, &evaluator);

        let exec = started(&machine, Utc::now());
        assert_eq!(states(&exec), vec!["gate:skipped"]);
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[test]
    fn test_cancel_skips_waiting_instances() {
        let pb = playbook("  - step: start\n    next: [a, b]\n  - step: a\n  - step: b\n");
        let graph = StepGraph::new(&pb);
        let evaluator = TransitionEvaluator::new();
        let machine = StateMachine::new(&pb, &graph, &evaluator);
        let now = Utc::now();

        let mut exec = started(&machine, now);
        let decision = machine.schedule(&exec, 1, vec!["p".to_string()], now).unwrap();
        apply(&mut exec, decision, now);
        for decision in machine.cancel(&exec, "user request") {
            apply(&mut exec, decision, now);
        }
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert_eq!(exec.instance(1).unwrap().state, StepState::Skipped);
        assert!(exec.pools_in_use().is_empty());
        assert!(machine.decide(&exec, now).is_none());
    }
}
