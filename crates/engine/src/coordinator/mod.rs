//! The single logical coordinator.
//!
//! Owns the playbook registry, the execution projections and the pool set
//! behind one mutex, so every capacity decision is serialized. It acts only
//! while it holds leadership of the event store. Projections are caches of
//! the event logs: a store error suspends scheduling and the next call
//! rebuilds everything from the logs before deciding anything.

pub mod registry;
pub mod service;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatch::protocol::{AckMessage, CancelMessage, ResultMessage, ResultStatus, TriggerMessage};
use crate::dispatch::Dispatcher;
use crate::engine::context::merge_workload;
use crate::engine::{Decision, ExecutionInstance, StateMachine, StepOutcome, StepState, TransitionEvaluator};
use crate::error::{AppError, AppResult, ErrorKind, StepError};
use crate::events::{Event, EventLog, EventPage, EventPayload, ExecutionStatus};
use crate::nats::Inbound;
use crate::playbook::{Playbook, PlaybookId};
use crate::scheduler::{plan, plan_schedule, PoolLedger, PoolSet, PoolUsage, ProjectedSchedule, ReadyStep};

pub use registry::{load_playbooks, PlaybookRegistry, RegisteredPlaybook};

struct CoordinatorState {
    registry: PlaybookRegistry,
    pools: PoolSet,
    executions: BTreeMap<Uuid, ExecutionInstance>,
    leader: bool,
    suspended: Option<String>,
}

impl CoordinatorState {
    fn execution(&self, execution_id: Uuid) -> AppResult<&ExecutionInstance> {
        self.executions
            .get(&execution_id)
            .ok_or_else(|| AppError::NotFound(format!("execution {}", execution_id)))
    }

    fn playbook_for(&self, execution_id: Uuid) -> AppResult<Arc<RegisteredPlaybook>> {
        let exec = self.execution(execution_id)?;
        self.registry.get(&exec.path, Some(&exec.version))
    }

    fn ledger(&self) -> PoolLedger {
        let mut ledger = PoolLedger::new(&self.pools);
        for exec in self.executions.values() {
            ledger.record(&exec.pools_in_use());
        }
        ledger
    }
}

pub struct Coordinator {
    id: String,
    log: EventLog,
    dispatcher: Dispatcher,
    evaluator: TransitionEvaluator,
    overrides: BTreeMap<String, i64>,
    state: Mutex<CoordinatorState>,
}

impl Coordinator {
    /// Build a coordinator; it recovers from the log on first use.
    pub fn new(
        id: impl Into<String>,
        log: EventLog,
        dispatcher: Dispatcher,
        overrides: BTreeMap<String, i64>,
    ) -> AppResult<Self> {
        let pools = PoolSet::with_overrides(&overrides)?;
        Ok(Self {
            id: id.into(),
            log,
            dispatcher,
            evaluator: TransitionEvaluator::new(),
            overrides,
            state: Mutex::new(CoordinatorState {
                registry: PlaybookRegistry::new(),
                pools,
                executions: BTreeMap::new(),
                leader: false,
                suspended: Some("not recovered".to_string()),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register a playbook version and its pools.
    ///
    /// Pool declarations are validated against every pool already known;
    /// a step requesting an undeclared pool is a capacity deadlock.
    pub async fn register_playbook(&self, playbook: Playbook) -> AppResult<PlaybookId> {
        let mut state = self.state.lock().await;
        let mut pools = state.pools.clone();
        pools.declare(&playbook.resources)?;
        pools.validate_requirements(&playbook)?;

        let id = state.registry.register(playbook)?;
        state.pools = pools;
        info!(coordinator = %self.id, playbook = %id, "Registered playbook");
        Ok(id)
    }

    /// Start an execution of a registered playbook.
    ///
    /// The workload is the playbook workload deep-merged with `payload`.
    pub async fn start_execution(
        &self,
        path: &str,
        version: Option<&str>,
        payload: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> AppResult<Uuid> {
        let mut state = self.active(now).await?;
        let entry = state.registry.get(path, version)?;
        let machine = StateMachine::new(&entry.playbook, &entry.graph, &self.evaluator);

        let execution_id = Uuid::new_v4();
        let workload = merge_workload(&entry.playbook.workload, &payload);
        state
            .executions
            .insert(execution_id, ExecutionInstance::new(execution_id));

        let started = Decision {
            step_instance_id: None,
            payload: machine.start(workload),
        };
        if let Err(e) = self.append(&mut state, execution_id, started, now).await {
            state.executions.remove(&execution_id);
            return Err(e);
        }

        info!(
            execution_id = %execution_id,
            playbook = %entry.playbook.id(),
            "Execution started"
        );

        self.advance_locked(&mut state, execution_id, now).await?;
        self.schedule_locked(&mut state, now).await?;
        Ok(execution_id)
    }

    /// Run the state machine of one execution to a fixpoint and return its
    /// pending instances.
    pub async fn advance(&self, execution_id: Uuid, now: DateTime<Utc>) -> AppResult<Vec<ReadyStep>> {
        let mut state = self.active(now).await?;
        self.advance_locked(&mut state, execution_id, now).await
    }

    /// Admit pending instances against pool capacity and dispatch them.
    /// Returns how many were admitted.
    pub async fn schedule(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let mut state = self.active(now).await?;
        self.schedule_locked(&mut state, now).await
    }

    /// Timer: release retries, expire deadlines, then schedule.
    pub async fn tick(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let mut state = self.state.lock().await;
        match self.log.store().try_acquire_leadership(&self.id).await {
            Ok(true) => {}
            Ok(false) => {
                if state.leader {
                    warn!(coordinator = %self.id, "Lost leadership");
                }
                state.leader = false;
                return Err(AppError::NotLeader(self.id.clone()));
            }
            Err(e) => {
                self.suspend(&mut state, &e);
                return Err(AppError::Suspended(e.to_string()));
            }
        }
        self.ensure_active(&mut state, now).await?;

        let live: Vec<Uuid> = state
            .executions
            .iter()
            .filter(|(_, exec)| matches!(exec.status, ExecutionStatus::Running | ExecutionStatus::Cancelled))
            .map(|(id, _)| *id)
            .collect();
        for execution_id in live {
            if let Err(e) = state.playbook_for(execution_id) {
                warn!(execution_id = %execution_id, error = %e, "Execution has no playbook");
                continue;
            }
            self.advance_locked(&mut state, execution_id, now).await?;
        }
        self.schedule_locked(&mut state, now).await
    }

    /// A worker acknowledged an attempt.
    pub async fn ingest_ack(&self, ack: AckMessage, now: DateTime<Utc>) -> AppResult<()> {
        let mut state = self.active(now).await?;
        let Some(entry) = self.known(&state, ack.execution_id) else {
            return Ok(());
        };
        let machine = StateMachine::new(&entry.playbook, &entry.graph, &self.evaluator);

        let decision = {
            let exec = state.execution(ack.execution_id)?;
            machine.on_ack(exec, ack.step_instance_id, ack.attempt, &ack.worker_id, now)
        };
        match decision {
            Some(decision) => {
                self.append(&mut state, ack.execution_id, decision, now).await?;
            }
            None => debug!(
                execution_id = %ack.execution_id,
                step_instance_id = ack.step_instance_id,
                attempt = ack.attempt,
                "Ignoring stale ack"
            ),
        }
        Ok(())
    }

    /// A worker reported the outcome of an attempt.
    pub async fn ingest_result(&self, result: ResultMessage, now: DateTime<Utc>) -> AppResult<()> {
        let mut state = self.active(now).await?;
        let Some(entry) = self.known(&state, result.execution_id) else {
            return Ok(());
        };
        let machine = StateMachine::new(&entry.playbook, &entry.graph, &self.evaluator);

        let outcome = match result.status {
            ResultStatus::Success => StepOutcome::Success {
                result: result.result.unwrap_or(Value::Null),
                duration_ms: result.duration_ms,
            },
            ResultStatus::Failure => StepOutcome::Failure {
                error: result.error.map(StepError::from).unwrap_or_else(|| {
                    StepError::new(ErrorKind::Permanent, "worker reported failure without error")
                }),
            },
        };

        let decision = {
            let exec = state.execution(result.execution_id)?;
            match machine.on_result(exec, result.step_instance_id, result.attempt, outcome, now) {
                Ok(decision) => decision,
                Err(AppError::NotFound(what)) => {
                    warn!(execution_id = %result.execution_id, "Result for unknown {}", what);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        };
        self.append(&mut state, result.execution_id, decision, now).await?;

        self.advance_locked(&mut state, result.execution_id, now).await?;
        self.schedule_locked(&mut state, now).await?;
        Ok(())
    }

    /// Route one inbound bus message.
    pub async fn ingest(&self, message: Inbound, now: DateTime<Utc>) -> AppResult<()> {
        match message {
            Inbound::Ack(ack) => self.ingest_ack(ack, now).await,
            Inbound::Result(result) => self.ingest_result(result, now).await,
            Inbound::Trigger(TriggerMessage { path, version, payload }) => self
                .start_execution(&path, version.as_deref(), payload, now)
                .await
                .map(|_| ()),
        }
    }

    /// Cancel an execution: skip everything not yet running and ask workers
    /// to stop the attempts already handed out.
    pub async fn cancel(&self, execution_id: Uuid, reason: &str, now: DateTime<Utc>) -> AppResult<()> {
        let mut state = self.active(now).await?;
        let entry = state.playbook_for(execution_id)?;
        let machine = StateMachine::new(&entry.playbook, &entry.graph, &self.evaluator);

        let (decisions, in_flight) = {
            let exec = state.execution(execution_id)?;
            let in_flight: Vec<u64> = exec
                .instances
                .values()
                .filter(|i| matches!(i.state, StepState::Scheduled | StepState::Running))
                .map(|i| i.step_instance_id)
                .collect();
            (machine.cancel(exec, reason), in_flight)
        };
        if decisions.is_empty() {
            return Ok(());
        }
        for decision in decisions {
            self.append(&mut state, execution_id, decision, now).await?;
        }
        info!(execution_id = %execution_id, reason = %reason, "Execution cancelled");

        if !in_flight.is_empty() {
            let message = CancelMessage {
                execution_id,
                step_instance_ids: in_flight,
            };
            if let Err(e) = self.dispatcher.cancel(&message).await {
                warn!(execution_id = %execution_id, error = %e, "Failed to publish cancel");
            }
        }
        Ok(())
    }

    /// Rebuild every projection from the event logs and republish commands
    /// for instances that were scheduled but never acknowledged.
    pub async fn recover(&self, now: DateTime<Utc>) -> AppResult<()> {
        let mut state = self.state.lock().await;
        self.recover_locked(&mut state, now).await
    }

    /// A page of an execution's (already redacted) events.
    pub async fn events(&self, execution_id: Uuid, after: u64, limit: usize) -> AppResult<EventPage> {
        self.log.read_page(execution_id, after, limit).await
    }

    /// Offline projected schedule for a registered playbook.
    ///
    /// `capacities` override pool capacities on top of the deployment
    /// overrides.
    pub async fn plan(
        &self,
        path: &str,
        version: Option<&str>,
        capacities: &BTreeMap<String, i64>,
    ) -> AppResult<ProjectedSchedule> {
        let entry = {
            let state = self.state.lock().await;
            state.registry.get(path, version)?
        };
        let mut overrides = self.overrides.clone();
        overrides.extend(capacities.iter().map(|(k, v)| (k.clone(), *v)));
        plan_schedule(&entry.playbook, &overrides, &self.evaluator)
    }

    /// Current projection of one execution.
    pub async fn snapshot(&self, execution_id: Uuid) -> AppResult<ExecutionInstance> {
        let state = self.state.lock().await;
        state.execution(execution_id).cloned()
    }

    /// Status of every known execution.
    pub async fn executions(&self) -> Vec<(Uuid, ExecutionStatus)> {
        let state = self.state.lock().await;
        state
            .executions
            .iter()
            .map(|(id, exec)| (*id, exec.status))
            .collect()
    }

    /// Pool usage across all executions.
    pub async fn pool_usage(&self) -> BTreeMap<String, PoolUsage> {
        let state = self.state.lock().await;
        let ledger = state.ledger();
        state
            .pools
            .iter()
            .filter_map(|(name, _)| ledger.usage(name).map(|u| (name.clone(), u)))
            .collect()
    }

    pub async fn is_suspended(&self) -> bool {
        self.state.lock().await.suspended.is_some()
    }

    async fn active(&self, now: DateTime<Utc>) -> AppResult<MutexGuard<'_, CoordinatorState>> {
        let mut state = self.state.lock().await;
        self.ensure_active(&mut state, now).await?;
        Ok(state)
    }

    async fn ensure_active(&self, state: &mut CoordinatorState, now: DateTime<Utc>) -> AppResult<()> {
        if state.leader && state.suspended.is_none() {
            return Ok(());
        }
        self.recover_locked(state, now).await
    }

    async fn recover_locked(&self, state: &mut CoordinatorState, now: DateTime<Utc>) -> AppResult<()> {
        let store = self.log.store();
        let leader = match store.try_acquire_leadership(&self.id).await {
            Ok(leader) => leader,
            Err(e) => {
                self.suspend(state, &e);
                return Err(AppError::Suspended(e.to_string()));
            }
        };
        state.leader = leader;
        if !leader {
            return Err(AppError::NotLeader(self.id.clone()));
        }

        let rebuilt = async {
            let mut executions = BTreeMap::new();
            for execution_id in store.list_executions().await? {
                executions.insert(execution_id, self.log.replay(execution_id).await?);
            }
            Ok::<_, AppError>(executions)
        }
        .await;
        let executions = match rebuilt {
            Ok(executions) => executions,
            Err(e) => {
                self.suspend(state, &e);
                return Err(AppError::Suspended(e.to_string()));
            }
        };

        state.executions = executions;
        state.suspended = None;

        let violations = state.ledger().violations();
        for violation in &violations {
            error!(coordinator = %self.id, "Pool invariant violated after replay: {}", violation);
        }

        // Secrets live only in memory: every dispatched attempt that can
        // still report needs its credentials registered again before any
        // result is ingested. Scheduled attempts are also republished.
        let mut republished = 0;
        let mut reregistered = 0;
        let outstanding: Vec<(Uuid, u64, bool)> = state
            .executions
            .values()
            .filter(|exec| matches!(exec.status, ExecutionStatus::Running | ExecutionStatus::Cancelled))
            .flat_map(|exec| {
                let running = exec.status == ExecutionStatus::Running;
                exec.instances
                    .values()
                    .filter(|i| {
                        matches!(i.state, StepState::Scheduled | StepState::Running | StepState::Retrying)
                    })
                    .map(move |i| {
                        (
                            exec.execution_id,
                            i.step_instance_id,
                            running && i.state == StepState::Scheduled,
                        )
                    })
            })
            .collect();
        for (execution_id, step_instance_id, republish) in outstanding {
            let entry = match state.playbook_for(execution_id) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(execution_id = %execution_id, error = %e, "Cannot restore attempt");
                    continue;
                }
            };
            let exec = state.execution(execution_id)?;
            let command = match self
                .dispatcher
                .prepare(exec, &entry.playbook, step_instance_id, now)
                .await
            {
                Ok(command) => command,
                Err(e) => {
                    warn!(
                        execution_id = %execution_id,
                        step_instance_id,
                        kind = %e.kind,
                        "Cannot restore credentials; the attempt will time out: {}",
                        e.message
                    );
                    continue;
                }
            };
            reregistered += 1;
            if !republish {
                continue;
            }
            match self.dispatcher.publish(&command).await {
                Ok(()) => republished += 1,
                Err(e) => warn!(
                    execution_id = %execution_id,
                    step_instance_id,
                    kind = %e.kind,
                    "Republish failed; the attempt will time out: {}",
                    e.message
                ),
            }
        }

        info!(
            coordinator = %self.id,
            executions = state.executions.len(),
            republished,
            reregistered,
            "Recovered projections from the event log"
        );
        Ok(())
    }

    fn suspend(&self, state: &mut CoordinatorState, cause: &AppError) {
        if state.suspended.is_none() {
            error!(coordinator = %self.id, error = %cause, "Suspending scheduling");
        }
        state.suspended = Some(cause.to_string());
    }

    fn known(&self, state: &CoordinatorState, execution_id: Uuid) -> Option<Arc<RegisteredPlaybook>> {
        match state.playbook_for(execution_id) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Ignoring message for unknown execution");
                None
            }
        }
    }

    /// Append one decision and apply the stored event to the projection.
    async fn append(
        &self,
        state: &mut CoordinatorState,
        execution_id: Uuid,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let next_event_id = state.execution(execution_id)?.next_event_id();
        let event = Event::new(
            next_event_id,
            execution_id,
            decision.step_instance_id,
            now,
            decision.payload,
        );

        let stored = match self.log.append(event).await {
            Ok(stored) => stored,
            Err(e) if e.is_infrastructure() || matches!(e, AppError::Conflict(_)) => {
                self.suspend(state, &e);
                return Err(AppError::Suspended(e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let exec = state
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| AppError::NotFound(format!("execution {}", execution_id)))?;
        exec.apply(&stored)?;

        if let Some(step_instance_id) = stored.step_instance_id {
            if exec.instance(step_instance_id)?.state.is_terminal() {
                self.log.redactor().release((execution_id, step_instance_id));
            }
        }
        if let EventPayload::ExecutionCompleted { status, failed_steps } = &stored.payload {
            self.log.redactor().release_execution(execution_id);
            info!(
                execution_id = %execution_id,
                status = %status,
                failed_steps = ?failed_steps,
                "Execution finished"
            );
        }
        Ok(())
    }

    async fn advance_locked(
        &self,
        state: &mut CoordinatorState,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<ReadyStep>> {
        let entry = state.playbook_for(execution_id)?;
        let machine = StateMachine::new(&entry.playbook, &entry.graph, &self.evaluator);

        loop {
            let Some(decision) = machine.decide(state.execution(execution_id)?, now) else {
                break;
            };
            // A retry whose backoff elapsed is scheduled again and needs a
            // fresh command.
            let rescheduled = match decision.payload {
                EventPayload::StepScheduled { .. } => decision.step_instance_id,
                _ => None,
            };
            self.append(state, execution_id, decision, now).await?;
            if let Some(step_instance_id) = rescheduled {
                self.publish_attempt(state, &entry, &machine, execution_id, step_instance_id, now)
                    .await?;
            }
        }
        Ok(machine.ready_steps(state.execution(execution_id)?))
    }

    async fn schedule_locked(&self, state: &mut CoordinatorState, now: DateTime<Utc>) -> AppResult<usize> {
        let mut total = 0;
        loop {
            let (admitted, failed) = self.schedule_pass(state, now).await?;
            total += admitted;
            // Failed dispatches may have produced new pending work.
            if admitted == 0 || failed == 0 {
                break;
            }
        }
        Ok(total)
    }

    async fn schedule_pass(&self, state: &mut CoordinatorState, now: DateTime<Utc>) -> AppResult<(usize, usize)> {
        let mut ready = Vec::new();
        for exec in state.executions.values() {
            if exec.status != ExecutionStatus::Running {
                continue;
            }
            match state.registry.get(&exec.path, Some(&exec.version)) {
                Ok(entry) => {
                    let machine = StateMachine::new(&entry.playbook, &entry.graph, &self.evaluator);
                    ready.extend(machine.ready_steps(exec));
                }
                Err(e) => warn!(execution_id = %exec.execution_id, error = %e, "Execution has no playbook"),
            }
        }
        if ready.is_empty() {
            return Ok((0, 0));
        }

        let order = plan(ready, &state.ledger());
        if !order.deferred.is_empty() {
            debug!(
                admitted = order.admitted.len(),
                deferred = order.deferred.len(),
                "Steps waiting for capacity"
            );
        }

        let admitted = order.admitted.len();
        let mut failed = 0;
        for step in order.admitted {
            if !self.dispatch_one(state, step, now).await? {
                failed += 1;
            }
        }
        Ok((admitted, failed))
    }

    /// Schedule and publish one admitted instance. Returns false when the
    /// attempt failed at dispatch.
    async fn dispatch_one(&self, state: &mut CoordinatorState, step: ReadyStep, now: DateTime<Utc>) -> AppResult<bool> {
        let execution_id = step.execution_id;
        let entry = state.playbook_for(execution_id)?;
        let machine = StateMachine::new(&entry.playbook, &entry.graph, &self.evaluator);

        let scheduled = machine.schedule(state.execution(execution_id)?, step.step_instance_id, step.pools, now)?;
        self.append(state, execution_id, scheduled, now).await?;

        let published = self
            .publish_attempt(state, &entry, &machine, execution_id, step.step_instance_id, now)
            .await?;
        if !published {
            self.advance_locked(state, execution_id, now).await?;
        }
        Ok(published)
    }

    /// Publish the command for the current attempt of a scheduled instance.
    /// A dispatch error fails the attempt through the retry policy.
    async fn publish_attempt(
        &self,
        state: &mut CoordinatorState,
        entry: &RegisteredPlaybook,
        machine: &StateMachine<'_>,
        execution_id: Uuid,
        step_instance_id: u64,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let dispatched = self
            .dispatcher
            .dispatch(state.execution(execution_id)?, &entry.playbook, step_instance_id, now)
            .await;
        let error = match dispatched {
            Ok(_) => return Ok(true),
            Err(error) => error,
        };

        warn!(
            execution_id = %execution_id,
            step_instance_id,
            kind = %error.kind,
            "Dispatch failed"
        );
        let failure = machine.fail_attempt(state.execution(execution_id)?, step_instance_id, error, now)?;
        if let Some(decision) = failure {
            self.append(state, execution_id, decision, now).await?;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialResolver, InMemoryCredentialStore};
    use crate::dispatch::{ChannelPublisher, CommandMessage};
    use crate::events::InMemoryEventStore;
    use crate::playbook::parse_playbook;
    use crate::sanitize::Redactor;
    use serde_json::json;
    use tokio::sync::mpsc;

    const CHAIN: &str = r#"
apiVersion: noetl.io/v2
kind: Playbook
metadata:
  name: chain
workflow:
  - step: start
    next: finish
  - step: finish
"#;

    struct Harness {
        coordinator: Coordinator,
        store: Arc<InMemoryEventStore>,
        commands: mpsc::UnboundedReceiver<CommandMessage>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryEventStore::new());
        let redactor = Arc::new(Redactor::new());
        let (publisher, commands, _cancels) = ChannelPublisher::new();
        let dispatcher = Dispatcher::new(
            Arc::new(publisher),
            CredentialResolver::new(Arc::new(InMemoryCredentialStore::new())),
            redactor.clone(),
        );
        let log = EventLog::new(store.clone(), redactor);
        let coordinator = Coordinator::new("test", log, dispatcher, BTreeMap::new()).unwrap();
        Harness {
            coordinator,
            store,
            commands,
        }
    }

    #[tokio::test]
    async fn test_start_dispatches_root() {
        let mut h = harness();
        h.coordinator
            .register_playbook(parse_playbook(CHAIN).unwrap())
            .await
            .unwrap();
        let now = Utc::now();
        let execution_id = h
            .coordinator
            .start_execution("chain", None, Map::new(), now)
            .await
            .unwrap();

        let command = h.commands.try_recv().unwrap();
        assert_eq!(command.execution_id, execution_id);
        assert_eq!(command.step_name, "start");
        assert_eq!(command.attempt, 1);

        h.coordinator
            .ingest_result(ResultMessage::success(&command, json!({"ok": true}), 3), now)
            .await
            .unwrap();
        let command = h.commands.try_recv().unwrap();
        assert_eq!(command.step_name, "finish");
        h.coordinator
            .ingest_result(ResultMessage::success(&command, json!(null), 1), now)
            .await
            .unwrap();

        let exec = h.coordinator.snapshot(execution_id).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_register_rejects_undeclared_pool() {
        let h = harness();
        let yaml = CHAIN.replace("  - step: finish\n", "  - step: finish\n    resources: [gpu]\n");
        let err = h
            .coordinator
            .register_playbook(parse_playbook(&yaml).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CapacityDeadlock(_)));
    }

    #[tokio::test]
    async fn test_store_outage_suspends_until_recovered() {
        let mut h = harness();
        h.coordinator
            .register_playbook(parse_playbook(CHAIN).unwrap())
            .await
            .unwrap();
        let now = Utc::now();
        let execution_id = h
            .coordinator
            .start_execution("chain", None, Map::new(), now)
            .await
            .unwrap();
        let command = h.commands.try_recv().unwrap();

        h.store.set_unavailable(true);
        let err = h
            .coordinator
            .ingest_result(ResultMessage::success(&command, json!(1), 1), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Suspended(_)));
        assert!(h.coordinator.is_suspended().await);

        h.store.set_unavailable(false);
        h.coordinator.tick(now).await.unwrap();
        assert!(!h.coordinator.is_suspended().await);

        // The scheduled attempt was republished on recovery.
        let again = h.commands.try_recv().unwrap();
        assert_eq!(again.message_id(), command.message_id());

        h.coordinator
            .ingest_result(ResultMessage::success(&again, json!(1), 1), now)
            .await
            .unwrap();
        let exec = h.coordinator.snapshot(execution_id).await.unwrap();
        assert_eq!(exec.instances[&1].state, StepState::Succeeded);
    }

    #[tokio::test]
    async fn test_result_for_unknown_execution_is_ignored() {
        let mut h = harness();
        h.coordinator
            .register_playbook(parse_playbook(CHAIN).unwrap())
            .await
            .unwrap();
        let now = Utc::now();
        h.coordinator
            .start_execution("chain", None, Map::new(), now)
            .await
            .unwrap();
        let mut command = h.commands.try_recv().unwrap();
        command.execution_id = Uuid::new_v4();
        h.coordinator
            .ingest_result(ResultMessage::success(&command, json!(1), 1), now)
            .await
            .unwrap();
    }
}
