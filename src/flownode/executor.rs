use std::{collections::HashSet, sync::Arc, thread, time::Duration};

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::{FLOW_NODE_INSTANCE_LOCK, FlowNodeState, PROCESS_INSTANCE_LOCK, Stimulus, TransitionOutcome};
use crate::{
    ExecutionConfig, LockConfig, ProcflowError, Result, TenantId, UserId, Vars,
    common::MemCache,
    engine::{Work, WorkKind, WorkService},
    expression::{ContractValidator, ExpressionEvaluator, IdentityService},
    lock::{Lock, LockService},
    model::{FlowNodeType, ProcessDefinition},
    recorder::Recorder,
    scheduler::{JobDescriptor, JobEnvironment, SchedulerService, Trigger, jobs::ExecuteFlowNodeJob},
    store::{
        Query, Store, StoreIden,
        data::{ArchivedProcessInstance, FlowNodeInstance, Incident, MessageInstance, ProcessDefinitionInfo, ProcessState, WaitingEvent},
    },
    transaction::TransactionService,
    utils,
    workflow::ProcessGraph,
};

const GRAPH_CACHE_SIZE: usize = 256;

/// Collaborators of the state machine, created and owned by the engine.
pub struct FlowNodeServices {
    pub store: Store,
    pub recorder: Arc<Recorder>,
    pub txs: Arc<TransactionService>,
    pub locks: Arc<dyn LockService>,
    pub scheduler: Arc<SchedulerService>,
    pub works: Arc<WorkService>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub contracts: Arc<dyn ContractValidator>,
    pub identity: Arc<dyn IdentityService>,
}

pub struct FlowNodeExecutor {
    pub(super) store: Store,
    pub(super) recorder: Arc<Recorder>,
    pub(super) txs: Arc<TransactionService>,
    pub(super) locks: Arc<dyn LockService>,
    pub(super) scheduler: Arc<SchedulerService>,
    pub(super) works: Arc<WorkService>,
    pub(super) evaluator: Arc<dyn ExpressionEvaluator>,
    pub(super) contracts: Arc<dyn ContractValidator>,
    pub(super) identity: Arc<dyn IdentityService>,
    graphs: MemCache<(TenantId, u64), Arc<ProcessGraph>>,
    lock_config: LockConfig,
    execution: ExecutionConfig,
    paused: RwLock<HashSet<TenantId>>,
}

/// Locks taken by one transition, released in reverse acquisition order on drop.
pub(super) struct HeldLocks<'a> {
    locks: &'a dyn LockService,
    tenant_id: TenantId,
    timeout: Duration,
    held: Vec<Lock>,
}

impl<'a> HeldLocks<'a> {
    pub(super) fn new(
        locks: &'a dyn LockService,
        tenant_id: TenantId,
        timeout: Duration,
    ) -> Self {
        Self {
            locks,
            tenant_id,
            timeout,
            held: Vec::new(),
        }
    }

    pub(super) fn acquire(
        &mut self,
        object_id: u64,
        object_type: &str,
    ) -> Result<()> {
        match self.locks.try_lock(object_id, object_type, self.tenant_id, self.timeout)? {
            Some(lock) => {
                self.held.push(lock);
                Ok(())
            }
            None => Err(ProcflowError::LockTimeout {
                tenant_id: self.tenant_id,
                object_id,
                object_type: object_type.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

impl Drop for HeldLocks<'_> {
    fn drop(&mut self) {
        while let Some(lock) = self.held.pop() {
            if let Err(e) = self.locks.unlock(&lock, self.tenant_id) {
                error!(tenant_id = self.tenant_id, lock = %lock.key, error = %e, "failed to release lock");
            }
        }
    }
}

impl FlowNodeExecutor {
    pub fn new(
        services: FlowNodeServices,
        lock_config: LockConfig,
        execution: ExecutionConfig,
    ) -> Self {
        Self {
            store: services.store,
            recorder: services.recorder,
            txs: services.txs,
            locks: services.locks,
            scheduler: services.scheduler,
            works: services.works,
            evaluator: services.evaluator,
            contracts: services.contracts,
            identity: services.identity,
            graphs: MemCache::new(GRAPH_CACHE_SIZE),
            lock_config,
            execution,
            paused: RwLock::new(HashSet::new()),
        }
    }

    /// Graph of a deployed definition, parsed once and cached.
    pub(crate) fn graph(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
    ) -> Result<Arc<ProcessGraph>> {
        self.graphs.get_or_try_insert((tenant_id, definition_id), || {
            let info: ProcessDefinitionInfo = self.store.get(tenant_id, definition_id)?;
            let definition: ProcessDefinition = serde_json::from_value(info.content)?;
            Ok(Arc::new(ProcessGraph::try_from(Arc::new(definition))?))
        })
    }

    pub(crate) fn evict_graph(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
    ) {
        self.graphs.remove(&(tenant_id, definition_id));
    }

    pub(super) fn transition_locks(
        &self,
        tenant_id: TenantId,
    ) -> HeldLocks<'_> {
        HeldLocks::new(self.locks.as_ref(), tenant_id, Duration::from_millis(self.lock_config.transition_timeout_ms))
    }

    /// Runs `attempt` again while it fails with a retryable error, up to `max_attempts`.
    pub(super) fn with_retries<T>(
        &self,
        mut attempt: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let max_attempts = self.execution.max_attempts.max(1);
        let mut tries = 1;
        loop {
            match attempt() {
                Err(e) if e.is_retryable() && tries < max_attempts => {
                    debug!(attempt = tries, error = %e, "retrying transition");
                    tries += 1;
                    thread::sleep(Duration::from_millis(self.execution.retry_delay_ms));
                }
                other => return other,
            }
        }
    }

    /// Locks the process instance then the flow node and runs `work` in a transaction.
    pub(super) fn locked<T>(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
        work: impl Fn(FlowNodeInstance) -> Result<T>,
    ) -> Result<T> {
        self.with_retries(|| {
            let current: FlowNodeInstance = self.store.get(tenant_id, flow_node_instance_id)?;
            let mut locks = self.transition_locks(tenant_id);
            locks.acquire(current.process_instance_id, PROCESS_INSTANCE_LOCK)?;
            locks.acquire(flow_node_instance_id, FLOW_NODE_INSTANCE_LOCK)?;
            self.txs.execute_in_transaction(|| {
                let fni: FlowNodeInstance = self.store.get(tenant_id, flow_node_instance_id)?;
                work(fni)
            })
        })
    }

    fn transition(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
        stimulus: Stimulus,
    ) -> Result<TransitionOutcome> {
        self.locked(tenant_id, flow_node_instance_id, |mut fni| self.run_to_stable(&mut fni, stimulus.clone()))
    }

    /// Runs one transition of a flow node from its current state.
    pub fn execute(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
    ) -> Result<TransitionOutcome> {
        self.transition(tenant_id, flow_node_instance_id, Stimulus::Execute)
    }

    pub fn trigger(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
        payload: Vars,
    ) -> Result<TransitionOutcome> {
        self.transition(tenant_id, flow_node_instance_id, Stimulus::Trigger(payload))
    }

    pub fn execute_user_task(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
        user_id: UserId,
        inputs: Vars,
    ) -> Result<TransitionOutcome> {
        self.transition(tenant_id, flow_node_instance_id, Stimulus::UserExecution {
            user_id,
            inputs,
        })
    }

    pub fn assign_user_task(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
        user_id: Option<UserId>,
    ) -> Result<()> {
        self.locked(tenant_id, flow_node_instance_id, |mut fni| {
            if fni.state != FlowNodeState::Ready {
                return Err(ProcflowError::Execution(format!("flow node {} is not a ready user task", fni.id)));
            }
            if let Some(user_id) = user_id {
                self.check_actor(&fni, user_id)?;
            }
            fni.assignee_id = user_id;
            fni.last_update = utils::time::time_millis();
            self.recorder.update_entity(&fni)
        })
    }

    /// Resumes a failed flow node from the state it failed in, redelivering the trigger
    /// that was being handled when it failed.
    pub fn retry(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
    ) -> Result<TransitionOutcome> {
        self.locked(tenant_id, flow_node_instance_id, |mut fni| {
            if fni.state != FlowNodeState::Failed {
                return Err(ProcflowError::Execution(format!("flow node {} is {}, not failed", fni.id, fni.state.as_ref())));
            }
            let resume = fni.previous_state.unwrap_or(FlowNodeState::Initializing);
            info!(tenant_id, flow_node_instance_id, state = resume.as_ref(), "retrying failed flow node");
            fni.error = None;
            let stimulus = match fni.pending_trigger.take() {
                Some(payload) => Stimulus::Trigger(payload),
                None => Stimulus::Execute,
            };
            self.change_state(&mut fni, resume)?;
            self.run_to_stable(&mut fni, stimulus)
        })
    }

    /// Marks a flow node failed in a new transaction and records an incident. A trigger
    /// consumed by the failed transition is kept for the retry.
    pub fn mark_failed(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
        cause: &ProcflowError,
        trigger: Option<Vars>,
    ) -> Result<()> {
        self.locked(tenant_id, flow_node_instance_id, |mut fni| {
            if fni.terminal || fni.state == FlowNodeState::Failed {
                return Ok(());
            }
            fni.error = Some(cause.to_string());
            fni.pending_trigger = trigger.clone();
            self.change_state(&mut fni, FlowNodeState::Failed)?;
            let incident = Incident {
                id: self.store.next_id::<Incident>(tenant_id)?,
                tenant_id,
                process_instance_id: fni.process_instance_id,
                flow_node_instance_id: fni.id,
                description: cause.to_string(),
                created_at: utils::time::time_millis(),
            };
            self.recorder.insert(&incident)?;
            warn!(tenant_id, flow_node_instance_id, error = %cause, "flow node marked failed");
            Ok(())
        })
    }

    /// Executes one queued work. Failures are reported, never propagated.
    pub fn run_work(
        &self,
        work: Work,
    ) {
        let tenant_id = work.tenant_id;
        debug!(work_id = %work.id, tenant_id, kind = ?work.kind, "running work");
        let (target, trigger, result) = match work.kind {
            WorkKind::ExecuteFlowNode {
                flow_node_instance_id,
            } => (Some(flow_node_instance_id), None, self.execute(tenant_id, flow_node_instance_id).map(|_| ())),
            WorkKind::TriggerFlowNode {
                flow_node_instance_id,
                payload,
            } => {
                let result = self.trigger(tenant_id, flow_node_instance_id, payload.clone()).map(|_| ());
                (Some(flow_node_instance_id), Some(payload), result)
            }
            WorkKind::CancelProcessInstance {
                process_instance_id,
            } => (None, None, self.abort_process_instance(tenant_id, process_instance_id)),
            WorkKind::MatchMessages => (None, None, self.match_messages(tenant_id).map(|_| ())),
        };

        let Err(e) = result else {
            return;
        };
        if matches!(e, ProcflowError::NotFound(_)) {
            debug!(work_id = %work.id, tenant_id, error = %e, "work target no longer exists");
            return;
        }
        let Some(flow_node_instance_id) = target else {
            error!(work_id = %work.id, tenant_id, error = %e, "work failed");
            return;
        };
        if e.is_retryable() {
            warn!(tenant_id, flow_node_instance_id, error = %e, "work exhausted its attempts, rescheduling");
            let rescheduled = match trigger {
                Some(payload) => self.works.register(tenant_id, WorkKind::TriggerFlowNode {
                    flow_node_instance_id,
                    payload,
                }),
                None => self.schedule_execution(tenant_id, flow_node_instance_id),
            };
            if let Err(err) = rescheduled {
                error!(tenant_id, flow_node_instance_id, error = %err, "failed to reschedule flow node");
            }
            return;
        }
        error!(tenant_id, flow_node_instance_id, error = %e, "flow node execution failed");
        if let Err(err) = self.mark_failed(tenant_id, flow_node_instance_id, &e, trigger) {
            error!(tenant_id, flow_node_instance_id, error = %err, "failed to mark flow node failed");
        }
    }

    /// Re-executes a flow node after the retry delay through the scheduler.
    fn schedule_execution(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
    ) -> Result<()> {
        let job_name = format!("execute-{}", flow_node_instance_id);
        let content = ExecuteFlowNodeJob {
            tenant_id,
            flow_node_instance_id,
        };
        let descriptor = JobDescriptor::new(tenant_id, &job_name, &content)?.disallow_concurrent_execution();
        let start_at = utils::time::after(Duration::from_millis(self.execution.retry_delay_ms));
        self.scheduler.schedule(descriptor, Trigger::one_shot(&job_name, start_at))
    }

    pub fn pause_tenant(
        &self,
        tenant_id: TenantId,
    ) {
        self.paused.write().insert(tenant_id);
    }

    pub fn resume_tenant(
        &self,
        tenant_id: TenantId,
    ) {
        self.paused.write().remove(&tenant_id);
    }

    pub fn is_tenant_paused(
        &self,
        tenant_id: TenantId,
    ) -> bool {
        self.paused.read().contains(&tenant_id)
    }

    pub(super) fn ensure_active_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<()> {
        if self.is_tenant_paused(tenant_id) {
            return Err(ProcflowError::Engine(format!("tenant {} is paused", tenant_id)));
        }
        Ok(())
    }

    /// Queues every flow node left in a non-stable state for longer than `stale_after`,
    /// the waiting flow nodes whose continuation was lost, and a message matching pass
    /// for tenants with pending messages.
    pub fn recover_stale(
        &self,
        tenant_id: Option<TenantId>,
        stale_after: Duration,
    ) -> Result<usize> {
        let persistence = self.store.persistence();
        let tenants: Vec<TenantId> = match tenant_id {
            Some(t) => vec![t],
            None => {
                let mut tenants = persistence.tenants(StoreIden::FlowNodeInstances)?;
                tenants.extend(persistence.tenants(StoreIden::MessageInstances)?);
                tenants.sort();
                tenants.dedup();
                tenants
            }
        };

        let threshold = utils::time::time_millis() - stale_after.as_millis() as i64;
        let mut resumed = 0;
        for tenant_id in tenants {
            let stuck: Vec<FlowNodeInstance> = self.store.list(tenant_id, &Query::new().eq("stable", false))?;
            for fni in stuck.into_iter().filter(|f| f.last_update <= threshold) {
                self.works.register(tenant_id, WorkKind::ExecuteFlowNode {
                    flow_node_instance_id: fni.id,
                })?;
                resumed += 1;
            }
            let waiting: Vec<FlowNodeInstance> = self.store.list(tenant_id, &Query::new().eq("state", FlowNodeState::Waiting.as_ref()))?;
            for fni in waiting.into_iter().filter(|f| f.last_update <= threshold) {
                if let Some(kind) = self.lost_continuation(&fni)? {
                    debug!(tenant_id, flow_node_instance_id = fni.id, kind = ?kind, "resuming waiting flow node");
                    self.works.register(tenant_id, kind)?;
                    resumed += 1;
                }
            }
            if self.store.count::<MessageInstance>(tenant_id, &Query::new().eq("handled", false))? > 0 {
                self.works.register(tenant_id, WorkKind::MatchMessages)?;
            }
        }
        Ok(resumed)
    }

    /// Work a waiting flow node needs although nothing will queue it anymore: a gateway
    /// holding all its tokens, a catcher whose subscription was consumed, or a caller whose
    /// child process already completed.
    fn lost_continuation(
        &self,
        fni: &FlowNodeInstance,
    ) -> Result<Option<WorkKind>> {
        let work = match fni.kind {
            FlowNodeType::ParallelGateway | FlowNodeType::InclusiveGateway => {
                let graph = self.graph(fni.tenant_id, fni.definition_id)?;
                self.can_merge(fni, &graph)?.then_some(WorkKind::ExecuteFlowNode {
                    flow_node_instance_id: fni.id,
                })
            }
            FlowNodeType::CallActivity => {
                let Some(child_id) = fni.called_process_instance_id else {
                    return Ok(None);
                };
                let child: Option<ArchivedProcessInstance> = self.store.first(fni.tenant_id, &Query::new().eq("source_object_id", child_id))?;
                child.filter(|c| c.state == ProcessState::Completed).map(|c| WorkKind::TriggerFlowNode {
                    flow_node_instance_id: fni.id,
                    payload: c.data,
                })
            }
            _ => {
                let consumed: Option<WaitingEvent> = self.store.first(fni.tenant_id, &Query::new().eq("flow_node_instance_id", fni.id).eq("active", false))?;
                consumed.and_then(|w| w.delivered).map(|payload| WorkKind::TriggerFlowNode {
                    flow_node_instance_id: fni.id,
                    payload,
                })
            }
        };
        Ok(work)
    }
}

impl JobEnvironment for FlowNodeExecutor {
    fn execute_flow_node(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
    ) -> Result<()> {
        match self.execute(tenant_id, flow_node_instance_id) {
            Ok(_) | Err(ProcflowError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn fire_timer(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
    ) -> Result<()> {
        match self.trigger(tenant_id, flow_node_instance_id, Vars::new()) {
            Ok(outcome) => {
                debug!(tenant_id, flow_node_instance_id, state = outcome.state.as_ref(), "timer fired");
                Ok(())
            }
            Err(ProcflowError::NotFound(_)) => {
                debug!(tenant_id, flow_node_instance_id, "timer fired for a flow node that no longer exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn start_process_from_timer(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
        start_event_id: &str,
    ) -> Result<()> {
        let process_instance_id = self.start_process_at(tenant_id, definition_id, start_event_id)?;
        info!(tenant_id, definition_id, process_instance_id, "process started by timer");
        Ok(())
    }

    fn recover(
        &self,
        tenant_id: Option<TenantId>,
    ) -> Result<usize> {
        self.recover_stale(tenant_id, Duration::from_millis(self.execution.stale_after_ms))
    }
}
