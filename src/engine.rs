//! Process engine - the main entry point for Procflow.
//!
//! The engine wires the execution core together and exposes its API:
//! - Deploying, enabling and deleting process definitions
//! - Starting process instances and driving their flow nodes
//! - Messages, signals and user tasks
//! - Tenant pause and resume
//! - Graceful shutdown coordination

mod audit;
mod work;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use serde_json::{Map, Value};
use tokio::runtime::Runtime;
use tracing::{error, info, warn};

use crate::{
    Config, ProcflowError, Result, TenantId, TransitionOutcome, UserId, Vars,
    common::{BroadcastQueue, Shutdown},
    events::{EventHandler, EventService, EventTypeKey},
    expression::{ContractValidator, ExpressionEvaluator, IdentityService},
    flownode::{FlowNodeExecutor, FlowNodeServices},
    lock::LockService,
    model::{FlowNodeKind, ProcessDefinition},
    recorder::Recorder,
    runtime::Channel,
    scheduler::{
        JobDescriptor, JobEnvironment, JobStore, ScheduledJob, SchedulerService, Trigger,
        jobs::{RecoverFlowNodesJob, StartProcessJob},
    },
    store::{
        Persistence, Query, Store,
        data::{
            ActivationState, Actor, ActorMember, ActorMemberKind, ArchivedFlowNodeInstance, ArchivedProcessInstance, FlowNodeInstance, Incident,
            ProcessDefinitionInfo, ProcessInstance,
        },
    },
    transaction::TransactionService,
    utils,
    workflow::ProcessGraph,
};

use audit::AuditTrail;
pub use work::{Work, WorkKind, WorkService};

/// Scheduler group of engine-wide jobs.
const SYSTEM_GROUP: &str = "system";
const RECOVERY_JOB: &str = "recover-flow-nodes";

/// Collaborators the builder hands to [`Engine::new`].
pub(crate) struct EngineParts {
    pub runtime: Arc<Runtime>,
    pub txs: Arc<TransactionService>,
    pub persistence: Arc<dyn Persistence>,
    pub locks: Arc<dyn LockService>,
    pub job_store: Arc<dyn JobStore>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub contracts: Arc<dyn ContractValidator>,
    pub identity: Arc<dyn IdentityService>,
}

/// The process engine.
///
/// Engine is the central coordinator for Procflow, responsible for:
/// - Managing the tokio runtime the workers and the scheduler run on
/// - Owning the lock, transaction, recorder, scheduler and work services
/// - Routing API calls to the flow-node state machine
///
/// # Example
///
/// ```rust,ignore
/// let engine = EngineBuilder::new().build()?;
/// engine.launch();
///
/// let definition_id = engine.deploy(1, &definition)?;
/// engine.enable_process_definition(1, definition_id)?;
/// let pid = engine.start_process(1, definition_id, None, Vars::new())?;
///
/// engine.shutdown();
/// ```
pub struct Engine {
    config: Config,

    txs: Arc<TransactionService>,
    store: Store,
    events: Arc<EventService>,
    recorder: Arc<Recorder>,
    locks: Arc<dyn LockService>,
    scheduler: Arc<SchedulerService>,
    works: Arc<WorkService>,
    identity: Arc<dyn IdentityService>,
    executor: Arc<FlowNodeExecutor>,

    /// Committed events, fanned out to observers.
    channel: Arc<Channel>,
    audit: Option<AuditTrail>,

    /// Flag indicating if the engine is running.
    running: Arc<AtomicBool>,
    /// Tokio runtime for the workers, the scheduler and the channel.
    runtime: Arc<Runtime>,
    /// Shutdown coordinator for graceful termination.
    shutdown: Arc<Shutdown>,
}

impl Engine {
    pub(crate) fn new(
        config: Config,
        parts: EngineParts,
    ) -> Self {
        let EngineParts {
            runtime,
            txs,
            persistence,
            locks,
            job_store,
            evaluator,
            contracts,
            identity,
        } = parts;

        let store = Store::new(persistence.clone());
        let events = Arc::new(EventService::new());
        let publisher = BroadcastQueue::new(crate::runtime::EVENT_QUEUE_SIZE);
        let recorder = Arc::new(Recorder::new(persistence.clone(), events.clone(), txs.clone(), publisher.clone()));
        let scheduler = Arc::new(SchedulerService::new(job_store, txs.clone(), config.scheduler.clone(), runtime.handle().clone()));
        let works = Arc::new(WorkService::new(txs.clone(), config.work.queue_size));
        let executor = Arc::new(FlowNodeExecutor::new(
            FlowNodeServices {
                store: store.clone(),
                recorder: recorder.clone(),
                txs: txs.clone(),
                locks: locks.clone(),
                scheduler: scheduler.clone(),
                works: works.clone(),
                evaluator,
                contracts,
                identity: identity.clone(),
            },
            config.lock.clone(),
            config.execution.clone(),
        ));

        let shutdown = Arc::new(Shutdown::new());
        let channel = Arc::new(Channel::new(publisher, runtime.handle().clone()));
        let audit = config.audit.enabled.then(|| AuditTrail::new(persistence, channel.clone(), runtime.handle().clone(), shutdown.clone()));

        Self {
            config,
            txs,
            store,
            events,
            recorder,
            locks,
            scheduler,
            works,
            identity,
            executor,
            channel,
            audit,
            running: Arc::new(AtomicBool::new(false)),
            runtime,
            shutdown,
        }
    }

    /// Starts the engine.
    ///
    /// This method:
    /// - Starts the audit trail and the event channel
    /// - Spawns the work consumers
    /// - Starts the scheduler and repairs the triggers of a previous run
    /// - Runs a recovery sweep and schedules the periodic one when configured
    pub fn launch(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        // Subscribe observers first so that no committed event is missed
        if let Some(audit) = &self.audit {
            audit.monitor();
        }
        self.channel.listen();

        for worker in 0..self.config.work.worker_number {
            let queue = self.works.queue();
            let works = self.works.clone();
            let executor = self.executor.clone();
            let shutdown = self.shutdown.clone();
            self.runtime.spawn(async move {
                loop {
                    if works.is_paused() {
                        tokio::select! {
                            _ = shutdown.wait() => break,
                            _ = tokio::time::sleep(Duration::from_millis(10)) => continue,
                        }
                    }
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        Some(work) = queue.next_async() => {
                            let executor = executor.clone();
                            if let Err(e) = tokio::task::spawn_blocking(move || executor.run_work(work)).await {
                                error!(worker, error = %e, "work panicked");
                            }
                        }
                    }
                }
            });
        }

        let environment: Arc<dyn JobEnvironment> = self.executor.clone();
        self.scheduler.start(environment);
        if let Err(e) = self.scheduler.reschedule_erroneous_triggers() {
            error!(error = %e, "failed to reschedule erroneous triggers");
        }

        if self.config.recovery.enabled {
            match self.executor.recover_stale(None, Duration::ZERO) {
                Ok(resumed) if resumed > 0 => info!(resumed, "resumed flow nodes left by a previous run"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "recovery sweep failed"),
            }
        }
        if let Some(cron) = &self.config.recovery.cron {
            if let Err(e) = self.schedule_recovery(cron) {
                error!(error = %e, "failed to schedule the recovery job");
            }
        }
        info!(workers = self.config.work.worker_number, "engine launched");
    }

    fn schedule_recovery(
        &self,
        cron: &str,
    ) -> Result<()> {
        let descriptor = JobDescriptor::new(0, RECOVERY_JOB, &RecoverFlowNodesJob::default())?.group(SYSTEM_GROUP).disallow_concurrent_execution();
        self.scheduler.schedule(descriptor, Trigger::cron(RECOVERY_JOB, cron)?)
    }

    /// Gracefully shuts down the engine.
    ///
    /// This method:
    /// - Stops handing out new works
    /// - Waits for active transactions to drain, bounded by `shutdown_timeout_ms`
    /// - Stops the scheduler and the event channel
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        self.works.pause();
        self.shutdown.shutdown();
        if !self.txs.wait_for_drain(timeout) {
            warn!(active = self.txs.number_of_active_transactions(), "shutdown timed out waiting for transactions");
        }
        self.scheduler.shutdown(timeout);
        self.channel.shutdown();
        info!(pending_works = self.works.pending(), "engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.is_running() {
            return Err(ProcflowError::Engine("engine is not running".to_string()));
        }
        Ok(())
    }

    /// Validates and stores a process definition, disabled, with its actors. Returns its id.
    pub fn deploy(
        &self,
        tenant_id: TenantId,
        definition: &ProcessDefinition,
    ) -> Result<u64> {
        let graph = ProcessGraph::try_from(Arc::new(definition.clone()))?;
        self.txs.execute_in_transaction(|| {
            let existing: Option<ProcessDefinitionInfo> =
                self.store.first(tenant_id, &Query::new().eq("name", definition.name.as_str()).eq("version", definition.version.as_str()))?;
            if existing.is_some() {
                return Err(ProcflowError::Definition(format!("process '{}' version '{}' is already deployed", definition.name, definition.version)));
            }

            let info = ProcessDefinitionInfo {
                id: self.store.next_id::<ProcessDefinitionInfo>(tenant_id)?,
                tenant_id,
                name: definition.name.clone(),
                version: definition.version.clone(),
                description: definition.description.clone(),
                activation: ActivationState::Disabled,
                content: serde_json::to_value(definition)?,
                deployed_at: utils::time::time_millis(),
            };
            self.recorder.insert(&info)?;
            for actor in definition.actors.iter() {
                let actor = Actor {
                    id: self.store.next_id::<Actor>(tenant_id)?,
                    tenant_id,
                    definition_id: info.id,
                    name: actor.name.clone(),
                    description: actor.description.clone(),
                };
                self.recorder.insert(&actor)?;
            }
            info!(tenant_id, definition_id = info.id, name = %info.name, version = %info.version, "process definition deployed");
            tracing::debug!("{}", graph.schema());
            Ok(info.id)
        })
    }

    /// Enables a definition and schedules its timer start events.
    pub fn enable_process_definition(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
    ) -> Result<()> {
        let graph = self.executor.graph(tenant_id, definition_id)?;
        self.txs.execute_in_transaction(|| {
            if !self.set_activation(tenant_id, definition_id, ActivationState::Enabled)? {
                return Ok(());
            }
            for start in graph.timer_start_events() {
                let FlowNodeKind::StartEvent {
                    trigger: Some(timer),
                } = &start.kind
                else {
                    continue;
                };
                let job_name = start_job_name(definition_id, &start.id);
                let content = StartProcessJob {
                    tenant_id,
                    definition_id,
                    start_event_id: start.id.clone(),
                };
                let descriptor = JobDescriptor::new(tenant_id, &job_name, &content)?.disallow_concurrent_execution();
                self.scheduler.schedule(descriptor, Trigger::from_timer(&job_name, timer)?)?;
            }
            Ok(())
        })
    }

    /// Disables a definition and removes its timer start jobs. Running instances go on.
    pub fn disable_process_definition(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
    ) -> Result<()> {
        let graph = self.executor.graph(tenant_id, definition_id)?;
        self.txs.execute_in_transaction(|| {
            if self.set_activation(tenant_id, definition_id, ActivationState::Disabled)? {
                self.delete_start_jobs(tenant_id, definition_id, &graph)?;
            }
            Ok(())
        })
    }

    /// Deletes a definition with its actors. Refused while one of its instances is alive.
    pub fn delete_process_definition(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
    ) -> Result<()> {
        let graph = self.executor.graph(tenant_id, definition_id)?;
        self.txs.execute_in_transaction(|| {
            let alive = self.store.count::<ProcessInstance>(tenant_id, &Query::new().eq("definition_id", definition_id))?;
            if alive > 0 {
                return Err(ProcflowError::Definition(format!("process definition {} still has {} running instance(s)", definition_id, alive)));
            }
            self.delete_start_jobs(tenant_id, definition_id, &graph)?;
            for actor in self.actors(tenant_id, definition_id)? {
                for member in self.actor_members(tenant_id, actor.id)? {
                    self.recorder.delete::<ActorMember>(tenant_id, member.id)?;
                }
                self.recorder.delete::<Actor>(tenant_id, actor.id)?;
            }
            self.recorder.delete::<ProcessDefinitionInfo>(tenant_id, definition_id)?;
            Ok(())
        })?;
        self.executor.evict_graph(tenant_id, definition_id);
        info!(tenant_id, definition_id, "process definition deleted");
        Ok(())
    }

    /// Returns false when the definition already had `activation`.
    fn set_activation(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
        activation: ActivationState,
    ) -> Result<bool> {
        let info: ProcessDefinitionInfo = self.store.get(tenant_id, definition_id)?;
        if info.activation == activation {
            return Ok(false);
        }
        let mut fields = Map::new();
        fields.insert("activation".to_string(), Value::String(activation.as_ref().to_string()));
        let _: ProcessDefinitionInfo = self.recorder.update(tenant_id, definition_id, fields)?;
        info!(tenant_id, definition_id, activation = activation.as_ref(), "process definition activation changed");
        Ok(true)
    }

    fn delete_start_jobs(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
        graph: &ProcessGraph,
    ) -> Result<()> {
        for start in graph.timer_start_events() {
            self.scheduler.delete_job(&tenant_id.to_string(), &start_job_name(definition_id, &start.id))?;
        }
        Ok(())
    }

    pub fn process_definition(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
    ) -> Result<ProcessDefinitionInfo> {
        self.store.get(tenant_id, definition_id)
    }

    pub fn actors(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
    ) -> Result<Vec<Actor>> {
        self.store.list(tenant_id, &Query::new().eq("definition_id", definition_id))
    }

    /// Maps a user, group, role or membership to an actor. Returns the member id.
    pub fn add_actor_member(
        &self,
        tenant_id: TenantId,
        actor_id: u64,
        member: ActorMemberKind,
    ) -> Result<u64> {
        if let ActorMemberKind::User {
            user_id,
        } = member
        {
            if !self.identity.user_exists(tenant_id, user_id) {
                return Err(ProcflowError::NotFound(format!("user {} not found in tenant {}", user_id, tenant_id)));
            }
        }
        self.txs.execute_in_transaction(|| {
            let _: Actor = self.store.get(tenant_id, actor_id)?;
            let member = ActorMember {
                id: self.store.next_id::<ActorMember>(tenant_id)?,
                tenant_id,
                actor_id,
                member,
            };
            self.recorder.insert(&member)?;
            Ok(member.id)
        })
    }

    pub fn actor_members(
        &self,
        tenant_id: TenantId,
        actor_id: u64,
    ) -> Result<Vec<ActorMember>> {
        self.store.list(tenant_id, &Query::new().eq("actor_id", actor_id))
    }

    /// Starts an instance of an enabled definition. Returns the process instance id.
    pub fn start_process(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
        started_by: Option<UserId>,
        inputs: Vars,
    ) -> Result<u64> {
        self.ensure_running()?;
        self.executor.start_process(tenant_id, definition_id, started_by, inputs)
    }

    /// Runs one transition of a flow node synchronously.
    pub fn execute_flow_node(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
    ) -> Result<TransitionOutcome> {
        self.executor.execute(tenant_id, flow_node_instance_id)
    }

    pub fn execute_user_task(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
        user_id: UserId,
        inputs: Vars,
    ) -> Result<TransitionOutcome> {
        self.executor.execute_user_task(tenant_id, flow_node_instance_id, user_id, inputs)
    }

    /// Assigns a ready user task; `None` releases it back to its actor.
    pub fn assign_user_task(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
        user_id: Option<UserId>,
    ) -> Result<()> {
        self.executor.assign_user_task(tenant_id, flow_node_instance_id, user_id)
    }

    pub fn retry_flow_node(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
    ) -> Result<TransitionOutcome> {
        self.executor.retry(tenant_id, flow_node_instance_id)
    }

    pub fn cancel_process_instance(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
    ) -> Result<()> {
        self.executor.cancel_process_instance(tenant_id, process_instance_id)
    }

    /// Sends a message to the tenant. Returns the message id.
    pub fn send_message(
        &self,
        tenant_id: TenantId,
        name: &str,
        correlation: Option<String>,
        payload: Vars,
    ) -> Result<u64> {
        self.txs.execute_in_transaction(|| self.executor.send_message(tenant_id, name, correlation, payload))
    }

    /// Broadcasts a signal to every waiting catcher of the tenant. Returns how many caught it.
    pub fn send_signal(
        &self,
        tenant_id: TenantId,
        name: &str,
        payload: Vars,
    ) -> Result<usize> {
        self.txs.execute_in_transaction(|| self.executor.broadcast_signal(tenant_id, name, payload))
    }

    pub fn update_process_data(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
        values: Vars,
    ) -> Result<()> {
        self.executor.update_process_data(tenant_id, process_instance_id, values)
    }

    pub fn process_instance(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
    ) -> Result<ProcessInstance> {
        self.store.get(tenant_id, process_instance_id)
    }

    /// Archive of a finished process instance, looked up by its original id.
    pub fn archived_process_instance(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
    ) -> Result<ArchivedProcessInstance> {
        self.store
            .first(tenant_id, &Query::new().eq("source_object_id", process_instance_id))?
            .ok_or_else(|| ProcflowError::NotFound(format!("archived process instance {} not found in tenant {}", process_instance_id, tenant_id)))
    }

    pub fn flow_node_instance(
        &self,
        tenant_id: TenantId,
        flow_node_instance_id: u64,
    ) -> Result<FlowNodeInstance> {
        self.store.get(tenant_id, flow_node_instance_id)
    }

    pub fn archived_flow_node_instances(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
    ) -> Result<Vec<ArchivedFlowNodeInstance>> {
        self.store.list(tenant_id, &Query::new().eq("process_instance_id", process_instance_id))
    }

    pub fn active_flow_nodes(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
    ) -> Result<Vec<FlowNodeInstance>> {
        self.store.list(tenant_id, &Query::new().eq("process_instance_id", process_instance_id))
    }

    pub fn pending_user_tasks(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> Result<Vec<FlowNodeInstance>> {
        self.executor.pending_user_tasks(tenant_id, user_id)
    }

    pub fn process_data(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
    ) -> Result<Vars> {
        self.executor.process_data(tenant_id, process_instance_id)
    }

    /// Incidents of the tenant, or of one process instance.
    pub fn incidents(
        &self,
        tenant_id: TenantId,
        process_instance_id: Option<u64>,
    ) -> Result<Vec<Incident>> {
        let query = match process_instance_id {
            Some(pid) => Query::new().eq("process_instance_id", pid),
            None => Query::new(),
        };
        self.store.list(tenant_id, &query)
    }

    /// Jobs of the tenant whose retries are exhausted.
    pub fn failed_jobs(
        &self,
        tenant_id: TenantId,
    ) -> Result<Vec<ScheduledJob>> {
        self.scheduler.failed_jobs(Some(&tenant_id.to_string()))
    }

    /// Pauses the tenant's jobs and rejects new process starts until resumed.
    pub fn pause_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<()> {
        self.executor.pause_tenant(tenant_id);
        self.scheduler.pause_jobs(&tenant_id.to_string())?;
        info!(tenant_id, "tenant paused");
        Ok(())
    }

    pub fn resume_tenant(
        &self,
        tenant_id: TenantId,
    ) -> Result<()> {
        self.executor.resume_tenant(tenant_id);
        self.scheduler.resume_jobs(&tenant_id.to_string())?;
        info!(tenant_id, "tenant resumed");
        Ok(())
    }

    /// Registers a synchronous handler. It runs inside the transaction that fires the event
    /// and may veto it by returning an error.
    pub fn register_event_handler(
        &self,
        key: EventTypeKey,
        handler: Arc<dyn EventHandler>,
    ) {
        self.events.add_handler(key, handler);
    }

    /// Returns a reference to the event channel.
    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    pub fn transactions(&self) -> Arc<TransactionService> {
        self.txs.clone()
    }

    pub fn locks(&self) -> Arc<dyn LockService> {
        self.locks.clone()
    }

    pub fn scheduler(&self) -> Arc<SchedulerService> {
        self.scheduler.clone()
    }
}

fn start_job_name(
    definition_id: u64,
    start_event_id: &str,
) -> String {
    format!("start-{}-{}", definition_id, start_event_id)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use serde_json::json;

    use super::*;
    use crate::{
        EngineBuilder, FlowNodeState, SchedulerConfig,
        expression::MemIdentityService,
        scheduler::MemJobStore,
        store::{MemPersistence, data::ProcessState},
    };

    const TENANT: TenantId = 1;

    fn test_config() -> Config {
        Config {
            async_worker_thread_number: 2,
            scheduler: SchedulerConfig {
                poll_interval_ms: 20,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn engine_with(identity: Arc<MemIdentityService>) -> Engine {
        let engine = EngineBuilder::new().config(test_config()).identity(identity).build().unwrap();
        engine.launch();
        engine
    }

    /// Storage that outlives the engines built over it, as a database does across restarts.
    struct Durable {
        txs: Arc<TransactionService>,
        persistence: Arc<dyn Persistence>,
        jobs: Arc<dyn JobStore>,
    }

    impl Durable {
        fn new() -> Self {
            let txs = Arc::new(TransactionService::new());
            Self {
                persistence: Arc::new(MemPersistence::new(txs.clone())),
                txs,
                jobs: Arc::new(MemJobStore::new()),
            }
        }

        fn engine(&self) -> Engine {
            let persistence = self.persistence.clone();
            let engine = EngineBuilder::new()
                .config(test_config())
                .transactions(self.txs.clone())
                .persistence(move |_| persistence.clone())
                .job_store(self.jobs.clone())
                .build()
                .unwrap();
            engine.launch();
            engine
        }
    }

    fn engine() -> Engine {
        engine_with(Arc::new(MemIdentityService::new()))
    }

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    fn deploy_enabled(
        engine: &Engine,
        json: &str,
    ) -> u64 {
        let definition = ProcessDefinition::from_json(json).unwrap();
        let definition_id = engine.deploy(TENANT, &definition).unwrap();
        engine.enable_process_definition(TENANT, definition_id).unwrap();
        definition_id
    }

    fn wait_archived(
        engine: &Engine,
        pid: u64,
    ) -> ArchivedProcessInstance {
        assert!(wait_until(|| engine.archived_process_instance(TENANT, pid).is_ok()), "process {} never finished", pid);
        engine.archived_process_instance(TENANT, pid).unwrap()
    }

    fn wait_waiting(
        engine: &Engine,
        pid: u64,
        flow_node_id: &str,
    ) {
        let waiting = wait_until(|| {
            engine
                .active_flow_nodes(TENANT, pid)
                .map(|nodes| nodes.iter().any(|n| n.flow_node_id == flow_node_id && n.state == FlowNodeState::Waiting))
                .unwrap_or(false)
        });
        assert!(waiting, "{} of process {} never reached waiting", flow_node_id, pid);
    }

    fn active_node(
        engine: &Engine,
        pid: u64,
        flow_node_id: &str,
    ) -> FlowNodeInstance {
        engine.active_flow_nodes(TENANT, pid).unwrap().into_iter().find(|n| n.flow_node_id == flow_node_id).unwrap()
    }

    fn archived_node(
        engine: &Engine,
        pid: u64,
        flow_node_id: &str,
    ) -> Option<ArchivedFlowNodeInstance> {
        engine.archived_flow_node_instances(TENANT, pid).unwrap().into_iter().find(|n| n.flow_node_id == flow_node_id)
    }

    fn wait_incident(
        engine: &Engine,
        pid: u64,
    ) -> Incident {
        assert!(wait_until(|| !engine.incidents(TENANT, Some(pid)).unwrap().is_empty()), "process {} never failed", pid);
        engine.incidents(TENANT, Some(pid)).unwrap().remove(0)
    }

    const SIMPLE: &str = r#"{
        "name": "simple",
        "version": "1",
        "flow_nodes": [
            { "id": "start", "type": "start_event" },
            { "id": "calc", "type": "automatic_task", "operations": [
                { "target": "total", "expression": { "type": "variable", "name": "price" } }
            ] },
            { "id": "end", "type": "end_event" }
        ],
        "transitions": [
            { "id": "t1", "source": "start", "target": "calc" },
            { "id": "t2", "source": "calc", "target": "end" }
        ]
    }"#;

    #[test]
    fn test_simple_process_completes() {
        let engine = engine();
        let definition_id = deploy_enabled(&engine, SIMPLE);
        let pid = engine.start_process(TENANT, definition_id, Some(3), Vars::new().with("price", 42)).unwrap();

        let archived = wait_archived(&engine, pid);
        assert_eq!(archived.state, ProcessState::Completed);
        assert_eq!(archived.started_by, Some(3));
        assert_eq!(archived.data.get::<i64>("total"), Some(42));
        assert!(matches!(engine.process_instance(TENANT, pid), Err(ProcflowError::NotFound(_))));

        let nodes = engine.archived_flow_node_instances(TENANT, pid).unwrap();
        let mut ids: Vec<&str> = nodes.iter().map(|n| n.flow_node_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["calc", "end", "start"]);
        assert!(nodes.iter().all(|n| n.state == FlowNodeState::Completed));
        engine.shutdown();
    }

    #[test]
    fn test_deploy_rules() {
        let engine = engine();
        let definition = ProcessDefinition::from_json(SIMPLE).unwrap();
        let definition_id = engine.deploy(TENANT, &definition).unwrap();
        assert!(matches!(engine.deploy(TENANT, &definition), Err(ProcflowError::Definition(_))));

        // disabled definitions refuse new instances
        assert!(engine.start_process(TENANT, definition_id, None, Vars::new()).is_err());

        engine.enable_process_definition(TENANT, definition_id).unwrap();
        assert_eq!(engine.process_definition(TENANT, definition_id).unwrap().activation, ActivationState::Enabled);

        engine.delete_process_definition(TENANT, definition_id).unwrap();
        assert!(matches!(engine.process_definition(TENANT, definition_id), Err(ProcflowError::NotFound(_))));
        engine.shutdown();
    }

    #[test]
    fn test_failure_creates_incident_then_retry() {
        let engine = engine();
        let definition_id = deploy_enabled(&engine, SIMPLE);
        let pid = engine.start_process(TENANT, definition_id, None, Vars::new()).unwrap();

        assert!(wait_until(|| !engine.incidents(TENANT, Some(pid)).unwrap().is_empty()));
        let incident = engine.incidents(TENANT, Some(pid)).unwrap().remove(0);
        assert!(incident.description.contains("price"));
        let failed = engine.flow_node_instance(TENANT, incident.flow_node_instance_id).unwrap();
        assert_eq!(failed.state, FlowNodeState::Failed);
        assert!(engine.delete_process_definition(TENANT, definition_id).is_err());

        engine.update_process_data(TENANT, pid, Vars::new().with("price", 7)).unwrap();
        engine.retry_flow_node(TENANT, failed.id).unwrap();

        let archived = wait_archived(&engine, pid);
        assert_eq!(archived.state, ProcessState::Completed);
        assert_eq!(archived.data.get::<i64>("total"), Some(7));
        engine.shutdown();
    }

    #[test]
    fn test_user_task_requires_actor_membership() {
        let identity = Arc::new(MemIdentityService::new());
        identity.add_user(TENANT, 7);
        identity.add_user(TENANT, 8);
        let engine = engine_with(identity);

        let definition_id = deploy_enabled(
            &engine,
            r#"{
            "name": "review",
            "version": "1",
            "flow_nodes": [
                { "id": "start", "type": "start_event" },
                { "id": "review", "type": "user_task", "actor": "reviewer", "operations": [
                    { "target": "approved", "expression": { "type": "variable", "name": "approved" } }
                ] },
                { "id": "end", "type": "end_event" }
            ],
            "transitions": [
                { "id": "t1", "source": "start", "target": "review" },
                { "id": "t2", "source": "review", "target": "end" }
            ],
            "actors": [{ "name": "reviewer" }]
        }"#,
        );
        let actor = engine.actors(TENANT, definition_id).unwrap().remove(0);
        engine
            .add_actor_member(TENANT, actor.id, ActorMemberKind::User {
                user_id: 7,
            })
            .unwrap();
        assert!(
            engine
                .add_actor_member(TENANT, actor.id, ActorMemberKind::User {
                    user_id: 99,
                })
                .is_err()
        );

        let pid = engine.start_process(TENANT, definition_id, None, Vars::new()).unwrap();
        assert!(wait_until(|| engine.pending_user_tasks(TENANT, 7).unwrap().len() == 1));
        assert!(engine.pending_user_tasks(TENANT, 8).unwrap().is_empty());
        let task = engine.pending_user_tasks(TENANT, 7).unwrap().remove(0);

        assert!(matches!(engine.execute_user_task(TENANT, task.id, 8, Vars::new()), Err(ProcflowError::Execution(_))));
        assert!(engine.assign_user_task(TENANT, task.id, Some(8)).is_err());

        let outcome = engine.execute_user_task(TENANT, task.id, 7, Vars::new().with("approved", true)).unwrap();
        assert_eq!(outcome.state, FlowNodeState::Completed);

        let archived = wait_archived(&engine, pid);
        assert_eq!(archived.data.get_value("approved"), Some(&json!(true)));
        let review = engine.archived_flow_node_instances(TENANT, pid).unwrap().into_iter().find(|n| n.flow_node_id == "review").unwrap();
        assert_eq!(review.executed_by, Some(7));
        engine.shutdown();
    }

    #[test]
    fn test_parallel_gateway_joins_once() {
        let engine = engine();
        let definition_id = deploy_enabled(
            &engine,
            r#"{
            "name": "fork",
            "version": "1",
            "flow_nodes": [
                { "id": "start", "type": "start_event" },
                { "id": "split", "type": "parallel_gateway" },
                { "id": "a", "type": "automatic_task", "operations": [
                    { "target": "a", "expression": { "type": "constant", "value": 1 } }
                ] },
                { "id": "b", "type": "automatic_task", "operations": [
                    { "target": "b", "expression": { "type": "constant", "value": 2 } }
                ] },
                { "id": "join", "type": "parallel_gateway" },
                { "id": "end", "type": "end_event" }
            ],
            "transitions": [
                { "id": "t1", "source": "start", "target": "split" },
                { "id": "t2", "source": "split", "target": "a" },
                { "id": "t3", "source": "split", "target": "b" },
                { "id": "t4", "source": "a", "target": "join" },
                { "id": "t5", "source": "b", "target": "join" },
                { "id": "t6", "source": "join", "target": "end" }
            ]
        }"#,
        );
        let pid = engine.start_process(TENANT, definition_id, None, Vars::new()).unwrap();

        let archived = wait_archived(&engine, pid);
        assert_eq!(archived.state, ProcessState::Completed);
        assert_eq!(archived.data.get::<i64>("a"), Some(1));
        assert_eq!(archived.data.get::<i64>("b"), Some(2));

        let nodes = engine.archived_flow_node_instances(TENANT, pid).unwrap();
        assert_eq!(nodes.iter().filter(|n| n.flow_node_id == "join").count(), 1);
        assert_eq!(nodes.iter().filter(|n| n.flow_node_id == "end").count(), 1);
        engine.shutdown();
    }

    const PAYMENT: &str = r#"{
        "name": "payment",
        "version": "1",
        "flow_nodes": [
            { "id": "start", "type": "start_event" },
            { "id": "paid", "type": "receive_task", "message": "paid",
              "correlation": { "type": "variable", "name": "order_id" },
              "outputs": [{ "source": { "type": "variable", "name": "amount" }, "target": "paid_amount" }] },
            { "id": "end", "type": "end_event" }
        ],
        "transitions": [
            { "id": "t1", "source": "start", "target": "paid" },
            { "id": "t2", "source": "paid", "target": "end" }
        ]
    }"#;

    #[test]
    fn test_message_correlation() {
        let engine = engine();
        let definition_id = deploy_enabled(&engine, PAYMENT);
        let first = engine.start_process(TENANT, definition_id, None, Vars::new().with("order_id", "A")).unwrap();
        let second = engine.start_process(TENANT, definition_id, None, Vars::new().with("order_id", "B")).unwrap();
        wait_waiting(&engine, first, "paid");
        wait_waiting(&engine, second, "paid");

        engine.send_message(TENANT, "paid", Some("B".to_string()), Vars::new().with("amount", 10)).unwrap();
        let archived = wait_archived(&engine, second);
        assert_eq!(archived.data.get::<i64>("paid_amount"), Some(10));
        assert_eq!(engine.process_instance(TENANT, first).unwrap().state, ProcessState::Started);

        // a message sent before anyone waits is kept until a catcher shows up
        engine.send_message(TENANT, "paid", Some("C".to_string()), Vars::new().with("amount", 30)).unwrap();
        let third = engine.start_process(TENANT, definition_id, None, Vars::new().with("order_id", "C")).unwrap();
        assert_eq!(wait_archived(&engine, third).data.get::<i64>("paid_amount"), Some(30));
        assert!(engine.process_instance(TENANT, first).is_ok());
        engine.shutdown();
    }

    #[test]
    fn test_cancel_process_instance() {
        let engine = engine();
        let definition_id = deploy_enabled(&engine, PAYMENT);
        let pid = engine.start_process(TENANT, definition_id, None, Vars::new().with("order_id", "X")).unwrap();
        wait_waiting(&engine, pid, "paid");

        engine.cancel_process_instance(TENANT, pid).unwrap();
        let archived = engine.archived_process_instance(TENANT, pid).unwrap();
        assert_eq!(archived.state, ProcessState::Cancelled);
        assert!(engine.active_flow_nodes(TENANT, pid).unwrap().is_empty());
        let paid = engine.archived_flow_node_instances(TENANT, pid).unwrap().into_iter().find(|n| n.flow_node_id == "paid").unwrap();
        assert_eq!(paid.state, FlowNodeState::Cancelled);
        engine.shutdown();
    }

    #[test]
    fn test_timer_catch_event() {
        let engine = engine();
        let definition_id = deploy_enabled(
            &engine,
            r#"{
            "name": "delay",
            "version": "1",
            "flow_nodes": [
                { "id": "start", "type": "start_event" },
                { "id": "wait", "type": "intermediate_catch_event", "trigger": { "type": "timer", "duration_ms": 50 } },
                { "id": "end", "type": "end_event" }
            ],
            "transitions": [
                { "id": "t1", "source": "start", "target": "wait" },
                { "id": "t2", "source": "wait", "target": "end" }
            ]
        }"#,
        );
        let pid = engine.start_process(TENANT, definition_id, None, Vars::new()).unwrap();
        assert_eq!(wait_archived(&engine, pid).state, ProcessState::Completed);
        engine.shutdown();
    }

    #[test]
    fn test_paused_tenant_rejects_starts() {
        let engine = engine();
        let definition_id = deploy_enabled(&engine, SIMPLE);
        engine.pause_tenant(TENANT).unwrap();
        assert!(matches!(engine.start_process(TENANT, definition_id, None, Vars::new().with("price", 1)), Err(ProcflowError::Engine(_))));

        engine.resume_tenant(TENANT).unwrap();
        let pid = engine.start_process(TENANT, definition_id, None, Vars::new().with("price", 1)).unwrap();
        assert_eq!(wait_archived(&engine, pid).state, ProcessState::Completed);

        engine.shutdown();
        assert!(!engine.is_running());
        assert!(matches!(engine.start_process(TENANT, definition_id, None, Vars::new()), Err(ProcflowError::Engine(_))));
    }
    #[test]
    fn test_retry_redelivers_the_consumed_message() {
        let engine = engine();
        let definition_id = deploy_enabled(&engine, PAYMENT);
        let pid = engine.start_process(TENANT, definition_id, None, Vars::new().with("order_id", "R")).unwrap();
        wait_waiting(&engine, pid, "paid");

        // the payload lacks `amount`, so the output mapping fails after the message was consumed
        engine.send_message(TENANT, "paid", Some("R".to_string()), Vars::new()).unwrap();
        let incident = wait_incident(&engine, pid);
        let failed = engine.flow_node_instance(TENANT, incident.flow_node_instance_id).unwrap();
        assert_eq!(failed.state, FlowNodeState::Failed);
        assert_eq!(failed.pending_trigger, Some(Vars::new()));

        engine.update_process_data(TENANT, pid, Vars::new().with("amount", 12)).unwrap();
        let outcome = engine.retry_flow_node(TENANT, failed.id).unwrap();
        assert_eq!(outcome.state, FlowNodeState::Completed);

        let archived = wait_archived(&engine, pid);
        assert_eq!(archived.state, ProcessState::Completed);
        assert_eq!(archived.data.get::<i64>("paid_amount"), Some(12));
        engine.shutdown();
    }

    #[test]
    fn test_interrupting_timer_boundary_aborts_the_activity() {
        let engine = engine();
        let definition_id = deploy_enabled(
            &engine,
            r#"{
            "name": "deadline",
            "version": "1",
            "flow_nodes": [
                { "id": "start", "type": "start_event" },
                { "id": "paid", "type": "receive_task", "message": "paid" },
                { "id": "too_late", "type": "boundary_event", "attached_to": "paid",
                  "trigger": { "type": "timer", "duration_ms": 100 } },
                { "id": "end", "type": "end_event" },
                { "id": "expired", "type": "automatic_task", "operations": [
                    { "target": "expired", "expression": { "type": "constant", "value": true } }
                ] },
                { "id": "expired_end", "type": "end_event" }
            ],
            "transitions": [
                { "id": "t1", "source": "start", "target": "paid" },
                { "id": "t2", "source": "paid", "target": "end" },
                { "id": "t3", "source": "too_late", "target": "expired" },
                { "id": "t4", "source": "expired", "target": "expired_end" }
            ]
        }"#,
        );
        let pid = engine.start_process(TENANT, definition_id, None, Vars::new()).unwrap();

        let archived = wait_archived(&engine, pid);
        assert_eq!(archived.state, ProcessState::Completed);
        assert_eq!(archived.data.get_value("expired"), Some(&json!(true)));
        assert_eq!(archived_node(&engine, pid, "paid").unwrap().state, FlowNodeState::Aborted);
        assert_eq!(archived_node(&engine, pid, "too_late").unwrap().state, FlowNodeState::Completed);
        assert!(archived_node(&engine, pid, "end").is_none());
        engine.shutdown();
    }

    #[test]
    fn test_non_interrupting_message_boundary_leaves_the_activity_running() {
        let engine = engine();
        let definition_id = deploy_enabled(
            &engine,
            r#"{
            "name": "reminder",
            "version": "1",
            "flow_nodes": [
                { "id": "start", "type": "start_event" },
                { "id": "paid", "type": "receive_task", "message": "paid" },
                { "id": "remind", "type": "boundary_event", "attached_to": "paid", "interrupting": false,
                  "trigger": { "type": "message", "name": "reminder" } },
                { "id": "note", "type": "automatic_task", "operations": [
                    { "target": "reminders", "operator": "append", "expression": { "type": "constant", "value": 1 } }
                ] },
                { "id": "note_end", "type": "end_event" },
                { "id": "end", "type": "end_event" }
            ],
            "transitions": [
                { "id": "t1", "source": "start", "target": "paid" },
                { "id": "t2", "source": "paid", "target": "end" },
                { "id": "t3", "source": "remind", "target": "note" },
                { "id": "t4", "source": "note", "target": "note_end" }
            ]
        }"#,
        );
        let pid = engine.start_process(TENANT, definition_id, None, Vars::new()).unwrap();
        wait_waiting(&engine, pid, "paid");
        wait_waiting(&engine, pid, "remind");

        engine.send_message(TENANT, "reminder", None, Vars::new()).unwrap();
        assert!(wait_until(|| archived_node(&engine, pid, "note_end").is_some()));
        assert_eq!(active_node(&engine, pid, "paid").state, FlowNodeState::Waiting);
        assert_eq!(archived_node(&engine, pid, "remind").unwrap().state, FlowNodeState::Completed);

        // the boundary fired once, a second reminder stays pending
        engine.send_message(TENANT, "reminder", None, Vars::new()).unwrap();
        engine.send_message(TENANT, "paid", None, Vars::new()).unwrap();
        let archived = wait_archived(&engine, pid);
        assert_eq!(archived.state, ProcessState::Completed);
        assert_eq!(archived.data.get_value("reminders"), Some(&json!([1])));
        assert_eq!(archived_node(&engine, pid, "paid").unwrap().state, FlowNodeState::Completed);
        engine.shutdown();
    }

    #[test]
    fn test_signal_reaches_every_catcher() {
        let engine = engine();
        let catcher = deploy_enabled(
            &engine,
            r#"{
            "name": "catcher",
            "version": "1",
            "flow_nodes": [
                { "id": "start", "type": "start_event" },
                { "id": "go", "type": "intermediate_catch_event", "trigger": { "type": "signal", "name": "go" },
                  "outputs": [{ "source": { "type": "variable", "name": "level" }, "target": "signal_level" }] },
                { "id": "end", "type": "end_event" }
            ],
            "transitions": [
                { "id": "t1", "source": "start", "target": "go" },
                { "id": "t2", "source": "go", "target": "end" }
            ]
        }"#,
        );
        let thrower = deploy_enabled(
            &engine,
            r#"{
            "name": "thrower",
            "version": "1",
            "flow_nodes": [
                { "id": "start", "type": "start_event" },
                { "id": "throw", "type": "intermediate_throw_event", "trigger": { "type": "signal", "name": "go" },
                  "payload": [{ "source": { "type": "constant", "value": 3 }, "target": "level" }] },
                { "id": "end", "type": "end_event" }
            ],
            "transitions": [
                { "id": "t1", "source": "start", "target": "throw" },
                { "id": "t2", "source": "throw", "target": "end" }
            ]
        }"#,
        );
        assert_eq!(engine.send_signal(TENANT, "go", Vars::new()).unwrap(), 0);

        let first = engine.start_process(TENANT, catcher, None, Vars::new()).unwrap();
        let second = engine.start_process(TENANT, catcher, None, Vars::new()).unwrap();
        wait_waiting(&engine, first, "go");
        wait_waiting(&engine, second, "go");

        let throwing = engine.start_process(TENANT, thrower, None, Vars::new()).unwrap();
        assert_eq!(wait_archived(&engine, throwing).state, ProcessState::Completed);
        for pid in [first, second] {
            let archived = wait_archived(&engine, pid);
            assert_eq!(archived.state, ProcessState::Completed);
            assert_eq!(archived.data.get::<i64>("signal_level"), Some(3));
        }
        engine.shutdown();
    }

    const GREETER: &str = r#"{
        "name": "greeter",
        "version": "1",
        "flow_nodes": [
            { "id": "start", "type": "start_event" },
            { "id": "greet", "type": "automatic_task", "operations": [
                { "target": "greeting", "expression": { "type": "template", "template": "hello ${who}" } }
            ] },
            { "id": "end", "type": "end_event" }
        ],
        "transitions": [
            { "id": "t1", "source": "start", "target": "greet" },
            { "id": "t2", "source": "greet", "target": "end" }
        ]
    }"#;

    const CALLER: &str = r#"{
        "name": "caller",
        "version": "1",
        "flow_nodes": [
            { "id": "start", "type": "start_event" },
            { "id": "call", "type": "call_activity", "process": "greeter",
              "inputs": [{ "source": { "type": "variable", "name": "name" }, "target": "who" }],
              "outputs": [{ "source": { "type": "variable", "name": "greeting" }, "target": "message" }] },
            { "id": "end", "type": "end_event" }
        ],
        "transitions": [
            { "id": "t1", "source": "start", "target": "call" },
            { "id": "t2", "source": "call", "target": "end" }
        ]
    }"#;

    #[test]
    fn test_call_activity_maps_inputs_and_outputs() {
        let engine = engine();
        deploy_enabled(&engine, GREETER);
        let caller = deploy_enabled(&engine, CALLER);
        let pid = engine.start_process(TENANT, caller, None, Vars::new().with("name", "Ada")).unwrap();

        let archived = wait_archived(&engine, pid);
        assert_eq!(archived.state, ProcessState::Completed);
        assert_eq!(archived.data.get::<String>("message").as_deref(), Some("hello Ada"));

        let call = archived_node(&engine, pid, "call").unwrap();
        let child_id = call.snapshot["called_process_instance_id"].as_u64().unwrap();
        let child = engine.archived_process_instance(TENANT, child_id).unwrap();
        assert_eq!(child.state, ProcessState::Completed);
        assert_eq!(child.caller_id, Some(call.source_object_id));
        assert_eq!(child.root_process_instance_id, pid);
        assert_eq!(child.data.get::<String>("who").as_deref(), Some("Ada"));
        engine.shutdown();
    }

    #[test]
    fn test_terminate_end_aborts_the_other_branches() {
        let engine = engine();
        let definition_id = deploy_enabled(
            &engine,
            r#"{
            "name": "terminate",
            "version": "1",
            "flow_nodes": [
                { "id": "start", "type": "start_event" },
                { "id": "split", "type": "parallel_gateway" },
                { "id": "wait", "type": "receive_task", "message": "never" },
                { "id": "wait_end", "type": "end_event" },
                { "id": "stop", "type": "end_event", "terminate": true }
            ],
            "transitions": [
                { "id": "t1", "source": "start", "target": "split" },
                { "id": "t2", "source": "split", "target": "wait" },
                { "id": "t3", "source": "wait", "target": "wait_end" },
                { "id": "t4", "source": "split", "target": "stop" }
            ]
        }"#,
        );
        let pid = engine.start_process(TENANT, definition_id, None, Vars::new()).unwrap();

        let archived = wait_archived(&engine, pid);
        assert_eq!(archived.state, ProcessState::Completed);
        assert_eq!(archived_node(&engine, pid, "wait").unwrap().state, FlowNodeState::Aborted);
        assert_eq!(archived_node(&engine, pid, "stop").unwrap().state, FlowNodeState::Completed);
        assert!(archived_node(&engine, pid, "wait_end").is_none());
        engine.shutdown();
    }

    #[test]
    fn test_inclusive_gateway_merges_the_taken_branches() {
        let engine = engine();
        let definition_id = deploy_enabled(
            &engine,
            r#"{
            "name": "inclusive",
            "version": "1",
            "flow_nodes": [
                { "id": "start", "type": "start_event" },
                { "id": "split", "type": "inclusive_gateway" },
                { "id": "a", "type": "automatic_task", "operations": [
                    { "target": "a", "expression": { "type": "constant", "value": 1 } }
                ] },
                { "id": "b", "type": "automatic_task", "operations": [
                    { "target": "b", "expression": { "type": "constant", "value": 2 } }
                ] },
                { "id": "c", "type": "automatic_task", "operations": [
                    { "target": "c", "expression": { "type": "constant", "value": 3 } }
                ] },
                { "id": "join", "type": "inclusive_gateway" },
                { "id": "end", "type": "end_event" }
            ],
            "transitions": [
                { "id": "t1", "source": "start", "target": "split" },
                { "id": "ta", "source": "split", "target": "a", "condition": { "type": "condition", "conditions": [
                    { "variable_selector": "amount", "comparison_operator": "gt", "value": "10" }
                ] } },
                { "id": "tb", "source": "split", "target": "b", "condition": { "type": "condition", "conditions": [
                    { "variable_selector": "amount", "comparison_operator": "gt", "value": "1000" }
                ] } },
                { "id": "tc", "source": "split", "target": "c", "condition": { "type": "condition", "conditions": [
                    { "variable_selector": "amount", "comparison_operator": "not_null" }
                ] } },
                { "id": "ja", "source": "a", "target": "join" },
                { "id": "jb", "source": "b", "target": "join" },
                { "id": "jc", "source": "c", "target": "join" },
                { "id": "t2", "source": "join", "target": "end" }
            ]
        }"#,
        );
        let pid = engine.start_process(TENANT, definition_id, None, Vars::new().with("amount", 50)).unwrap();

        let archived = wait_archived(&engine, pid);
        assert_eq!(archived.state, ProcessState::Completed);
        assert_eq!(archived.data.get::<i64>("a"), Some(1));
        assert_eq!(archived.data.get::<i64>("c"), Some(3));
        assert!(archived.data.get_value("b").is_none());

        let nodes = engine.archived_flow_node_instances(TENANT, pid).unwrap();
        assert!(nodes.iter().all(|n| n.flow_node_id != "b"));
        assert_eq!(nodes.iter().filter(|n| n.flow_node_id == "join").count(), 1);
        assert_eq!(nodes.iter().filter(|n| n.flow_node_id == "end").count(), 1);
        engine.shutdown();
    }

    fn routing(default_transition: bool) -> String {
        let default = if default_transition { r#", "default_transition": "small""# } else { "" };
        format!(
            r#"{{
            "name": "routing-{default_transition}",
            "version": "1",
            "flow_nodes": [
                {{ "id": "start", "type": "start_event" }},
                {{ "id": "route", "type": "exclusive_gateway"{default} }},
                {{ "id": "big_task", "type": "automatic_task", "operations": [
                    {{ "target": "size", "expression": {{ "type": "constant", "value": "big" }} }}
                ] }},
                {{ "id": "small_task", "type": "automatic_task", "operations": [
                    {{ "target": "size", "expression": {{ "type": "constant", "value": "small" }} }}
                ] }},
                {{ "id": "end", "type": "end_event" }}
            ],
            "transitions": [
                {{ "id": "t1", "source": "start", "target": "route" }},
                {{ "id": "big", "source": "route", "target": "big_task", "condition": {{ "type": "condition", "conditions": [
                    {{ "variable_selector": "amount", "comparison_operator": "gt", "value": "100" }}
                ] }} }},
                {{ "id": "small", "source": "route", "target": "small_task", "condition": {{ "type": "condition", "conditions": [
                    {{ "variable_selector": "amount", "comparison_operator": "lt", "value": "0" }}
                ] }} }},
                {{ "id": "t2", "source": "big_task", "target": "end" }},
                {{ "id": "t3", "source": "small_task", "target": "end" }}
            ]
        }}"#
        )
    }

    #[test]
    fn test_exclusive_gateway_takes_first_match_or_default() {
        let engine = engine();
        let definition_id = deploy_enabled(&engine, &routing(true));

        let big = engine.start_process(TENANT, definition_id, None, Vars::new().with("amount", 500)).unwrap();
        assert_eq!(wait_archived(&engine, big).data.get::<String>("size").as_deref(), Some("big"));

        let small = engine.start_process(TENANT, definition_id, None, Vars::new().with("amount", 5)).unwrap();
        let archived = wait_archived(&engine, small);
        assert_eq!(archived.data.get::<String>("size").as_deref(), Some("small"));
        assert!(archived_node(&engine, small, "big_task").is_none());
        engine.shutdown();
    }

    #[test]
    fn test_exclusive_gateway_without_match_fails() {
        let engine = engine();
        let definition_id = deploy_enabled(&engine, &routing(false));
        let pid = engine.start_process(TENANT, definition_id, None, Vars::new().with("amount", 5)).unwrap();

        let incident = wait_incident(&engine, pid);
        assert!(incident.description.contains("no default"), "{}", incident.description);
        let gateway = engine.flow_node_instance(TENANT, incident.flow_node_instance_id).unwrap();
        assert_eq!(gateway.flow_node_id, "route");
        assert_eq!(gateway.state, FlowNodeState::Failed);
        assert!(archived_node(&engine, pid, "small_task").is_none());
        engine.shutdown();
    }

    #[test]
    fn test_timer_start_follows_activation() {
        let engine = engine();
        let definition = ProcessDefinition::from_json(
            r#"{
            "name": "ticker",
            "version": "1",
            "flow_nodes": [
                { "id": "tick", "type": "start_event", "trigger": { "type": "timer", "cycle": "* * * * * *" } },
                { "id": "end", "type": "end_event" }
            ],
            "transitions": [{ "id": "t1", "source": "tick", "target": "end" }]
        }"#,
        )
        .unwrap();
        let definition_id = engine.deploy(TENANT, &definition).unwrap();
        let group = TENANT.to_string();
        let job_name = start_job_name(definition_id, "tick");
        assert!(!engine.scheduler().is_existing_job(&group, &job_name).unwrap());

        engine.enable_process_definition(TENANT, definition_id).unwrap();
        assert!(engine.scheduler().is_existing_job(&group, &job_name).unwrap());
        let started = |engine: &Engine| engine.store.count::<ArchivedProcessInstance>(TENANT, &Query::new().eq("definition_id", definition_id)).unwrap();
        assert!(wait_until(|| started(&engine) >= 1), "the timer start never fired");

        engine.disable_process_definition(TENANT, definition_id).unwrap();
        assert!(!engine.scheduler().is_existing_job(&group, &job_name).unwrap());
        // a firing already in flight may still finish
        std::thread::sleep(Duration::from_millis(300));
        let after_disable = started(&engine);
        std::thread::sleep(Duration::from_millis(1_500));
        assert_eq!(started(&engine), after_disable);
        engine.shutdown();
    }

    #[test]
    fn test_restart_continues_from_durable_state() {
        let durable = Durable::new();
        let before = durable.engine();
        let definition_id = deploy_enabled(&before, PAYMENT);
        let waiting = before.start_process(TENANT, definition_id, None, Vars::new().with("order_id", "A")).unwrap();
        let lost = before.start_process(TENANT, definition_id, None, Vars::new().with("order_id", "L")).unwrap();
        wait_waiting(&before, waiting, "paid");
        wait_waiting(&before, lost, "paid");
        before.shutdown();

        // matched while stopped: the trigger work dies with the old engine's queue
        durable
            .txs
            .execute_in_transaction(|| before.executor.send_message(TENANT, "paid", Some("L".to_string()), Vars::new().with("amount", 4)))
            .unwrap();
        assert_eq!(before.executor.match_messages(TENANT).unwrap(), 1);

        let after = durable.engine();
        assert_eq!(after.process_instance(TENANT, waiting).unwrap().state, ProcessState::Started);
        assert_eq!(wait_archived(&after, lost).data.get::<i64>("paid_amount"), Some(4));

        after.send_message(TENANT, "paid", Some("A".to_string()), Vars::new().with("amount", 9)).unwrap();
        assert_eq!(wait_archived(&after, waiting).data.get::<i64>("paid_amount"), Some(9));
        after.shutdown();
    }

    #[test]
    fn test_restart_resumes_a_gateway_holding_all_tokens() {
        let durable = Durable::new();
        let before = durable.engine();
        let definition_id = deploy_enabled(
            &before,
            r#"{
            "name": "join-after-restart",
            "version": "1",
            "flow_nodes": [
                { "id": "start", "type": "start_event" },
                { "id": "split", "type": "parallel_gateway" },
                { "id": "a", "type": "automatic_task" },
                { "id": "wait", "type": "receive_task", "message": "go" },
                { "id": "join", "type": "parallel_gateway" },
                { "id": "end", "type": "end_event" }
            ],
            "transitions": [
                { "id": "t1", "source": "start", "target": "split" },
                { "id": "t2", "source": "split", "target": "a" },
                { "id": "t3", "source": "split", "target": "wait" },
                { "id": "t4", "source": "a", "target": "join" },
                { "id": "t5", "source": "wait", "target": "join" },
                { "id": "t6", "source": "join", "target": "end" }
            ]
        }"#,
        );
        let pid = before.start_process(TENANT, definition_id, None, Vars::new()).unwrap();
        wait_waiting(&before, pid, "wait");
        wait_waiting(&before, pid, "join");
        before.shutdown();

        // the last token reaches the join, whose execution is queued on the stopped engine
        let wait = active_node(&before, pid, "wait");
        assert_eq!(before.executor.trigger(TENANT, wait.id, Vars::new()).unwrap().state, FlowNodeState::Completed);
        assert_eq!(active_node(&before, pid, "join").hit_bys.len(), 2);

        let after = durable.engine();
        assert_eq!(wait_archived(&after, pid).state, ProcessState::Completed);
        let nodes = after.archived_flow_node_instances(TENANT, pid).unwrap();
        assert_eq!(nodes.iter().filter(|n| n.flow_node_id == "join").count(), 1);
        after.shutdown();
    }

    #[test]
    fn test_restart_resumes_a_caller_whose_child_completed() {
        let durable = Durable::new();
        let before = durable.engine();
        deploy_enabled(
            &before,
            r#"{
            "name": "greeter",
            "version": "1",
            "flow_nodes": [
                { "id": "start", "type": "start_event" },
                { "id": "hold", "type": "receive_task", "message": "release",
                  "outputs": [{ "source": { "type": "template", "template": "hello ${who}" }, "target": "greeting" }] },
                { "id": "end", "type": "end_event" }
            ],
            "transitions": [
                { "id": "t1", "source": "start", "target": "hold" },
                { "id": "t2", "source": "hold", "target": "end" }
            ]
        }"#,
        );
        let caller = deploy_enabled(&before, CALLER);
        let pid = before.start_process(TENANT, caller, None, Vars::new().with("name", "Bo")).unwrap();
        wait_waiting(&before, pid, "call");
        let child_id = active_node(&before, pid, "call").called_process_instance_id.unwrap();
        wait_waiting(&before, child_id, "hold");
        before.shutdown();

        // the child completes while the engine is stopped, so its caller is never triggered
        let hold = active_node(&before, child_id, "hold");
        before.executor.trigger(TENANT, hold.id, Vars::new()).unwrap();
        assert_eq!(before.archived_process_instance(TENANT, child_id).unwrap().state, ProcessState::Completed);
        assert_eq!(active_node(&before, pid, "call").state, FlowNodeState::Waiting);

        let after = durable.engine();
        let archived = wait_archived(&after, pid);
        assert_eq!(archived.state, ProcessState::Completed);
        assert_eq!(archived.data.get::<String>("message").as_deref(), Some("hello Bo"));
        after.shutdown();
    }
}
