use serde_json::{Map, Value};
use tracing::{info, warn};

use super::{FlowNodeExecutor, FlowNodeState, PROCESS_INSTANCE_LOCK};
use crate::{
    ProcflowError, Result, TenantId, UserId, Vars,
    engine::WorkKind,
    model::{DataMapping, FlowNodeDefinition, FlowNodeKind},
    store::{
        Query,
        data::{ActivationState, DataInstance, FlowNodeInstance, ProcessDefinitionInfo, ProcessInstance, ProcessState},
    },
    utils,
    workflow::ProcessGraph,
};

/// Maximum number of searchable string indexes of a process instance.
const MAX_STRING_INDEXES: usize = 5;

/// Process instance a new flow node belongs to.
#[derive(Debug, Clone, Copy)]
pub(super) struct Scope {
    pub tenant_id: TenantId,
    pub process_instance_id: u64,
    pub root_process_instance_id: u64,
    pub definition_id: u64,
}

impl From<&ProcessInstance> for Scope {
    fn from(pi: &ProcessInstance) -> Self {
        Self {
            tenant_id: pi.tenant_id,
            process_instance_id: pi.id,
            root_process_instance_id: pi.root_process_instance_id,
            definition_id: pi.definition_id,
        }
    }
}

impl From<&FlowNodeInstance> for Scope {
    fn from(fni: &FlowNodeInstance) -> Self {
        Self {
            tenant_id: fni.tenant_id,
            process_instance_id: fni.process_instance_id,
            root_process_instance_id: fni.root_process_instance_id,
            definition_id: fni.definition_id,
        }
    }
}

impl FlowNodeExecutor {
    /// Starts a process from its start events without trigger. Returns the new instance id.
    pub fn start_process(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
        started_by: Option<UserId>,
        inputs: Vars,
    ) -> Result<u64> {
        self.ensure_active_tenant(tenant_id)?;
        let info = self.enabled_definition(tenant_id, definition_id)?;
        let graph = self.graph(tenant_id, definition_id)?;
        let starts = graph.none_start_events();
        if starts.is_empty() {
            return Err(ProcflowError::Definition(format!("process '{}' has no start event without trigger", info.name)));
        }
        if let Some(contract) = &graph.definition().contract {
            self.contracts.validate(contract, &inputs)?;
        }
        self.txs.execute_in_transaction(|| self.create_process_instance(&info, &graph, &starts, started_by, None, inputs))
    }

    /// Starts a process from one given start event, as a timer start does.
    pub(crate) fn start_process_at(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
        start_event_id: &str,
    ) -> Result<u64> {
        self.ensure_active_tenant(tenant_id)?;
        let info = self.enabled_definition(tenant_id, definition_id)?;
        let graph = self.graph(tenant_id, definition_id)?;
        let start = graph.flow_node(start_event_id)?;
        self.txs.execute_in_transaction(|| self.create_process_instance(&info, &graph, &[start], None, None, Vars::new()))
    }

    fn enabled_definition(
        &self,
        tenant_id: TenantId,
        definition_id: u64,
    ) -> Result<ProcessDefinitionInfo> {
        let info: ProcessDefinitionInfo = self.store.get(tenant_id, definition_id)?;
        if info.activation != ActivationState::Enabled {
            return Err(ProcflowError::Definition(format!("process definition {} ({} {}) is disabled", info.id, info.name, info.version)));
        }
        Ok(info)
    }

    fn create_process_instance(
        &self,
        info: &ProcessDefinitionInfo,
        graph: &ProcessGraph,
        starts: &[&FlowNodeDefinition],
        started_by: Option<UserId>,
        caller: Option<&FlowNodeInstance>,
        inputs: Vars,
    ) -> Result<u64> {
        let tenant_id = info.tenant_id;
        let definition = graph.definition();

        let mut context = Vars::new();
        for parameter in definition.parameters.iter() {
            context.set(&parameter.name, parameter.value.clone());
        }
        context.extend(&inputs);
        let mut data = Vars::new();
        for d in definition.data.iter() {
            let value = match &d.default_value {
                Some(expr) => self.evaluator.evaluate(expr, &context)?,
                None => Value::Null,
            };
            data.set(&d.name, value);
        }
        data.extend(&inputs);

        let mut string_index = Vec::new();
        for expr in definition.string_indexes.iter().take(MAX_STRING_INDEXES) {
            string_index.push(self.evaluator.evaluate_string(expr, &data)?);
        }

        let id = self.store.next_id::<ProcessInstance>(tenant_id)?;
        let now = utils::time::time_millis();
        let pi = ProcessInstance {
            id,
            tenant_id,
            definition_id: info.id,
            name: definition.name.clone(),
            state: ProcessState::Initializing,
            root_process_instance_id: caller.map(|c| c.root_process_instance_id).unwrap_or(id),
            caller_id: caller.map(|c| c.id),
            started_by,
            string_index,
            start_date: now,
            end_date: None,
            last_update: now,
        };
        self.recorder.insert(&pi)?;
        for (name, value) in data.iter() {
            self.insert_data(tenant_id, id, name, value.clone())?;
        }

        let mut fields = Map::new();
        fields.insert("state".to_string(), serde_json::to_value(ProcessState::Started)?);
        let pi: ProcessInstance = self.recorder.update(tenant_id, id, fields)?;
        for start in starts {
            self.spawn_flow_node(Scope::from(&pi), start, None)?;
        }
        info!(tenant_id, process_instance_id = id, definition = %pi.name, caller_id = ?pi.caller_id, "process instance started");
        Ok(id)
    }

    /// Starts the process called by a call activity and links it to `fni`.
    pub(super) fn start_called_process(
        &self,
        fni: &mut FlowNodeInstance,
        process: &str,
        version: Option<&str>,
        inputs: &[DataMapping],
    ) -> Result<()> {
        let mut query = Query::new().eq("name", process).eq("activation", ActivationState::Enabled.as_ref()).order_by("id", true);
        if let Some(version) = version {
            query = query.eq("version", version);
        }
        let info: ProcessDefinitionInfo = self
            .store
            .first(fni.tenant_id, &query)?
            .ok_or_else(|| ProcflowError::Definition(format!("no enabled process definition named '{}'", process)))?;
        let graph = self.graph(fni.tenant_id, info.id)?;
        let starts = graph.none_start_events();
        if starts.is_empty() {
            return Err(ProcflowError::Definition(format!("called process '{}' has no start event without trigger", process)));
        }

        let context = self.process_data(fni.tenant_id, fni.process_instance_id)?;
        let child_inputs = self.map_data(inputs, &context)?;
        let child_id = self.create_process_instance(&info, &graph, &starts, None, Some(&*fni), child_inputs)?;
        fni.called_process_instance_id = Some(child_id);
        Ok(())
    }

    /// Builds the runtime row of a new flow node without storing it.
    pub(super) fn new_flow_node(
        &self,
        scope: Scope,
        node: &FlowNodeDefinition,
    ) -> Result<FlowNodeInstance> {
        let now = utils::time::time_millis();
        Ok(FlowNodeInstance {
            id: self.store.next_id::<FlowNodeInstance>(scope.tenant_id)?,
            tenant_id: scope.tenant_id,
            process_instance_id: scope.process_instance_id,
            root_process_instance_id: scope.root_process_instance_id,
            parent_id: scope.process_instance_id,
            definition_id: scope.definition_id,
            flow_node_id: node.id.clone(),
            name: node.display_name().to_string(),
            kind: node.node_type(),
            state: FlowNodeState::Initializing,
            previous_state: None,
            stable: false,
            terminal: false,
            token_count: 1,
            hit_bys: Vec::new(),
            actor_id: None,
            assignee_id: None,
            executed_by: None,
            attached_to: None,
            interrupting: false,
            triggered: false,
            interrupted_by: None,
            called_process_instance_id: None,
            error: None,
            pending_trigger: None,
            start_date: now,
            reached_state_date: now,
            last_update: now,
        })
    }

    /// Creates a flow node in `initializing` and queues its first transition.
    pub(super) fn spawn_flow_node(
        &self,
        scope: Scope,
        node: &FlowNodeDefinition,
        hit_by: Option<&str>,
    ) -> Result<u64> {
        let mut fni = self.new_flow_node(scope, node)?;
        if let Some(transition_id) = hit_by {
            fni.hit_bys.push(transition_id.to_string());
        }
        self.recorder.insert(&fni)?;
        self.works.register(scope.tenant_id, WorkKind::ExecuteFlowNode {
            flow_node_instance_id: fni.id,
        })?;
        Ok(fni.id)
    }

    /// Creates the boundary events of an activity the first time it becomes stable.
    pub(super) fn create_boundaries(
        &self,
        activity: &FlowNodeInstance,
        graph: &ProcessGraph,
    ) -> Result<()> {
        let boundaries = graph.boundary_events_of(&activity.flow_node_id);
        if boundaries.is_empty() || self.store.count::<FlowNodeInstance>(activity.tenant_id, &Query::new().eq("attached_to", activity.id))? > 0 {
            return Ok(());
        }
        for boundary in boundaries {
            let FlowNodeKind::BoundaryEvent {
                interrupting,
                trigger,
                ..
            } = &boundary.kind
            else {
                continue;
            };
            let mut fni = self.new_flow_node(Scope::from(activity), boundary)?;
            fni.attached_to = Some(activity.id);
            fni.interrupting = *interrupting;
            fni.state = FlowNodeState::Waiting;
            fni.stable = true;
            self.recorder.insert(&fni)?;
            self.arm(&fni, trigger)?;
        }
        Ok(())
    }

    /// Aborts or cancels a flow node in place: its triggers are released, its boundary events
    /// and called process are cancelled, and it is archived without moving its token.
    pub(super) fn interrupt(
        &self,
        fni: &mut FlowNodeInstance,
        final_state: FlowNodeState,
        interrupted_by: Option<u64>,
    ) -> Result<()> {
        let transient = if final_state == FlowNodeState::Cancelled { FlowNodeState::Cancelling } else { FlowNodeState::Aborting };
        self.change_state(fni, transient)?;
        self.release_triggers(fni)?;
        if fni.kind.is_activity() {
            self.cancel_boundaries(fni, interrupted_by)?;
        }
        if let Some(child_id) = fni.called_process_instance_id {
            self.works.register(fni.tenant_id, WorkKind::CancelProcessInstance {
                process_instance_id: child_id,
            })?;
        }
        fni.interrupted_by = interrupted_by;
        self.change_state(fni, final_state)?;
        self.archive_flow_node(fni)
    }

    /// Cancels the boundary events attached to `activity`, except `except`.
    pub(super) fn cancel_boundaries(
        &self,
        activity: &FlowNodeInstance,
        except: Option<u64>,
    ) -> Result<()> {
        let boundaries: Vec<FlowNodeInstance> = self.store.list(activity.tenant_id, &Query::new().eq("attached_to", activity.id))?;
        for mut boundary in boundaries.into_iter().filter(|b| Some(b.id) != except) {
            self.interrupt(&mut boundary, FlowNodeState::Cancelled, None)?;
        }
        Ok(())
    }

    /// Aborts the activity an interrupting boundary event is attached to.
    pub(super) fn interrupt_attached(
        &self,
        boundary: &FlowNodeInstance,
    ) -> Result<()> {
        let Some(activity_id) = boundary.attached_to else {
            return Ok(());
        };
        let Some(mut activity) = self.store.find::<FlowNodeInstance>(boundary.tenant_id, activity_id)? else {
            warn!(tenant_id = boundary.tenant_id, boundary_id = boundary.id, activity_id, "attached activity already gone");
            return Ok(());
        };
        self.interrupt(&mut activity, FlowNodeState::Aborted, Some(boundary.id))?;
        info!(tenant_id = boundary.tenant_id, activity_id, boundary_id = boundary.id, "activity interrupted by boundary event");
        Ok(())
    }

    /// Aborts every other flow node of the process of a terminate end event.
    pub(super) fn terminate_process(
        &self,
        end: &FlowNodeInstance,
    ) -> Result<()> {
        let others: Vec<FlowNodeInstance> =
            self.store.list(end.tenant_id, &Query::new().eq("process_instance_id", end.process_instance_id).ne("id", end.id))?;
        for id in others.iter().map(|f| f.id) {
            // boundary events go away with their activity
            if let Some(mut other) = self.store.find::<FlowNodeInstance>(end.tenant_id, id)? {
                self.interrupt(&mut other, FlowNodeState::Aborted, None)?;
            }
        }
        Ok(())
    }

    /// Cancels every flow node and called process of a process instance.
    pub fn cancel_process_instance(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
    ) -> Result<()> {
        self.end_process_instance(tenant_id, process_instance_id, ProcessState::Cancelled)
    }

    pub(crate) fn abort_process_instance(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
    ) -> Result<()> {
        self.end_process_instance(tenant_id, process_instance_id, ProcessState::Aborted)
    }

    fn end_process_instance(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
        state: ProcessState,
    ) -> Result<()> {
        let node_state = if state == ProcessState::Cancelled { FlowNodeState::Cancelled } else { FlowNodeState::Aborted };
        self.with_retries(|| {
            let mut locks = self.transition_locks(tenant_id);
            locks.acquire(process_instance_id, PROCESS_INSTANCE_LOCK)?;
            self.txs.execute_in_transaction(|| {
                let pi: ProcessInstance = self.store.get(tenant_id, process_instance_id)?;
                let fnis: Vec<FlowNodeInstance> = self.store.list(tenant_id, &Query::new().eq("process_instance_id", process_instance_id))?;
                for id in fnis.iter().map(|f| f.id) {
                    if let Some(mut fni) = self.store.find::<FlowNodeInstance>(tenant_id, id)? {
                        self.interrupt(&mut fni, node_state, None)?;
                    }
                }
                self.finish_process(pi, state)
            })
        })
    }

    /// Current data of a process instance.
    pub fn process_data(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
    ) -> Result<Vars> {
        let data: Vec<DataInstance> = self.store.list(tenant_id, &Query::new().eq("container_id", process_instance_id))?;
        let mut vars = Vars::new();
        for d in data {
            vars.set(&d.name, d.value);
        }
        Ok(vars)
    }

    /// Sets one process variable, creating it when missing.
    pub(super) fn set_process_data(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let existing: Option<DataInstance> = self.store.first(tenant_id, &Query::new().eq("container_id", process_instance_id).eq("name", name))?;
        match existing {
            Some(mut data) => {
                data.value = value;
                data.last_update = utils::time::time_millis();
                self.recorder.update_entity(&data)
            }
            None => self.insert_data(tenant_id, process_instance_id, name, value),
        }
    }

    fn insert_data(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let data = DataInstance {
            id: self.store.next_id::<DataInstance>(tenant_id)?,
            tenant_id,
            container_id: process_instance_id,
            name: name.to_string(),
            value,
            last_update: utils::time::time_millis(),
        };
        self.recorder.insert(&data)
    }

    /// Updates process variables under the process instance lock.
    pub fn update_process_data(
        &self,
        tenant_id: TenantId,
        process_instance_id: u64,
        values: Vars,
    ) -> Result<()> {
        self.with_retries(|| {
            let mut locks = self.transition_locks(tenant_id);
            locks.acquire(process_instance_id, PROCESS_INSTANCE_LOCK)?;
            self.txs.execute_in_transaction(|| {
                let _: ProcessInstance = self.store.get(tenant_id, process_instance_id)?;
                for (name, value) in values.iter() {
                    self.set_process_data(tenant_id, process_instance_id, name, value.clone())?;
                }
                Ok(())
            })
        })
    }

    /// Ready user tasks `user_id` may execute: the ones assigned to the user, and the
    /// unassigned ones whose actor the user belongs to.
    pub fn pending_user_tasks(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> Result<Vec<FlowNodeInstance>> {
        let ready: Vec<FlowNodeInstance> =
            self.store.list(tenant_id, &Query::new().eq("kind", "user_task").eq("state", FlowNodeState::Ready.as_ref()))?;
        let mut pending = Vec::new();
        for task in ready {
            let allowed = match (task.assignee_id, task.actor_id) {
                (Some(assignee), _) => assignee == user_id,
                (None, Some(actor_id)) => self.is_actor_member(tenant_id, actor_id, user_id)?,
                (None, None) => false,
            };
            if allowed {
                pending.push(task);
            }
        }
        Ok(pending)
    }
}
