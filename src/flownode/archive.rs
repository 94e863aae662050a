use tracing::info;

use super::FlowNodeExecutor;
use crate::{
    Result, Vars,
    engine::WorkKind,
    store::{
        Query,
        data::{ArchivedFlowNodeInstance, ArchivedProcessInstance, DataInstance, FlowNodeInstance, ProcessInstance, ProcessState},
    },
    utils,
};

impl FlowNodeExecutor {
    /// Copies a terminated flow node into the archive and deletes its runtime row.
    pub(super) fn archive_flow_node(
        &self,
        fni: &FlowNodeInstance,
    ) -> Result<()> {
        let archived = ArchivedFlowNodeInstance {
            id: self.store.next_id::<ArchivedFlowNodeInstance>(fni.tenant_id)?,
            tenant_id: fni.tenant_id,
            source_object_id: fni.id,
            process_instance_id: fni.process_instance_id,
            root_process_instance_id: fni.root_process_instance_id,
            flow_node_id: fni.flow_node_id.clone(),
            name: fni.name.clone(),
            kind: fni.kind,
            state: fni.state,
            executed_by: fni.executed_by,
            start_date: fni.start_date,
            archive_date: utils::time::time_millis(),
            snapshot: serde_json::to_value(fni)?,
        };
        self.recorder.insert(&archived)?;
        self.recorder.delete::<FlowNodeInstance>(fni.tenant_id, fni.id)
    }

    /// Ends a process instance: the final state is recorded, the instance is archived with a
    /// snapshot of its data, and the runtime rows are deleted. A completed called process
    /// hands its data back to the calling activity.
    pub(super) fn finish_process(
        &self,
        mut pi: ProcessInstance,
        state: ProcessState,
    ) -> Result<()> {
        let data_instances: Vec<DataInstance> = self.store.list(pi.tenant_id, &Query::new().eq("container_id", pi.id))?;
        let mut data = Vars::new();
        for d in data_instances.iter() {
            data.set(&d.name, d.value.clone());
        }

        let now = utils::time::time_millis();
        pi.state = state;
        pi.end_date = Some(now);
        pi.last_update = now;
        self.recorder.update_entity(&pi)?;

        let archived = ArchivedProcessInstance {
            id: self.store.next_id::<ArchivedProcessInstance>(pi.tenant_id)?,
            tenant_id: pi.tenant_id,
            source_object_id: pi.id,
            definition_id: pi.definition_id,
            name: pi.name.clone(),
            state,
            root_process_instance_id: pi.root_process_instance_id,
            caller_id: pi.caller_id,
            started_by: pi.started_by,
            string_index: pi.string_index.clone(),
            start_date: pi.start_date,
            end_date: now,
            archive_date: now,
            data: data.clone(),
        };
        self.recorder.insert(&archived)?;
        for d in data_instances.iter() {
            self.recorder.delete::<DataInstance>(pi.tenant_id, d.id)?;
        }
        self.recorder.delete::<ProcessInstance>(pi.tenant_id, pi.id)?;

        if let (ProcessState::Completed, Some(caller_id)) = (state, pi.caller_id) {
            self.works.register(pi.tenant_id, WorkKind::TriggerFlowNode {
                flow_node_instance_id: caller_id,
                payload: data,
            })?;
        }
        info!(tenant_id = pi.tenant_id, process_instance_id = pi.id, state = state.as_ref(), "process instance finished");
        Ok(())
    }
}
