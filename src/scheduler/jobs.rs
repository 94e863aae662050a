//! Job contents scheduled by the engine itself.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{JobContent, JobContext};
use crate::{Result, TenantId};

/// Fires a timer catch event or a timer boundary event.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TriggerTimerEventJob {
    pub tenant_id: TenantId,
    pub flow_node_instance_id: u64,
}

#[typetag::serde]
impl JobContent for TriggerTimerEventJob {
    fn execute(
        &self,
        ctx: &JobContext,
    ) -> Result<()> {
        ctx.environment.fire_timer(self.tenant_id, self.flow_node_instance_id)
    }
}

/// Starts a process instance from a timer start event.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StartProcessJob {
    pub tenant_id: TenantId,
    pub definition_id: u64,
    pub start_event_id: String,
}

#[typetag::serde]
impl JobContent for StartProcessJob {
    fn execute(
        &self,
        ctx: &JobContext,
    ) -> Result<()> {
        ctx.environment.start_process_from_timer(self.tenant_id, self.definition_id, &self.start_event_id)
    }
}

/// Runs one transition of a flow node.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecuteFlowNodeJob {
    pub tenant_id: TenantId,
    pub flow_node_instance_id: u64,
}

#[typetag::serde]
impl JobContent for ExecuteFlowNodeJob {
    fn execute(
        &self,
        ctx: &JobContext,
    ) -> Result<()> {
        ctx.environment.execute_flow_node(self.tenant_id, self.flow_node_instance_id)
    }
}

/// Restart-handling sweep over flow nodes stuck in a non-stable state.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecoverFlowNodesJob {
    pub tenant_id: Option<TenantId>,
}

#[typetag::serde]
impl JobContent for RecoverFlowNodesJob {
    fn execute(
        &self,
        ctx: &JobContext,
    ) -> Result<()> {
        let resumed = ctx.environment.recover(self.tenant_id)?;
        if resumed > 0 {
            info!(resumed, "recovered flow nodes");
        }
        Ok(())
    }
}
