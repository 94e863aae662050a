use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    TenantId, UserId, Vars,
    flownode::FlowNodeState,
    model::FlowNodeType,
    store::{PersistentObject, StoreIden},
};

/// Runtime row of a flow node. Exists only until the flow node reaches a terminal state.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FlowNodeInstance {
    pub id: u64,
    pub tenant_id: TenantId,
    pub process_instance_id: u64,
    pub root_process_instance_id: u64,
    /// Container scope; the process instance for top-level flow nodes.
    pub parent_id: u64,
    pub definition_id: u64,
    /// Element id inside the process definition.
    pub flow_node_id: String,
    pub name: String,
    pub kind: FlowNodeType,

    pub state: FlowNodeState,
    pub previous_state: Option<FlowNodeState>,
    pub stable: bool,
    pub terminal: bool,
    pub token_count: u32,
    /// Incoming transitions already merged into a gateway.
    pub hit_bys: Vec<String>,

    pub actor_id: Option<u64>,
    pub assignee_id: Option<UserId>,
    pub executed_by: Option<UserId>,

    /// Activity a boundary event is attached to.
    pub attached_to: Option<u64>,
    pub interrupting: bool,
    /// Set once the catch event or boundary event was triggered.
    pub triggered: bool,
    /// Set when an interrupting boundary event aborted this activity.
    pub interrupted_by: Option<u64>,
    pub called_process_instance_id: Option<u64>,

    pub error: Option<String>,
    /// Payload of the trigger whose transition failed, delivered again on retry.
    pub pending_trigger: Option<Vars>,
    pub start_date: i64,
    pub reached_state_date: i64,
    pub last_update: i64,
}

impl PersistentObject for FlowNodeInstance {
    fn iden() -> StoreIden {
        StoreIden::FlowNodeInstances
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Append-only copy of a terminated flow node.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ArchivedFlowNodeInstance {
    pub id: u64,
    pub tenant_id: TenantId,
    pub source_object_id: u64,
    pub process_instance_id: u64,
    pub root_process_instance_id: u64,
    pub flow_node_id: String,
    pub name: String,
    pub kind: FlowNodeType,
    pub state: FlowNodeState,
    pub executed_by: Option<UserId>,
    pub start_date: i64,
    pub archive_date: i64,
    /// Last runtime row, as it was before deletion.
    pub snapshot: Value,
}

impl PersistentObject for ArchivedFlowNodeInstance {
    fn iden() -> StoreIden {
        StoreIden::ArchivedFlowNodeInstances
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
