use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::{
    TenantId, UserId, Vars,
    store::{PersistentObject, StoreIden},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProcessState {
    Initializing,
    Started,
    Completed,
    Aborted,
    Cancelled,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Completed | ProcessState::Aborted | ProcessState::Cancelled)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProcessInstance {
    pub id: u64,
    pub tenant_id: TenantId,
    pub definition_id: u64,
    pub name: String,
    pub state: ProcessState,
    pub root_process_instance_id: u64,
    /// Call activity instance that started this process.
    pub caller_id: Option<u64>,
    pub started_by: Option<UserId>,
    pub string_index: Vec<Option<String>>,
    pub start_date: i64,
    pub end_date: Option<i64>,
    pub last_update: i64,
}

impl PersistentObject for ProcessInstance {
    fn iden() -> StoreIden {
        StoreIden::ProcessInstances
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// Immutable copy of a terminated process instance, with its final data.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ArchivedProcessInstance {
    pub id: u64,
    pub tenant_id: TenantId,
    pub source_object_id: u64,
    pub definition_id: u64,
    pub name: String,
    pub state: ProcessState,
    pub root_process_instance_id: u64,
    pub caller_id: Option<u64>,
    pub started_by: Option<UserId>,
    pub string_index: Vec<Option<String>>,
    pub start_date: i64,
    pub end_date: i64,
    pub archive_date: i64,
    pub data: Vars,
}

impl PersistentObject for ArchivedProcessInstance {
    fn iden() -> StoreIden {
        StoreIden::ArchivedProcessInstances
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
