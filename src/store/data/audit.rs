use serde::{Deserialize, Serialize};

use crate::{
    TenantId,
    store::{PersistentObject, StoreIden},
};

#[derive(Default, Deserialize, Serialize, Debug, Clone)]
pub struct AuditLog {
    pub id: u64,
    pub tenant_id: TenantId,
    /// e.g. `FLOWNODEINSTANCE_UPDATED`
    pub event_key: String,
    pub object_id: u64,
    pub process_instance_id: Option<u64>,
    pub state: Option<String>,
    pub timestamp: i64,
}

impl PersistentObject for AuditLog {
    fn iden() -> StoreIden {
        StoreIden::AuditLogs
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
