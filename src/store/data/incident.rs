use serde::{Deserialize, Serialize};

use crate::{
    TenantId,
    store::{PersistentObject, StoreIden},
};

/// Operator-visible record of a flow node that failed outside a synchronous call.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Incident {
    pub id: u64,
    pub tenant_id: TenantId,
    pub process_instance_id: u64,
    pub flow_node_instance_id: u64,
    pub description: String,
    pub created_at: i64,
}

impl PersistentObject for Incident {
    fn iden() -> StoreIden {
        StoreIden::Incidents
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
