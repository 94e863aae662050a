use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    TenantId,
    store::{PersistentObject, StoreIden},
};

/// One process variable.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DataInstance {
    pub id: u64,
    pub tenant_id: TenantId,
    /// Owning process instance.
    pub container_id: u64,
    pub name: String,
    pub value: Value,
    pub last_update: i64,
}

impl PersistentObject for DataInstance {
    fn iden() -> StoreIden {
        StoreIden::DataInstances
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
