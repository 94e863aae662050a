use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, EnumString};

use crate::{
    TenantId,
    store::{PersistentObject, StoreIden},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsRefStr, EnumString, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActivationState {
    #[default]
    Disabled,
    Enabled,
}

/// A deployed process definition. The definition itself is kept as JSON and never mutated.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProcessDefinitionInfo {
    pub id: u64,
    pub tenant_id: TenantId,
    pub name: String,
    pub version: String,
    pub description: String,
    pub activation: ActivationState,
    pub content: Value,
    pub deployed_at: i64,
}

impl PersistentObject for ProcessDefinitionInfo {
    fn iden() -> StoreIden {
        StoreIden::ProcessDefinitions
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
