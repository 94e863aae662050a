use serde::{Deserialize, Serialize};
use strum::AsRefStr;

use crate::{
    TenantId, Vars,
    store::{PersistentObject, StoreIden},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WaitingEventKind {
    Message,
    Signal,
    Timer,
}

/// Subscription of a waiting flow node to a message, signal or timer.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WaitingEvent {
    pub id: u64,
    pub tenant_id: TenantId,
    pub kind: WaitingEventKind,
    /// Message or signal name; the job name for timers.
    pub name: String,
    pub correlation: Option<String>,
    pub process_instance_id: u64,
    pub flow_node_instance_id: u64,
    pub active: bool,
    /// Payload handed to the flow node when the subscription was consumed.
    pub delivered: Option<Vars>,
}

impl PersistentObject for WaitingEvent {
    fn iden() -> StoreIden {
        StoreIden::WaitingEvents
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// A sent message that has not been consumed yet.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MessageInstance {
    pub id: u64,
    pub tenant_id: TenantId,
    pub name: String,
    pub correlation: Option<String>,
    pub payload: Vars,
    pub sent_at: i64,
    pub handled: bool,
}

impl PersistentObject for MessageInstance {
    fn iden() -> StoreIden {
        StoreIden::MessageInstances
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
