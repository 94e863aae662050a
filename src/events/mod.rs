//! Domain events fired by the recorder.
//!
//! An event is keyed by the entity discriminator and the action, rendered as
//! `<DISCRIMINATOR>_<ACTION>` (for example `PROCESSINSTANCE_UPDATED`). Handlers run
//! synchronously inside the transaction that produced the event.

mod service;

use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;
use strum::{AsRefStr, EnumIter};

use crate::{Result, TenantId, store::StoreIden};

pub use service::EventService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
}

/// Dispatch key of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventTypeKey {
    pub iden: StoreIden,
    pub action: EventAction,
}

impl EventTypeKey {
    pub fn new(
        iden: StoreIden,
        action: EventAction,
    ) -> Self {
        Self {
            iden,
            action,
        }
    }
}

impl fmt::Display for EventTypeKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}_{}", self.iden.discriminator(), self.action.as_ref())
    }
}

/// A mutation of one entity, with its state before and after.
#[derive(Debug, Clone)]
pub struct Event {
    pub key: EventTypeKey,
    pub tenant_id: TenantId,
    pub object_id: u64,
    pub old: Option<Value>,
    pub new: Option<Value>,
    pub timestamp: i64,
}

impl Event {
    /// Field of the new value, falling back to the old one for deletions.
    pub fn field(
        &self,
        name: &str,
    ) -> Option<&Value> {
        self.new.as_ref().or(self.old.as_ref()).and_then(|v| v.get(name))
    }

    pub fn old_field(
        &self,
        name: &str,
    ) -> Option<&Value> {
        self.old.as_ref().and_then(|v| v.get(name))
    }

    /// Process instance the entity belongs to, if any.
    pub fn process_instance_id(&self) -> Option<u64> {
        match self.key.iden {
            StoreIden::ProcessInstances => Some(self.object_id),
            _ => self.field("process_instance_id").or_else(|| self.field("container_id")).and_then(|v| v.as_u64()),
        }
    }

    pub fn state(&self) -> Option<&str> {
        self.field("state").and_then(|v| v.as_str())
    }

    /// True when an update changed the `state` field.
    pub fn state_changed(&self) -> bool {
        self.key.action == EventAction::Updated && self.old_field("state") != self.field("state")
    }

    pub fn entity<T: DeserializeOwned>(&self) -> Option<T> {
        self.new.as_ref().or(self.old.as_ref()).and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

pub trait EventHandler: Send + Sync {
    fn handle(
        &self,
        event: &Event,
    ) -> Result<()>;

    /// Handlers may decline events they registered for.
    fn is_interested(
        &self,
        _event: &Event,
    ) -> bool {
        true
    }
}

impl<F> EventHandler for F
where
    F: Fn(&Event) -> Result<()> + Send + Sync,
{
    fn handle(
        &self,
        event: &Event,
    ) -> Result<()> {
        (self)(event)
    }
}
