use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::warn;

use crate::{
    common::Shutdown,
    events::{Event, EventAction},
    runtime::Channel,
    store::{Persistence, PersistentObject, StoreIden, data::AuditLog},
    utils,
};

/// Persists one audit row per state change of a process or flow node instance.
///
/// Rows are written from committed events, outside of any transaction, so the audit
/// trail never holds back a transition.
pub struct AuditTrail {
    persistence: Arc<dyn Persistence>,
    channel: Arc<Channel>,

    handle: Handle,
    shutdown: Arc<Shutdown>,
}

impl AuditTrail {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        channel: Arc<Channel>,
        handle: Handle,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            persistence,
            channel,
            handle,
            shutdown,
        }
    }

    pub fn monitor(&self) {
        let persistence = self.persistence.clone();
        let shutdown = self.shutdown.clone();
        let mut event_queue = self.channel.event_queue().subscribe();

        self.handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    Ok(event) = event_queue.recv() => {
                        let Some(entry) = audit_entry(&event) else {
                            continue;
                        };
                        let stored = persistence.next_id(StoreIden::AuditLogs, event.tenant_id).and_then(|id| {
                            let entry = AuditLog {
                                id,
                                ..entry
                            };
                            persistence.insert(entry.to_document()?)
                        });
                        if let Err(e) = stored {
                            warn!(event = %event.key, object_id = event.object_id, error = %e, "failed to write audit log");
                        }
                    }
                }
            }
        });
    }
}

fn audit_entry(event: &Event) -> Option<AuditLog> {
    if !matches!(event.key.iden, StoreIden::ProcessInstances | StoreIden::FlowNodeInstances) {
        return None;
    }
    let relevant = match event.key.action {
        EventAction::Created => true,
        EventAction::Updated => event.state_changed(),
        EventAction::Deleted => false,
    };
    if !relevant {
        return None;
    }
    Some(AuditLog {
        id: 0,
        tenant_id: event.tenant_id,
        event_key: event.key.to_string(),
        object_id: event.object_id,
        process_instance_id: event.process_instance_id(),
        state: event.state().map(str::to_string),
        timestamp: utils::time::time_millis(),
    })
}
