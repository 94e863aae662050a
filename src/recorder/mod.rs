//! Pairs every persistence mutation with its domain event inside the active transaction.

mod record;

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::trace;

pub use record::{DeleteEvent, DeleteRecord, InsertEvent, InsertRecord, UpdateEvent, UpdateRecord};

use crate::{
    ProcflowError, Result, TenantId,
    common::BroadcastQueue,
    events::{Event, EventAction, EventService, EventTypeKey},
    store::{Document, Persistence, PersistentObject},
    transaction::{Synchronization, TransactionService},
    utils,
};

type Pending = Arc<Mutex<HashMap<u64, Vec<Event>>>>;

pub struct Recorder {
    persistence: Arc<dyn Persistence>,
    events: Arc<EventService>,
    txs: Arc<TransactionService>,
    publisher: Arc<BroadcastQueue<Event>>,
    pending: Pending,
}

/// Publishes the events of one transaction once it committed.
struct PublishOnCommit {
    tx_id: u64,
    pending: Pending,
    publisher: Arc<BroadcastQueue<Event>>,
}

impl Synchronization for PublishOnCommit {
    fn after_completion(
        &mut self,
        committed: bool,
    ) {
        let events = self.pending.lock().remove(&self.tx_id).unwrap_or_default();
        if !committed {
            return;
        }
        for event in events {
            self.publisher.send(event);
        }
    }
}

impl Recorder {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        events: Arc<EventService>,
        txs: Arc<TransactionService>,
        publisher: Arc<BroadcastQueue<Event>>,
    ) -> Self {
        Self {
            persistence,
            events,
            txs,
            publisher,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn require_transaction(&self) -> Result<u64> {
        self.txs.current_transaction_id().ok_or_else(|| ProcflowError::Transaction("the recorder requires an active transaction".to_string()))
    }

    fn dispatch(
        &self,
        tx_id: u64,
        event: Event,
    ) -> Result<()> {
        self.events.fire(&event)?;

        let first = {
            let mut pending = self.pending.lock();
            let events = pending.entry(tx_id).or_default();
            events.push(event);
            events.len() == 1
        };
        if first {
            self.txs.register_synchronization(Box::new(PublishOnCommit {
                tx_id,
                pending: self.pending.clone(),
                publisher: self.publisher.clone(),
            }))?;
        }
        Ok(())
    }

    pub fn record_insert(
        &self,
        record: InsertRecord,
        event: Option<InsertEvent>,
    ) -> Result<Document> {
        let tx_id = self.require_transaction()?;
        let doc = self.persistence.insert(record.doc)?;
        trace!(tx_id, iden = doc.iden.as_ref(), id = doc.id, "record insert");
        if let Some(event) = event {
            self.dispatch(
                tx_id,
                Event {
                    key: EventTypeKey::new(event.iden, EventAction::Created),
                    tenant_id: doc.tenant_id,
                    object_id: doc.id,
                    old: None,
                    new: Some(doc.body.clone()),
                    timestamp: utils::time::time_millis(),
                },
            )?;
        }
        Ok(doc)
    }

    pub fn record_update(
        &self,
        record: UpdateRecord,
        event: Option<UpdateEvent>,
    ) -> Result<Document> {
        let tx_id = self.require_transaction()?;
        let old = self.persistence.select_one(record.iden, record.tenant_id, record.id)?;
        let doc = self.persistence.update(record.iden, record.tenant_id, record.id, &record.fields)?;
        trace!(tx_id, iden = doc.iden.as_ref(), id = doc.id, version = doc.persistence_version, "record update");
        if let Some(event) = event {
            self.dispatch(
                tx_id,
                Event {
                    key: EventTypeKey::new(event.iden, EventAction::Updated),
                    tenant_id: doc.tenant_id,
                    object_id: doc.id,
                    old: old.map(|d| d.body),
                    new: Some(doc.body.clone()),
                    timestamp: utils::time::time_millis(),
                },
            )?;
        }
        Ok(doc)
    }

    pub fn record_delete(
        &self,
        record: DeleteRecord,
        event: Option<DeleteEvent>,
    ) -> Result<Document> {
        let tx_id = self.require_transaction()?;
        let doc = self.persistence.delete(record.iden, record.tenant_id, record.id)?;
        trace!(tx_id, iden = doc.iden.as_ref(), id = doc.id, "record delete");
        if let Some(event) = event {
            self.dispatch(
                tx_id,
                Event {
                    key: EventTypeKey::new(event.iden, EventAction::Deleted),
                    tenant_id: doc.tenant_id,
                    object_id: doc.id,
                    old: Some(doc.body.clone()),
                    new: None,
                    timestamp: utils::time::time_millis(),
                },
            )?;
        }
        Ok(doc)
    }

    /// Inserts `entity` and fires its `_CREATED` event.
    pub fn insert<T: PersistentObject>(
        &self,
        entity: &T,
    ) -> Result<()> {
        self.record_insert(InsertRecord::of(entity)?, Some(InsertEvent::of::<T>()))?;
        Ok(())
    }

    /// Updates fields of a `T` and fires its `_UPDATED` event. Returns the new entity.
    pub fn update<T: PersistentObject>(
        &self,
        tenant_id: TenantId,
        id: u64,
        fields: Map<String, Value>,
    ) -> Result<T> {
        let doc = self.record_update(UpdateRecord::of::<T>(tenant_id, id).fields(fields), Some(UpdateEvent::of::<T>()))?;
        doc.to_entity()
    }

    /// Replaces every field of `entity` and fires its `_UPDATED` event.
    pub fn update_entity<T: PersistentObject>(
        &self,
        entity: &T,
    ) -> Result<()> {
        self.record_update(UpdateRecord::from_entity(entity)?, Some(UpdateEvent::of::<T>()))?;
        Ok(())
    }

    pub fn delete<T: PersistentObject>(
        &self,
        tenant_id: TenantId,
        id: u64,
    ) -> Result<()> {
        self.record_delete(DeleteRecord::of::<T>(tenant_id, id), Some(DeleteEvent::of::<T>()))?;
        Ok(())
    }
}
