//! Storage layer for definitions, runtime instances, archives and journals.
//!
//! The engine talks to storage only through the [`Persistence`] trait. Entities travel
//! as JSON [`Document`]s carrying a `persistence_version` for optimistic concurrency.
//! `MemPersistence` is the in-memory backend; it stages writes per transaction.

pub mod data;
mod db;
pub mod query;
mod store;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use strum::{AsRefStr, EnumIter};

use crate::{Result, TenantId};

pub use db::MemPersistence;
pub use query::{Cond, Query};
pub use store::Store;

/// Identifiers for the storage collections.
#[derive(Debug, Clone, Copy, AsRefStr, PartialEq, Hash, Eq, PartialOrd, Ord, EnumIter, Deserialize, Serialize)]
pub enum StoreIden {
    #[strum(serialize = "process_definitions")]
    ProcessDefinitions,
    #[strum(serialize = "process_instances")]
    ProcessInstances,
    #[strum(serialize = "archived_process_instances")]
    ArchivedProcessInstances,
    #[strum(serialize = "flow_node_instances")]
    FlowNodeInstances,
    #[strum(serialize = "archived_flow_node_instances")]
    ArchivedFlowNodeInstances,
    #[strum(serialize = "data_instances")]
    DataInstances,
    #[strum(serialize = "actors")]
    Actors,
    #[strum(serialize = "actor_members")]
    ActorMembers,
    #[strum(serialize = "waiting_events")]
    WaitingEvents,
    #[strum(serialize = "message_instances")]
    MessageInstances,
    #[strum(serialize = "incidents")]
    Incidents,
    #[strum(serialize = "audit_logs")]
    AuditLogs,
}

impl StoreIden {
    /// Entity type discriminator used in event keys, e.g. `PROCESSINSTANCE`.
    pub fn discriminator(&self) -> &'static str {
        match self {
            StoreIden::ProcessDefinitions => "PROCESSDEFINITION",
            StoreIden::ProcessInstances => "PROCESSINSTANCE",
            StoreIden::ArchivedProcessInstances => "ARCHIVEDPROCESSINSTANCE",
            StoreIden::FlowNodeInstances => "FLOWNODEINSTANCE",
            StoreIden::ArchivedFlowNodeInstances => "ARCHIVEDFLOWNODEINSTANCE",
            StoreIden::DataInstances => "DATAINSTANCE",
            StoreIden::Actors => "ACTOR",
            StoreIden::ActorMembers => "ACTORMEMBER",
            StoreIden::WaitingEvents => "WAITINGEVENT",
            StoreIden::MessageInstances => "MESSAGEINSTANCE",
            StoreIden::Incidents => "INCIDENT",
            StoreIden::AuditLogs => "AUDITLOG",
        }
    }
}

/// Stored form of an entity.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Document {
    pub iden: StoreIden,
    pub tenant_id: TenantId,
    pub id: u64,
    pub persistence_version: u64,
    pub body: Value,
}

impl Document {
    /// Top-level field of the body.
    pub fn field(
        &self,
        name: &str,
    ) -> Option<&Value> {
        self.body.get(name)
    }

    pub fn to_entity<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Copy of the document with `fields` merged into the body.
    pub fn merged(
        &self,
        fields: &Map<String, Value>,
    ) -> Document {
        let mut doc = self.clone();
        if let Value::Object(body) = &mut doc.body {
            for (k, v) in fields {
                body.insert(k.clone(), v.clone());
            }
        }
        doc
    }
}

/// Entities that are stored in a collection.
pub trait PersistentObject: Serialize + DeserializeOwned + Send + Sync {
    fn iden() -> StoreIden;
    fn id(&self) -> u64;
    fn tenant_id(&self) -> TenantId;

    fn to_document(&self) -> Result<Document> {
        Ok(Document {
            iden: Self::iden(),
            tenant_id: self.tenant_id(),
            id: self.id(),
            persistence_version: 0,
            body: serde_json::to_value(self)?,
        })
    }
}

/// Storage contract consumed by the engine. Every call is tenant-scoped.
pub trait Persistence: Send + Sync {
    /// Next id of the `(iden, tenant)` sequence. Sequences are not transactional.
    fn next_id(
        &self,
        iden: StoreIden,
        tenant_id: TenantId,
    ) -> Result<u64>;

    fn insert(
        &self,
        doc: Document,
    ) -> Result<Document>;

    /// Merges `fields` into the stored body and bumps the version. Returns the new document.
    fn update(
        &self,
        iden: StoreIden,
        tenant_id: TenantId,
        id: u64,
        fields: &Map<String, Value>,
    ) -> Result<Document>;

    /// Deletes and returns the removed document.
    fn delete(
        &self,
        iden: StoreIden,
        tenant_id: TenantId,
        id: u64,
    ) -> Result<Document>;

    fn select_one(
        &self,
        iden: StoreIden,
        tenant_id: TenantId,
        id: u64,
    ) -> Result<Option<Document>>;

    fn select_list(
        &self,
        iden: StoreIden,
        tenant_id: TenantId,
        query: &Query,
    ) -> Result<Vec<Document>>;

    fn count(
        &self,
        iden: StoreIden,
        tenant_id: TenantId,
        query: &Query,
    ) -> Result<usize>;

    /// Tenants owning committed documents in `iden`. Used by the recovery sweep.
    fn tenants(
        &self,
        iden: StoreIden,
    ) -> Result<Vec<TenantId>>;
}
