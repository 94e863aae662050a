mod collect;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::{
    ProcflowError, Result, TenantId,
    store::{Document, Persistence, Query, StoreIden},
    transaction::{TransactionResource, TransactionService},
};
pub use collect::Collect;

type DocKey = (StoreIden, TenantId, u64);

#[derive(Debug, Clone)]
struct Staged {
    /// Committed version the write was based on; `None` when the document did not exist.
    expected: Option<u64>,
    /// `None` stages a delete.
    doc: Option<Document>,
}

#[derive(Debug, Default)]
struct WriteSet {
    ops: BTreeMap<DocKey, Staged>,
}

#[derive(Default)]
struct MemInner {
    collections: RwLock<HashMap<StoreIden, Collect>>,
    sequences: Mutex<HashMap<(StoreIden, TenantId), u64>>,
    staged: Mutex<HashMap<u64, WriteSet>>,
}

impl MemInner {
    fn committed(
        &self,
        key: &DocKey,
    ) -> Option<Document> {
        let collections = self.collections.read();
        collections.get(&key.0).and_then(|c| c.get(key.1, key.2)).cloned()
    }

    fn validate(
        collections: &HashMap<StoreIden, Collect>,
        ws: &WriteSet,
    ) -> Result<()> {
        for ((iden, tenant_id, id), staged) in ws.ops.iter() {
            let current = collections.get(iden).and_then(|c| c.get(*tenant_id, *id)).map(|d| d.persistence_version);
            if current != staged.expected {
                return Err(ProcflowError::retryable_persistence(format!(
                    "concurrent modification of {}:{} (expected version {:?}, found {:?})",
                    iden.as_ref(),
                    id,
                    staged.expected,
                    current
                )));
            }
        }
        Ok(())
    }

    fn apply(
        collections: &mut HashMap<StoreIden, Collect>,
        ops: BTreeMap<DocKey, Staged>,
    ) {
        for ((iden, tenant_id, id), staged) in ops.into_iter() {
            let collect = collections.entry(iden).or_default();
            match staged.doc {
                Some(doc) => collect.put(doc),
                None => {
                    collect.remove(tenant_id, id);
                }
            }
        }
    }
}

impl TransactionResource for MemInner {
    fn prepare(
        &self,
        tx_id: u64,
    ) -> Result<()> {
        let staged = self.staged.lock();
        match staged.get(&tx_id) {
            Some(ws) => Self::validate(&self.collections.read(), ws),
            None => Ok(()),
        }
    }

    fn commit(
        &self,
        tx_id: u64,
    ) -> Result<()> {
        let Some(ws) = self.staged.lock().remove(&tx_id) else {
            return Ok(());
        };
        let mut collections = self.collections.write();
        Self::validate(&collections, &ws)?;
        let writes = ws.ops.len();
        Self::apply(&mut collections, ws.ops);
        debug!(tx_id, writes, "mem persistence committed");
        Ok(())
    }

    fn rollback(
        &self,
        tx_id: u64,
    ) {
        if let Some(ws) = self.staged.lock().remove(&tx_id) {
            trace!(tx_id, writes = ws.ops.len(), "mem persistence discarded staged writes");
        }
    }
}

/// In-memory persistence. Inside a transaction, writes are staged and applied
/// atomically at commit after an optimistic version check; outside one they apply
/// immediately.
#[derive(Clone)]
pub struct MemPersistence {
    inner: Arc<MemInner>,
    txs: Arc<TransactionService>,
}

impl MemPersistence {
    pub fn new(txs: Arc<TransactionService>) -> Self {
        Self {
            inner: Arc::new(MemInner::default()),
            txs,
        }
    }

    /// Id of the calling thread's transaction, enlisting this store into it.
    fn enlist(&self) -> Result<Option<u64>> {
        if !self.txs.is_transaction_active() {
            return Ok(None);
        }
        let resource: Arc<dyn TransactionResource> = self.inner.clone();
        Ok(Some(self.txs.enlist_resource(resource)?))
    }

    /// Visible document and the version a write on it is based on.
    fn visible(
        &self,
        key: &DocKey,
    ) -> (Option<Document>, Option<u64>) {
        if let Some(tx_id) = self.txs.current_transaction_id() {
            let staged = self.inner.staged.lock();
            if let Some(op) = staged.get(&tx_id).and_then(|ws| ws.ops.get(key)) {
                return (op.doc.clone(), op.expected);
            }
        }
        let committed = self.inner.committed(key);
        let version = committed.as_ref().map(|d| d.persistence_version);
        (committed, version)
    }

    fn write(
        &self,
        key: DocKey,
        expected: Option<u64>,
        doc: Option<Document>,
    ) -> Result<()> {
        match self.enlist()? {
            Some(tx_id) => {
                let mut staged = self.inner.staged.lock();
                staged.entry(tx_id).or_default().ops.insert(
                    key,
                    Staged {
                        expected,
                        doc,
                    },
                );
            }
            None => {
                let mut ops = BTreeMap::new();
                ops.insert(
                    key,
                    Staged {
                        expected,
                        doc,
                    },
                );
                let ws = WriteSet {
                    ops,
                };
                let mut collections = self.inner.collections.write();
                MemInner::validate(&collections, &ws)?;
                MemInner::apply(&mut collections, ws.ops);
            }
        }
        Ok(())
    }

    fn visible_list(
        &self,
        iden: StoreIden,
        tenant_id: TenantId,
    ) -> Vec<Document> {
        let mut docs: BTreeMap<u64, Document> = {
            let collections = self.inner.collections.read();
            collections.get(&iden).map(|c| c.tenant_docs(tenant_id).map(|d| (d.id, d.clone())).collect()).unwrap_or_default()
        };
        if let Some(tx_id) = self.txs.current_transaction_id() {
            let staged = self.inner.staged.lock();
            if let Some(ws) = staged.get(&tx_id) {
                for ((op_iden, op_tenant, id), op) in ws.ops.iter() {
                    if *op_iden != iden || *op_tenant != tenant_id {
                        continue;
                    }
                    match &op.doc {
                        Some(doc) => {
                            docs.insert(*id, doc.clone());
                        }
                        None => {
                            docs.remove(id);
                        }
                    }
                }
            }
        }
        docs.into_values().collect()
    }

    /// Committed document count of a collection, all tenants.
    pub fn committed_len(
        &self,
        iden: StoreIden,
    ) -> usize {
        self.inner.collections.read().get(&iden).map(|c| c.len()).unwrap_or(0)
    }
}

impl Persistence for MemPersistence {
    fn next_id(
        &self,
        iden: StoreIden,
        tenant_id: TenantId,
    ) -> Result<u64> {
        let mut sequences = self.inner.sequences.lock();
        let seq = sequences.entry((iden, tenant_id)).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }

    fn insert(
        &self,
        mut doc: Document,
    ) -> Result<Document> {
        let key = (doc.iden, doc.tenant_id, doc.id);
        let (current, expected) = self.visible(&key);
        if current.is_some() {
            return Err(ProcflowError::persistence(format!("{}:{} already exists", doc.iden.as_ref(), doc.id)));
        }
        doc.persistence_version = expected.map(|v| v + 1).unwrap_or(1);
        self.write(key, expected, Some(doc.clone()))?;
        Ok(doc)
    }

    fn update(
        &self,
        iden: StoreIden,
        tenant_id: TenantId,
        id: u64,
        fields: &Map<String, Value>,
    ) -> Result<Document> {
        let key = (iden, tenant_id, id);
        let (current, expected) = self.visible(&key);
        let Some(current) = current else {
            return Err(ProcflowError::NotFound(format!("{}:{} not found", iden.as_ref(), id)));
        };
        let mut doc = current.merged(fields);
        doc.persistence_version = current.persistence_version + 1;
        self.write(key, expected, Some(doc.clone()))?;
        Ok(doc)
    }

    fn delete(
        &self,
        iden: StoreIden,
        tenant_id: TenantId,
        id: u64,
    ) -> Result<Document> {
        let key = (iden, tenant_id, id);
        let (current, expected) = self.visible(&key);
        let Some(current) = current else {
            return Err(ProcflowError::NotFound(format!("{}:{} not found", iden.as_ref(), id)));
        };
        self.write(key, expected, None)?;
        Ok(current)
    }

    fn select_one(
        &self,
        iden: StoreIden,
        tenant_id: TenantId,
        id: u64,
    ) -> Result<Option<Document>> {
        Ok(self.visible(&(iden, tenant_id, id)).0)
    }

    fn select_list(
        &self,
        iden: StoreIden,
        tenant_id: TenantId,
        query: &Query,
    ) -> Result<Vec<Document>> {
        Ok(query.apply(self.visible_list(iden, tenant_id)))
    }

    fn count(
        &self,
        iden: StoreIden,
        tenant_id: TenantId,
        query: &Query,
    ) -> Result<usize> {
        Ok(query.count(self.visible_list(iden, tenant_id)))
    }

    fn tenants(
        &self,
        iden: StoreIden,
    ) -> Result<Vec<TenantId>> {
        Ok(self.inner.collections.read().get(&iden).map(|c| c.tenants()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use serde_json::json;

    use super::*;

    fn setup() -> (Arc<TransactionService>, MemPersistence) {
        let txs = Arc::new(TransactionService::new());
        let store = MemPersistence::new(txs.clone());
        (txs, store)
    }

    fn doc(
        id: u64,
        body: Value,
    ) -> Document {
        Document {
            iden: StoreIden::ProcessInstances,
            tenant_id: 1,
            id,
            persistence_version: 0,
            body,
        }
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_staged_writes_visible_only_to_own_transaction() {
        let (txs, store) = setup();
        let store = Arc::new(store);
        txs.begin().unwrap();
        store.insert(doc(1, json!({ "state": "started" }))).unwrap();
        assert!(store.select_one(StoreIden::ProcessInstances, 1, 1).unwrap().is_some());
        assert_eq!(store.count(StoreIden::ProcessInstances, 1, &Query::new()).unwrap(), 1);

        let seen = {
            let store = store.clone();
            thread::spawn(move || store.select_one(StoreIden::ProcessInstances, 1, 1).unwrap().is_some()).join().unwrap()
        };
        assert!(!seen);

        txs.complete().unwrap();
        let committed = store.select_one(StoreIden::ProcessInstances, 1, 1).unwrap().unwrap();
        assert_eq!(committed.persistence_version, 1);
    }

    #[test]
    fn test_rollback_discards_every_write() {
        let (txs, store) = setup();
        store.insert(doc(1, json!({ "state": "started" }))).unwrap();

        let result: Result<()> = txs.execute_in_transaction(|| {
            store.update(StoreIden::ProcessInstances, 1, 1, &fields(json!({ "state": "completed" })))?;
            store.insert(doc(2, json!({ "state": "started" })))?;
            store.delete(StoreIden::ProcessInstances, 1, 1)?;
            assert!(store.select_one(StoreIden::ProcessInstances, 1, 1)?.is_none());
            Err(ProcflowError::Execution("abort".into()))
        });
        assert!(result.is_err());

        let first = store.select_one(StoreIden::ProcessInstances, 1, 1).unwrap().unwrap();
        assert_eq!(first.body["state"], json!("started"));
        assert!(store.select_one(StoreIden::ProcessInstances, 1, 2).unwrap().is_none());
    }

    #[test]
    fn test_update_merges_fields_and_bumps_version() {
        let (txs, store) = setup();
        store.insert(doc(1, json!({ "state": "started", "name": "p" }))).unwrap();
        let updated = txs
            .execute_in_transaction(|| {
                store.update(StoreIden::ProcessInstances, 1, 1, &fields(json!({ "state": "a" })))?;
                store.update(StoreIden::ProcessInstances, 1, 1, &fields(json!({ "state": "b" })))
            })
            .unwrap();
        assert_eq!(updated.persistence_version, 3);
        assert_eq!(updated.body, json!({ "state": "b", "name": "p" }));
        assert!(matches!(
            store.update(StoreIden::ProcessInstances, 1, 9, &Map::new()),
            Err(ProcflowError::NotFound(_))
        ));
    }

    #[test]
    fn test_conflicting_commit_is_retryable_and_applies_nothing() {
        let (txs, store) = setup();
        let store = Arc::new(store);
        store.insert(doc(1, json!({ "state": "started" }))).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let other = {
            let txs = txs.clone();
            let store = store.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                txs.execute_in_transaction(|| {
                    store.update(StoreIden::ProcessInstances, 1, 1, &fields(json!({ "state": "from-other" })))?;
                    barrier.wait();
                    barrier.wait();
                    Ok(())
                })
            })
        };

        barrier.wait();
        let err = txs
            .execute_in_transaction(|| {
                store.insert(doc(2, json!({ "state": "new" })))?;
                store.update(StoreIden::ProcessInstances, 1, 1, &fields(json!({ "state": "mine" })))?;
                // let the other transaction commit first
                barrier.wait();
                while txs.number_of_active_transactions() > 1 {
                    thread::yield_now();
                }
                Ok(())
            })
            .unwrap_err();
        other.join().unwrap().unwrap();

        assert!(err.is_retryable());
        let current = store.select_one(StoreIden::ProcessInstances, 1, 1).unwrap().unwrap();
        assert_eq!(current.body["state"], json!("from-other"));
        assert!(store.select_one(StoreIden::ProcessInstances, 1, 2).unwrap().is_none());
    }

    #[test]
    fn test_sequences_are_per_tenant_and_collection() {
        let (_, store) = setup();
        assert_eq!(store.next_id(StoreIden::ProcessInstances, 1).unwrap(), 1);
        assert_eq!(store.next_id(StoreIden::ProcessInstances, 1).unwrap(), 2);
        assert_eq!(store.next_id(StoreIden::ProcessInstances, 2).unwrap(), 1);
        assert_eq!(store.next_id(StoreIden::FlowNodeInstances, 1).unwrap(), 1);
    }

    #[test]
    fn test_tenants_lists_committed_owners() {
        let (_, store) = setup();
        let mut other = doc(1, json!({}));
        other.tenant_id = 7;
        store.insert(other).unwrap();
        store.insert(doc(1, json!({}))).unwrap();
        store.insert(doc(2, json!({}))).unwrap();
        assert_eq!(store.tenants(StoreIden::ProcessInstances).unwrap(), vec![1, 7]);
        assert!(store.tenants(StoreIden::Incidents).unwrap().is_empty());
    }
}
