use std::collections::BTreeMap;

use crate::{TenantId, store::Document};

/// Committed documents of one collection, ordered by tenant then id.
#[derive(Debug, Default)]
pub struct Collect {
    docs: BTreeMap<(TenantId, u64), Document>,
}

impl Collect {
    pub fn get(
        &self,
        tenant_id: TenantId,
        id: u64,
    ) -> Option<&Document> {
        self.docs.get(&(tenant_id, id))
    }

    pub fn put(
        &mut self,
        doc: Document,
    ) {
        self.docs.insert((doc.tenant_id, doc.id), doc);
    }

    pub fn remove(
        &mut self,
        tenant_id: TenantId,
        id: u64,
    ) -> Option<Document> {
        self.docs.remove(&(tenant_id, id))
    }

    pub fn tenant_docs(
        &self,
        tenant_id: TenantId,
    ) -> impl Iterator<Item = &Document> {
        self.docs.range((tenant_id, 0)..=(tenant_id, u64::MAX)).map(|(_, d)| d)
    }

    /// Distinct tenants, ascending.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.docs.keys().map(|(tenant_id, _)| *tenant_id).collect();
        tenants.dedup();
        tenants
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }
}
