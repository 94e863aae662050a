use std::sync::Arc;

use crate::{ProcflowError, Result, TenantId};

use super::{Persistence, PersistentObject, Query};

/// Typed read facade over a [`Persistence`] backend. Writes go through the recorder.
#[derive(Clone)]
pub struct Store {
    persistence: Arc<dyn Persistence>,
}

impl Store {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
        }
    }

    pub fn persistence(&self) -> Arc<dyn Persistence> {
        self.persistence.clone()
    }

    pub fn next_id<T: PersistentObject>(
        &self,
        tenant_id: TenantId,
    ) -> Result<u64> {
        self.persistence.next_id(T::iden(), tenant_id)
    }

    pub fn find<T: PersistentObject>(
        &self,
        tenant_id: TenantId,
        id: u64,
    ) -> Result<Option<T>> {
        match self.persistence.select_one(T::iden(), tenant_id, id)? {
            Some(doc) => Ok(Some(doc.to_entity()?)),
            None => Ok(None),
        }
    }

    pub fn get<T: PersistentObject>(
        &self,
        tenant_id: TenantId,
        id: u64,
    ) -> Result<T> {
        self.find(tenant_id, id)?.ok_or_else(|| ProcflowError::NotFound(format!("{} {} not found in tenant {}", T::iden().as_ref(), id, tenant_id)))
    }

    pub fn list<T: PersistentObject>(
        &self,
        tenant_id: TenantId,
        query: &Query,
    ) -> Result<Vec<T>> {
        self.persistence.select_list(T::iden(), tenant_id, query)?.iter().map(|doc| doc.to_entity()).collect()
    }

    pub fn first<T: PersistentObject>(
        &self,
        tenant_id: TenantId,
        query: &Query,
    ) -> Result<Option<T>> {
        Ok(self.list(tenant_id, &query.clone().limit(1))?.into_iter().next())
    }

    pub fn count<T: PersistentObject>(
        &self,
        tenant_id: TenantId,
        query: &Query,
    ) -> Result<usize> {
        self.persistence.count(T::iden(), tenant_id, query)
    }
}
