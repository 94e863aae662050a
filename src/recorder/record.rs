use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    Result, TenantId,
    store::{Document, PersistentObject, StoreIden},
};

pub struct InsertRecord {
    pub doc: Document,
}

impl InsertRecord {
    pub fn of<T: PersistentObject>(entity: &T) -> Result<Self> {
        Ok(Self {
            doc: entity.to_document()?,
        })
    }
}

/// Partial update: only the listed fields are written.
pub struct UpdateRecord {
    pub iden: StoreIden,
    pub tenant_id: TenantId,
    pub id: u64,
    pub fields: Map<String, Value>,
}

impl UpdateRecord {
    pub fn of<T: PersistentObject>(
        tenant_id: TenantId,
        id: u64,
    ) -> Self {
        Self {
            iden: T::iden(),
            tenant_id,
            id,
            fields: Map::new(),
        }
    }

    /// Update that rewrites every field of `entity`.
    pub fn from_entity<T: PersistentObject>(entity: &T) -> Result<Self> {
        let fields = match serde_json::to_value(entity)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Self {
            iden: T::iden(),
            tenant_id: entity.tenant_id(),
            id: entity.id(),
            fields,
        })
    }

    pub fn set<V: Serialize>(
        mut self,
        name: &str,
        value: V,
    ) -> Result<Self> {
        self.fields.insert(name.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn fields(
        mut self,
        fields: Map<String, Value>,
    ) -> Self {
        self.fields.extend(fields);
        self
    }
}

pub struct DeleteRecord {
    pub iden: StoreIden,
    pub tenant_id: TenantId,
    pub id: u64,
}

impl DeleteRecord {
    pub fn of<T: PersistentObject>(
        tenant_id: TenantId,
        id: u64,
    ) -> Self {
        Self {
            iden: T::iden(),
            tenant_id,
            id,
        }
    }
}

macro_rules! typed_event {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $name {
            pub iden: StoreIden,
        }

        impl $name {
            pub fn new(iden: StoreIden) -> Self {
                Self {
                    iden,
                }
            }

            pub fn of<T: PersistentObject>() -> Self {
                Self::new(T::iden())
            }
        }
    };
}

typed_event!(InsertEvent);
typed_event!(UpdateEvent);
typed_event!(DeleteEvent);
