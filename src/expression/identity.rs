use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{TenantId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Membership {
    pub group_id: u64,
    pub role_id: u64,
}

/// Identity lookups needed to resolve who may act on a user task.
pub trait IdentityService: Send + Sync {
    fn user_exists(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> bool;

    fn memberships(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> Vec<Membership>;
}

#[derive(Default)]
pub struct MemIdentityService {
    users: RwLock<HashMap<(TenantId, UserId), HashSet<Membership>>>,
}

impl MemIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) {
        self.users.write().entry((tenant_id, user_id)).or_default();
    }

    pub fn add_membership(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        group_id: u64,
        role_id: u64,
    ) {
        self.users.write().entry((tenant_id, user_id)).or_default().insert(Membership {
            group_id,
            role_id,
        });
    }
}

impl IdentityService for MemIdentityService {
    fn user_exists(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> bool {
        self.users.read().contains_key(&(tenant_id, user_id))
    }

    fn memberships(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> Vec<Membership> {
        self.users.read().get(&(tenant_id, user_id)).map(|m| m.iter().copied().collect()).unwrap_or_default()
    }
}
