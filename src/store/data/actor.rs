use serde::{Deserialize, Serialize};

use crate::{
    TenantId, UserId,
    store::{PersistentObject, StoreIden},
};

/// Named role of one process definition.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Actor {
    pub id: u64,
    pub tenant_id: TenantId,
    pub definition_id: u64,
    pub name: String,
    pub description: String,
}

impl PersistentObject for Actor {
    fn iden() -> StoreIden {
        StoreIden::Actors
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "member_type", rename_all = "snake_case")]
pub enum ActorMemberKind {
    User {
        user_id: UserId,
    },
    Group {
        group_id: u64,
    },
    Role {
        role_id: u64,
    },
    Membership {
        group_id: u64,
        role_id: u64,
    },
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ActorMember {
    pub id: u64,
    pub tenant_id: TenantId,
    pub actor_id: u64,
    #[serde(flatten)]
    pub member: ActorMemberKind,
}

impl PersistentObject for ActorMember {
    fn iden() -> StoreIden {
        StoreIden::ActorMembers
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
