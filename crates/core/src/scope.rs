use core::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{TenantId, UserId};

/// Tenant used when an event carries no tenant id.
pub const DEFAULT_TENANT: &str = "default";

/// Key identifying one user's conversation (`tenantId:userId`).
///
/// Per-user coordination state (pending batches, in-flight supersession
/// records) is keyed by this value so that equal user ids in different tenants
/// never share state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    tenant_id: Option<TenantId>,
    user_id: UserId,
}

impl ConversationKey {
    pub fn new(tenant_id: Option<TenantId>, user_id: UserId) -> Self {
        Self { tenant_id, user_id }
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tenant = self
            .tenant_id
            .as_ref()
            .map(TenantId::as_str)
            .unwrap_or(DEFAULT_TENANT);
        write!(f, "{}:{}", tenant, self.user_id)
    }
}

/// Helper trait for messages that belong to one user's conversation.
///
/// Infrastructure components (batching, supersession) use it to find the
/// per-user state a message should be coordinated with.
pub trait Conversational {
    fn conversation_key(&self) -> ConversationKey;
}
