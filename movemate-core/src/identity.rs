use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Customer,
    Driver,
    Admin,
    /// Jobs and sweeps acting on their own behalf.
    System,
}

/// Who triggered a handler. Supplied by the identity/session layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }

    /// The operator account acting for scheduled work.
    pub fn system(operator_account_id: Uuid) -> Self {
        Self { user_id: operator_account_id, role: Role::System }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin | Role::System)
    }
}
