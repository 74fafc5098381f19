use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CoreResult;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriverContact {
    pub driver_id: Uuid,
    pub fcm_token: Option<String>,
}

/// Lookup of drivers who can currently take work.
#[async_trait]
pub trait DriverDirectory: Send + Sync {
    /// Drivers serving `vehicle_type_id` who are online and not on a job.
    async fn available_drivers(&self, vehicle_type_id: &str) -> CoreResult<Vec<DriverContact>>;

    /// The driver if they are currently available, `None` otherwise.
    async fn find_available(&self, driver_id: Uuid) -> CoreResult<Option<DriverContact>>;
}
