use chrono::Duration;
use movemate_core::pricing::VehicleClass;
use serde::Deserialize;
use uuid::Uuid;

use crate::dispatch::DispatchStage;

/// How often and how many times a matching stage fires.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct StagePolicy {
    pub limit: u32,
    pub interval_minutes: i64,
}

impl StagePolicy {
    pub fn interval(&self) -> Duration {
        Duration::minutes(self.interval_minutes)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatchPolicy {
    pub favorite_driver: StagePolicy,
    pub initial_broadcast: StagePolicy,
    pub second_broadcast: StagePolicy,
    pub idle_customer_timeout_minutes: i64,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            favorite_driver: StagePolicy { limit: 3, interval_minutes: 10 },
            initial_broadcast: StagePolicy { limit: 12, interval_minutes: 10 },
            second_broadcast: StagePolicy { limit: 6, interval_minutes: 5 },
            idle_customer_timeout_minutes: 30,
        }
    }
}

impl DispatchPolicy {
    pub fn stage(&self, stage: DispatchStage) -> StagePolicy {
        match stage {
            DispatchStage::FavoriteDriver => self.favorite_driver,
            DispatchStage::InitialBroadcast => self.initial_broadcast,
            DispatchStage::SecondBroadcast => self.second_broadcast,
        }
    }

    pub fn idle_customer_timeout(&self) -> Duration {
        Duration::minutes(self.idle_customer_timeout_minutes)
    }
}

/// Minutes-before-booking cut-offs for one vehicle class.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ClassThresholds {
    pub urgent_minutes: i64,
    pub middle_minutes: i64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CancellationPolicy {
    pub four_wheel: ClassThresholds,
    pub other: ClassThresholds,
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self {
            four_wheel: ClassThresholds { urgent_minutes: 40, middle_minutes: 120 },
            other: ClassThresholds { urgent_minutes: 90, middle_minutes: 180 },
        }
    }
}

impl CancellationPolicy {
    pub fn thresholds(&self, class: VehicleClass) -> ClassThresholds {
        match class {
            VehicleClass::FourWheel => self.four_wheel,
            VehicleClass::SixWheel | VehicleClass::TenWheel => self.other,
        }
    }
}

/// Context object handed to the orchestrator instead of process-wide constants.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LifecyclePolicy {
    /// Account that owns operator-side transactions and system actions.
    pub operator_account_id: Uuid,
    pub dispatch: DispatchPolicy,
    pub cancellation: CancellationPolicy,
    /// Withholding tax rate applied to business-customer refunds.
    pub wht_percent: u32,
    pub overdue_ban_days: i64,
    pub due_soon_days: i64,
    pub credit_term_days: i64,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            operator_account_id: Uuid::nil(),
            dispatch: DispatchPolicy::default(),
            cancellation: CancellationPolicy::default(),
            wht_percent: 1,
            overdue_ban_days: 16,
            due_soon_days: 3,
            credit_term_days: 30,
        }
    }
}
