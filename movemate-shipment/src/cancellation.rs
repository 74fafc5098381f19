use movemate_core::pricing::VehicleClass;
use serde::{Deserialize, Serialize};

use crate::models::DriverAcceptanceStatus;
use crate::policy::CancellationPolicy;

// ============================================================================
// Cancellation Policy Engine
// ============================================================================
//
// Pure fee split. Charges are taken from the outstanding amounts of the
// active quotation, so earlier partial payments are already netted out.
//
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeTier {
    FullCustomerRefund,
    HalfCustomerRefund,
    FullCharge,
}

impl FeeTier {
    pub fn charge_percent(&self) -> u8 {
        match self {
            FeeTier::FullCustomerRefund => 0,
            FeeTier::HalfCustomerRefund => 50,
            FeeTier::FullCharge => 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeInput {
    pub vehicle_class: VehicleClass,
    pub minutes_to_booking: i64,
    pub pickup_done: bool,
    pub driver_assigned: bool,
    pub acceptance: DriverAcceptanceStatus,
    pub outstanding_price: i64,
    pub outstanding_cost: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CancellationFee {
    pub tier: FeeTier,
    /// Kept by the operator.
    pub for_operator: i64,
    /// Returned to the customer.
    pub for_customer: i64,
    /// Compensation owed to the assigned driver, from the cost side.
    pub for_driver: i64,
}

impl CancellationFee {
    pub fn is_charged(&self) -> bool {
        self.for_operator > 0
    }
}

pub fn classify(policy: &CancellationPolicy, input: &FeeInput) -> FeeTier {
    let unmatched = matches!(
        input.acceptance,
        DriverAcceptanceStatus::Idle | DriverAcceptanceStatus::Pending | DriverAcceptanceStatus::Uninterested
    );
    if !input.driver_assigned && unmatched {
        return FeeTier::FullCustomerRefund;
    }
    if input.pickup_done {
        return FeeTier::FullCharge;
    }

    let thresholds = policy.thresholds(input.vehicle_class);
    if input.minutes_to_booking <= thresholds.urgent_minutes {
        FeeTier::FullCharge
    } else if input.minutes_to_booking <= thresholds.middle_minutes {
        FeeTier::HalfCustomerRefund
    } else {
        FeeTier::FullCustomerRefund
    }
}

/// Split the outstanding amounts between customer, operator and driver.
pub fn compute_fee(policy: &CancellationPolicy, input: &FeeInput) -> CancellationFee {
    let tier = classify(policy, input);
    let price = input.outstanding_price.max(0);
    let cost = input.outstanding_cost.max(0);

    let (for_customer, for_operator) = match tier {
        FeeTier::FullCustomerRefund => (price, 0),
        // odd amounts round in the operator's favour
        FeeTier::HalfCustomerRefund => (price / 2, price - price / 2),
        FeeTier::FullCharge => (0, price),
    };

    let for_driver = if input.driver_assigned {
        match tier {
            FeeTier::FullCustomerRefund => 0,
            FeeTier::HalfCustomerRefund => cost - cost / 2,
            FeeTier::FullCharge => cost,
        }
    } else {
        0
    };

    CancellationFee {
        tier,
        for_operator,
        for_customer,
        for_driver,
    }
}

/// Withheld tax to add back onto a business refund: `amount * wht / (100 - wht)`.
pub fn wht_gross_up(amount: i64, wht_percent: u32) -> i64 {
    if amount <= 0 || wht_percent == 0 || wht_percent >= 100 {
        return 0;
    }
    amount * i64::from(wht_percent) / (100 - i64::from(wht_percent))
}
