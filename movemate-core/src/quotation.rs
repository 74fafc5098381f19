use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Quotation Snapshots
// ============================================================================
//
// Amounts are integer minor units (satang). A quotation is never edited; a
// re-price appends a new one and the latest by `created_at` is active.
//
// ============================================================================

/// What the customer pays.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Price {
    pub sub_total: i64,
    pub tax: i64,
    pub total: i64,
    /// Amount still owed for this quotation after prior partial payments.
    pub acture_price: i64,
    pub droppoint: i64,
    pub rounded: i64,
    pub rounded_percent: i64,
}

/// What the driver/partner is paid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cost {
    pub sub_total: i64,
    pub tax: i64,
    pub total: i64,
    pub acture_price: i64,
    pub droppoint: i64,
    pub rounded: i64,
    pub rounded_percent: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Quotation {
    pub id: Uuid,
    pub price: Price,
    pub cost: Cost,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Quotation {
    pub fn new(price: Price, cost: Cost, detail: serde_json::Value, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            price,
            cost,
            detail,
            created_at,
        }
    }

    /// Price still outstanding, the base for cancellation charges and refunds.
    pub fn outstanding_price(&self) -> i64 {
        self.price.acture_price.max(0)
    }

    pub fn outstanding_cost(&self) -> i64 {
        self.cost.acture_price.max(0)
    }

    /// Operator margin on this quotation.
    pub fn margin(&self) -> i64 {
        self.price.total - self.cost.total
    }
}

impl Price {
    /// A price with nothing previously settled.
    pub fn fresh(sub_total: i64, tax: i64, droppoint: i64) -> Self {
        let total = sub_total + tax;
        Self {
            sub_total,
            tax,
            total,
            acture_price: total,
            droppoint,
            rounded: 0,
            rounded_percent: 0,
        }
    }
}

impl Cost {
    pub fn fresh(sub_total: i64, tax: i64, droppoint: i64) -> Self {
        let total = sub_total + tax;
        Self {
            sub_total,
            tax,
            total,
            acture_price: total,
            droppoint,
            rounded: 0,
            rounded_percent: 0,
        }
    }
}
