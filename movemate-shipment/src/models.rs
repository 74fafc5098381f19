use chrono::{DateTime, Utc};
use movemate_core::pricing::{Location, VehicleType};
use movemate_core::{Actor, Quotation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cancellation::CancellationFee;
use crate::dispatch::DispatchStage;
use crate::ledger::{StepLedger, TemplateShape};
use crate::step::{StepKind, StepStatus};

/// Additional service that adds the proof-of-delivery step pair.
pub const POD_SERVICE: &str = "POD";

/// Shipment status in the lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShipmentStatus {
    Idle,
    Progressing,
    Delivered,
    Cancelled,
    Refund,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverAcceptanceStatus {
    Idle,
    Pending,
    Accepted,
    Uninterested,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminAcceptanceStatus {
    Pending,
    Accepted,
    Rejected,
    /// Auto-approved credit customer
    Reach,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cash,
    Credit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancellationReason {
    ChangedMind,
    WrongDetails,
    FoundAlternative,
    PaymentIssue,
    Other,
}

/// Driver-matching progress stored on the shipment.
///
/// `round` is bumped on every restart, pause, acceptance and cancellation.
/// Dispatch jobs carry the round they were issued under and are dropped
/// when it no longer matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchingState {
    pub round: u64,
    pub stage: Option<DispatchStage>,
    pub paused_stage: Option<DispatchStage>,
    pub started_at: Option<DateTime<Utc>>,
    /// Last iteration of the current round that notified drivers.
    #[serde(default)]
    pub fired_iteration: u32,
}

impl MatchingState {
    /// Open a new round at `stage`.
    pub fn begin(&mut self, stage: DispatchStage, now: DateTime<Utc>) -> u64 {
        self.round += 1;
        self.stage = Some(stage);
        self.paused_stage = None;
        self.started_at = Some(now);
        self.fired_iteration = 0;
        self.round
    }

    /// Stop firing after `stage` ran out. Returns the round the idle timer belongs to.
    pub fn pause(&mut self, stage: DispatchStage) -> u64 {
        self.round += 1;
        self.stage = None;
        self.paused_stage = Some(stage);
        self.fired_iteration = 0;
        self.round
    }

    /// Invalidate every outstanding job.
    pub fn halt(&mut self) {
        self.round += 1;
        self.stage = None;
        self.paused_stage = None;
        self.fired_iteration = 0;
    }

    pub fn record_firing(&mut self, iteration: u32) {
        self.fired_iteration = self.fired_iteration.max(iteration);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancellationRecord {
    pub reason: CancellationReason,
    pub detail: Option<String>,
    pub cancelled_by: Actor,
    pub fee: CancellationFee,
    pub cancelled_at: DateTime<Utc>,
}

/// The aggregate root of a delivery job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Shipment {
    pub id: Uuid,
    pub tracking_number: String,
    pub customer_id: Uuid,
    pub status: ShipmentStatus,
    pub driver_acceptance_status: DriverAcceptanceStatus,
    pub admin_acceptance_status: AdminAcceptanceStatus,
    pub steps: StepLedger,
    pub quotations: Vec<Quotation>,
    pub payment_method: PaymentMethod,
    pub booking_date_time: DateTime<Utc>,
    pub is_notification_pause: bool,
    pub requested_driver: Option<Uuid>,
    pub driver: Option<Uuid>,
    pub agent_driver: Option<Uuid>,
    pub vehicle_type: VehicleType,
    pub locations: Vec<Location>,
    pub is_round_trip: bool,
    pub services: Vec<String>,
    pub matching: MatchingState,
    pub cancellation: Option<CancellationRecord>,
    /// Credit shipments only: whether a billing cycle has picked it up.
    pub is_billed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to create a shipment besides its quotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBooking {
    pub tracking_number: String,
    pub customer_id: Uuid,
    pub payment_method: PaymentMethod,
    pub booking_date_time: DateTime<Utc>,
    pub vehicle_type: VehicleType,
    pub locations: Vec<Location>,
    #[serde(default)]
    pub is_round_trip: bool,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub requested_driver: Option<Uuid>,
    #[serde(default)]
    pub discount_code: Option<String>,
}

impl Shipment {
    pub fn new(booking: NewBooking, quotation: Quotation, now: DateTime<Utc>) -> Self {
        let (driver_acceptance_status, admin_acceptance_status) = match booking.payment_method {
            PaymentMethod::Cash => (DriverAcceptanceStatus::Idle, AdminAcceptanceStatus::Pending),
            PaymentMethod::Credit => (DriverAcceptanceStatus::Pending, AdminAcceptanceStatus::Reach),
        };

        let mut shipment = Self {
            id: Uuid::new_v4(),
            tracking_number: booking.tracking_number,
            customer_id: booking.customer_id,
            status: ShipmentStatus::Idle,
            driver_acceptance_status,
            admin_acceptance_status,
            steps: StepLedger::default(),
            quotations: vec![quotation],
            payment_method: booking.payment_method,
            booking_date_time: booking.booking_date_time,
            is_notification_pause: false,
            requested_driver: booking.requested_driver,
            driver: None,
            agent_driver: None,
            vehicle_type: booking.vehicle_type,
            locations: booking.locations,
            is_round_trip: booking.is_round_trip,
            services: booking.services,
            matching: MatchingState::default(),
            cancellation: None,
            is_billed: false,
            created_at: now,
            updated_at: now,
        };
        shipment.steps = StepLedger::initialize(&shipment.template_shape(), false, now);
        shipment
    }

    pub fn template_shape(&self) -> TemplateShape {
        TemplateShape {
            payment_method: self.payment_method,
            destination_count: self.locations.len().saturating_sub(1).max(1),
            is_round_trip: self.is_round_trip,
            has_pod: self.services.iter().any(|s| s.eq_ignore_ascii_case(POD_SERVICE)),
        }
    }

    /// Active price/cost snapshot
    pub fn latest_quotation(&self) -> Option<&Quotation> {
        self.quotations.iter().max_by_key(|q| q.created_at)
    }

    pub fn pickup_done(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.kind == StepKind::Pickup && s.status == StepStatus::Done)
    }

    pub fn is_pre_pickup(&self) -> bool {
        !self.pickup_done()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ShipmentStatus::Delivered | ShipmentStatus::Cancelled)
    }

    /// Whether matching jobs may still fire for this shipment.
    pub fn awaits_driver(&self) -> bool {
        !self.is_terminal()
            && self.status != ShipmentStatus::Refund
            && matches!(
                self.driver_acceptance_status,
                DriverAcceptanceStatus::Idle | DriverAcceptanceStatus::Pending
            )
    }

    pub fn minutes_to_booking(&self, now: DateTime<Utc>) -> i64 {
        (self.booking_date_time - now).num_minutes()
    }

    /// Credit shipment a billing cycle still has to invoice.
    pub fn awaits_credit_billing(&self) -> bool {
        self.payment_method == PaymentMethod::Credit && !self.is_billed && self.billable_amount() > 0
    }

    /// What a credit billing charges: the full price once delivered, the
    /// operator's share of the fee once cancelled.
    pub fn billable_amount(&self) -> i64 {
        match self.status {
            ShipmentStatus::Delivered => self.latest_quotation().map(|q| q.price.total).unwrap_or(0),
            ShipmentStatus::Cancelled => self.cancellation.as_ref().map(|c| c.fee.for_operator).unwrap_or(0),
            _ => 0,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Inactive,
    Banned,
}

/// Customer standing and credit ledger.
///
/// `credit_usage` and `credit_outstanding_balance` are only ever changed by
/// atomic deltas through the store, never by read-modify-write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomerAccount {
    pub id: Uuid,
    pub status: AccountStatus,
    pub credit_limit: i64,
    pub credit_usage: i64,
    pub credit_outstanding_balance: i64,
    pub is_business: bool,
}

impl CustomerAccount {
    pub fn new(id: Uuid, credit_limit: i64, is_business: bool) -> Self {
        Self {
            id,
            status: AccountStatus::Active,
            credit_limit,
            credit_usage: 0,
            credit_outstanding_balance: 0,
            is_business,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionRefType {
    ShipmentIncome,
    DriverPayout,
    CancellationFee,
    DriverCompensation,
    Refund,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionOwner {
    Operator,
    Driver(Uuid),
    Customer(Uuid),
}

/// Money movement record. Unique per `(tracking_number, ref_type, owner)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: Uuid,
    pub tracking_number: String,
    pub ref_type: TransactionRefType,
    pub owner: TransactionOwner,
    pub amount: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        tracking_number: &str,
        ref_type: TransactionRefType,
        owner: TransactionOwner,
        amount: i64,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tracking_number: tracking_number.to_string(),
            ref_type,
            owner,
            amount,
            description: description.into(),
            created_at: now,
        }
    }

    pub fn key(&self) -> (String, TransactionRefType, TransactionOwner) {
        (self.tracking_number.clone(), self.ref_type, self.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use movemate_core::pricing::VehicleClass;
    use movemate_core::{Cost, Price};

    fn booking(method: PaymentMethod, drops: usize) -> NewBooking {
        let stop = |name: &str| Location {
            name: name.to_string(),
            latitude: 13.7,
            longitude: 100.5,
        };
        let mut locations = vec![stop("origin")];
        for i in 0..drops {
            locations.push(stop(&format!("drop-{}", i)));
        }
        NewBooking {
            tracking_number: "MM0001".to_string(),
            customer_id: Uuid::new_v4(),
            payment_method: method,
            booking_date_time: Utc::now() + chrono::Duration::hours(4),
            vehicle_type: VehicleType {
                id: "4W".to_string(),
                name: "Pickup".to_string(),
                class: VehicleClass::FourWheel,
            },
            locations,
            is_round_trip: false,
            services: vec!["pod".to_string()],
            requested_driver: None,
            discount_code: None,
        }
    }

    fn quotation(total: i64) -> Quotation {
        Quotation::new(Price::fresh(total, 0, 0), Cost::fresh(total * 8 / 10, 0, 0), serde_json::Value::Null, Utc::now())
    }

    #[test]
    fn test_initial_acceptance_by_payment_method() {
        let cash = Shipment::new(booking(PaymentMethod::Cash, 1), quotation(1000), Utc::now());
        assert_eq!(cash.driver_acceptance_status, DriverAcceptanceStatus::Idle);
        assert_eq!(cash.admin_acceptance_status, AdminAcceptanceStatus::Pending);

        let credit = Shipment::new(booking(PaymentMethod::Credit, 1), quotation(1000), Utc::now());
        assert_eq!(credit.driver_acceptance_status, DriverAcceptanceStatus::Pending);
        assert_eq!(credit.admin_acceptance_status, AdminAcceptanceStatus::Reach);
    }

    #[test]
    fn test_template_shape_from_attributes() {
        let shipment = Shipment::new(booking(PaymentMethod::Credit, 3), quotation(1000), Utc::now());
        let shape = shipment.template_shape();
        assert_eq!(shape.destination_count, 3);
        assert!(shape.has_pod);
        assert!(!shape.is_round_trip);
    }

    #[test]
    fn test_latest_quotation_wins() {
        let mut shipment = Shipment::new(booking(PaymentMethod::Cash, 1), quotation(1000), Utc::now());
        let mut newer = quotation(1500);
        newer.created_at = Utc::now() + chrono::Duration::minutes(5);
        shipment.quotations.push(newer);
        assert_eq!(shipment.latest_quotation().map(|q| q.price.total), Some(1500));
    }

    #[test]
    fn test_matching_rounds_only_move_forward() {
        let mut matching = MatchingState::default();
        let now = Utc::now();
        assert_eq!(matching.begin(DispatchStage::InitialBroadcast, now), 1);
        matching.record_firing(3);
        matching.record_firing(2);
        assert_eq!(matching.fired_iteration, 3);
        assert_eq!(matching.pause(DispatchStage::InitialBroadcast), 2);
        assert_eq!(matching.paused_stage, Some(DispatchStage::InitialBroadcast));
        assert_eq!(matching.fired_iteration, 0);
        matching.halt();
        assert_eq!(matching.round, 3);
        assert!(matching.paused_stage.is_none());
    }
}
