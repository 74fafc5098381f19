use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One unit of the shipment workflow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    Created,
    CashVerify,
    DriverAccepted,
    ConfirmDatetime,
    ArrivalPickup,
    Pickup,
    ArrivalDropoff,
    Dropoff,
    Pod,
    Finish,
    RejectedPayment,
    UninterestedDriver,
    Refund,
    CustomerCancelled,
    SystemCancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Idle,
    Progressing,
    Done,
    Expire,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: Uuid,
    pub kind: StepKind,
    pub seq: u32,
    pub status: StepStatus,
    pub customer_message: String,
    pub driver_message: String,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Step {
    pub(crate) fn from_template(template: &StepTemplate, seq: u32, now: DateTime<Utc>) -> Self {
        let (customer_message, driver_message) = default_messages(template.kind, &template.meta);
        Self {
            id: Uuid::new_v4(),
            kind: template.kind,
            seq,
            status: template.status,
            customer_message,
            driver_message,
            meta: template.meta.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn set_status(&mut self, status: StepStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    /// Change the step's kind in place, refreshing its messages.
    pub(crate) fn relabel(&mut self, kind: StepKind, now: DateTime<Utc>) {
        let (customer_message, driver_message) = default_messages(kind, &self.meta);
        self.kind = kind;
        self.customer_message = customer_message;
        self.driver_message = driver_message;
        self.updated_at = now;
    }
}

/// Blueprint for a step not yet placed in a ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct StepTemplate {
    pub kind: StepKind,
    pub status: StepStatus,
    pub meta: serde_json::Value,
}

impl StepTemplate {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            status: StepStatus::Idle,
            meta: serde_json::Value::Null,
        }
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}

/// Default (customer, driver) messages for a step kind.
pub fn default_messages(kind: StepKind, meta: &serde_json::Value) -> (String, String) {
    let drop_label = match meta.get("dropoff_index").and_then(|v| v.as_u64()) {
        Some(index) if index > 0 => format!(" (point {})", index + 1),
        _ if meta.get("return_trip").and_then(|v| v.as_bool()) == Some(true) => " (return trip)".to_string(),
        _ => String::new(),
    };

    let (customer, driver) = match kind {
        StepKind::Created => ("Booking created", "New booking"),
        StepKind::CashVerify => ("Verifying payment", "Awaiting payment verification"),
        StepKind::DriverAccepted => ("Finding a driver", "Accept job"),
        StepKind::ConfirmDatetime => ("Confirming pickup time", "Confirm pickup time"),
        StepKind::ArrivalPickup => ("Driver heading to pickup", "Arrive at pickup"),
        StepKind::Pickup => ("Picking up goods", "Confirm pickup"),
        StepKind::ArrivalDropoff => ("Driver heading to destination", "Arrive at destination"),
        StepKind::Dropoff => ("Delivering goods", "Confirm delivery"),
        StepKind::Pod => match meta.get("phase").and_then(|v| v.as_str()) {
            Some("RECEIVED") => ("Proof of delivery received", "Proof of delivery received"),
            _ => ("Proof of delivery on the way", "Send proof of delivery"),
        },
        StepKind::Finish => ("Shipment complete", "Job complete"),
        StepKind::RejectedPayment => ("Payment rejected", "Payment rejected"),
        StepKind::UninterestedDriver => ("No driver interested", "Job closed"),
        StepKind::Refund => ("Processing refund", "Refund in progress"),
        StepKind::CustomerCancelled => ("Cancelled by customer", "Job cancelled by customer"),
        StepKind::SystemCancelled => ("Cancelled by system", "Job cancelled by system"),
    };

    match kind {
        StepKind::ArrivalDropoff | StepKind::Dropoff => {
            (format!("{}{}", customer, drop_label), format!("{}{}", driver, drop_label))
        }
        _ => (customer.to_string(), driver.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropoff_messages_mention_point() {
        let (customer, driver) = default_messages(StepKind::Dropoff, &serde_json::json!({ "dropoff_index": 2 }));
        assert_eq!(customer, "Delivering goods (point 3)");
        assert_eq!(driver, "Confirm delivery (point 3)");
    }

    #[test]
    fn test_return_trip_label() {
        let (customer, _) = default_messages(StepKind::ArrivalDropoff, &serde_json::json!({ "return_trip": true }));
        assert!(customer.ends_with("(return trip)"));
    }

    #[test]
    fn test_relabel_refreshes_messages() {
        let mut step = Step::from_template(&StepTemplate::new(StepKind::CashVerify), 1, Utc::now());
        step.relabel(StepKind::RejectedPayment, Utc::now());
        assert_eq!(step.kind, StepKind::RejectedPayment);
        assert_eq!(step.customer_message, "Payment rejected");
    }
}
