use chrono::{DateTime, NaiveDate, Utc};
use movemate_core::documents::{DocumentKind, GeneratedDocument};
use movemate_core::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::PaymentMethod;

// ============================================================================
// Billing State Machine
// ============================================================================
//
// status = payment lifecycle (PENDING/VERIFY/CANCELLED/COMPLETE)
// state  = account standing (CURRENT/OVERDUE/REFUND)
//
// COMPLETE is only entered when a payment completes. REFUND is only held
// while a refund note is unsettled. Payments and reasons are append-only.
//
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingStatus {
    Pending,
    Verify,
    Cancelled,
    Complete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingState {
    Current,
    Overdue,
    Refund,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentType {
    Pay,
    Refund,
    Change,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Verify,
    Cancelled,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payment {
    pub id: Uuid,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    pub total: i64,
    pub wht_amount: i64,
    pub rejected_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    fn new(payment_type: PaymentType, status: PaymentStatus, total: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_type,
            status,
            total,
            wht_amount: 0,
            rejected_at: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, PaymentStatus::Pending | PaymentStatus::Verify)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonType {
    RejectedPayment,
    RevertedRejection,
    CancelledShipment,
    Refunded,
    NoRefund,
    Overdue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingReason {
    pub reason_type: ReasonType,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundAmountType {
    Full,
    Half,
}

/// Outstanding refund owed to the customer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundNote {
    pub amount_type: RefundAmountType,
    pub amount: i64,
    pub wht_amount: i64,
    pub settled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Generated,
    /// Rendering failed; to be reconciled later.
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BillingDocument {
    pub kind: DocumentKind,
    pub amount: i64,
    pub document_id: Option<String>,
    pub file: Option<String>,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
}

/// Result of settling a refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundOutcome {
    pub refunded: bool,
    pub amount: i64,
    pub amount_type: RefundAmountType,
}

/// Money flow of one shipment. `billing_number` equals the tracking number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Billing {
    pub id: Uuid,
    pub billing_number: String,
    pub customer_id: Uuid,
    pub payment_method: PaymentMethod,
    pub status: BillingStatus,
    pub state: BillingState,
    pub amount: i64,
    pub payments: Vec<Payment>,
    pub reasons: Vec<BillingReason>,
    pub refund_note: Option<RefundNote>,
    pub documents: Vec<BillingDocument>,
    pub payment_due_date: Option<NaiveDate>,
    /// When the due-soon reminder went out for the current due date.
    #[serde(default)]
    pub due_reminded_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub issued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Billing {
    /// Open a billing in PENDING/CURRENT with a single pay request.
    ///
    /// Cash billings carry the customer's transfer awaiting verification.
    /// Credit billings are issued by the billing cycle with a due date.
    pub fn issue(
        billing_number: &str,
        customer_id: Uuid,
        payment_method: PaymentMethod,
        amount: i64,
        payment_due_date: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Self {
        let payment_status = match payment_method {
            PaymentMethod::Cash => PaymentStatus::Verify,
            PaymentMethod::Credit => PaymentStatus::Pending,
        };
        Self {
            id: Uuid::new_v4(),
            billing_number: billing_number.to_string(),
            customer_id,
            payment_method,
            status: BillingStatus::Pending,
            state: BillingState::Current,
            amount,
            payments: vec![Payment::new(PaymentType::Pay, payment_status, amount, now)],
            reasons: Vec::new(),
            refund_note: None,
            documents: Vec::new(),
            payment_due_date,
            due_reminded_at: None,
            paid_at: None,
            issued_at: now,
            updated_at: now,
        }
    }

    pub fn payment(&self, payment_id: Uuid) -> Option<&Payment> {
        self.payments.iter().find(|p| p.id == payment_id)
    }

    /// Most recent pay request still awaiting settlement.
    pub fn open_pay_payment(&self) -> Option<&Payment> {
        self.payments
            .iter()
            .rev()
            .find(|p| p.payment_type == PaymentType::Pay && p.is_open())
    }

    fn pending_refund_index(&self) -> Option<usize> {
        self.payments
            .iter()
            .rposition(|p| p.payment_type == PaymentType::Refund && p.status == PaymentStatus::Pending)
    }

    /// True once a pay request completed and nothing non-refund is still open.
    pub fn is_paid_in_full(&self) -> bool {
        let any_complete = self
            .payments
            .iter()
            .any(|p| p.payment_type != PaymentType::Refund && p.status == PaymentStatus::Complete);
        let any_open = self
            .payments
            .iter()
            .any(|p| p.payment_type != PaymentType::Refund && p.is_open());
        any_complete && !any_open
    }

    pub fn has_outstanding_refund(&self) -> bool {
        self.refund_note.as_ref().map(|n| !n.settled).unwrap_or(false)
    }

    fn push_reason(&mut self, reason_type: ReasonType, detail: Option<String>, now: DateTime<Utc>) {
        self.reasons.push(BillingReason {
            reason_type,
            detail,
            created_at: now,
        });
    }

    fn payment_mut(&mut self, payment_id: Uuid) -> CoreResult<&mut Payment> {
        self.payments
            .iter_mut()
            .find(|p| p.id == payment_id)
            .ok_or_else(|| CoreError::not_found("payment", payment_id.to_string()))
    }

    /// Approve a pay request. The billing becomes COMPLETE/CURRENT.
    pub fn mark_paid(&mut self, payment_id: Uuid, now: DateTime<Utc>) -> CoreResult<Payment> {
        if !matches!(self.status, BillingStatus::Pending | BillingStatus::Verify) {
            return Err(CoreError::invalid_state(
                "BILLING_ALREADY_SETTLED",
                format!("Billing {} is {:?}", self.billing_number, self.status),
            ));
        }
        let payment = self.payment_mut(payment_id)?;
        if matches!(payment.status, PaymentStatus::Cancelled | PaymentStatus::Complete) {
            return Err(CoreError::invalid_state(
                "PAYMENT_ALREADY_SETTLED",
                format!("Payment {} is {:?}", payment_id, payment.status),
            ));
        }
        if payment.payment_type == PaymentType::Refund {
            return Err(CoreError::invalid_state(
                "PAYMENT_TYPE_MISMATCH",
                format!("Payment {} is a refund", payment_id),
            ));
        }

        payment.status = PaymentStatus::Complete;
        payment.paid_at = Some(now);
        payment.updated_at = now;
        let paid = payment.clone();

        self.status = BillingStatus::Complete;
        self.state = BillingState::Current;
        self.paid_at = Some(now);
        self.updated_at = now;
        Ok(paid)
    }

    /// Reject a pay request; the customer is owed their transfer back.
    pub fn reject(&mut self, payment_id: Uuid, detail: Option<String>, now: DateTime<Utc>) -> CoreResult<Payment> {
        if matches!(self.status, BillingStatus::Complete | BillingStatus::Cancelled) {
            return Err(CoreError::invalid_state(
                "BILLING_ALREADY_SETTLED",
                format!("Billing {} is {:?}", self.billing_number, self.status),
            ));
        }
        let payment = self.payment_mut(payment_id)?;
        if !payment.is_open() || payment.payment_type != PaymentType::Pay {
            return Err(CoreError::invalid_state(
                "PAYMENT_ALREADY_SETTLED",
                format!("Payment {} cannot be rejected", payment_id),
            ));
        }

        payment.status = PaymentStatus::Pending;
        payment.payment_type = PaymentType::Refund;
        payment.rejected_at = Some(now);
        payment.updated_at = now;
        let rejected = payment.clone();

        self.status = BillingStatus::Pending;
        self.state = BillingState::Refund;
        self.refund_note = Some(RefundNote {
            amount_type: RefundAmountType::Full,
            amount: rejected.total,
            wht_amount: 0,
            settled: false,
            created_at: now,
        });
        self.push_reason(ReasonType::RejectedPayment, detail, now);
        self.updated_at = now;
        Ok(rejected)
    }

    /// Undo `reject`: the payment goes back to verification.
    pub fn revert_rejection(&mut self, now: DateTime<Utc>) -> CoreResult<Payment> {
        if !self.has_outstanding_refund() {
            return Err(CoreError::invalid_state(
                "NO_REJECTED_PAYMENT",
                format!("Billing {} has no rejection to revert", self.billing_number),
            ));
        }
        let index = self
            .payments
            .iter()
            .rposition(|p| p.rejected_at.is_some() && p.payment_type == PaymentType::Refund && p.status == PaymentStatus::Pending)
            .ok_or_else(|| {
                CoreError::invalid_state(
                    "NO_REJECTED_PAYMENT",
                    format!("Billing {} has no rejection to revert", self.billing_number),
                )
            })?;

        let payment = &mut self.payments[index];
        payment.payment_type = PaymentType::Pay;
        payment.status = PaymentStatus::Verify;
        payment.rejected_at = None;
        payment.updated_at = now;
        let restored = payment.clone();

        self.status = BillingStatus::Verify;
        self.state = BillingState::Current;
        self.refund_note = None;
        self.push_reason(ReasonType::RevertedRejection, None, now);
        self.updated_at = now;
        Ok(restored)
    }

    /// Owe the customer `amount` (plus withheld tax) after a cancellation.
    /// Open pay requests are superseded by the refund.
    pub fn open_refund(
        &mut self,
        amount_type: RefundAmountType,
        amount: i64,
        wht_amount: i64,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        if self.status == BillingStatus::Cancelled || self.has_outstanding_refund() {
            return Err(CoreError::invalid_state(
                "REFUND_ALREADY_OPEN",
                format!("Billing {} cannot open another refund", self.billing_number),
            ));
        }

        for payment in self.payments.iter_mut().filter(|p| p.payment_type == PaymentType::Pay && p.is_open()) {
            payment.status = PaymentStatus::Cancelled;
            payment.updated_at = now;
        }
        let mut refund = Payment::new(PaymentType::Refund, PaymentStatus::Pending, amount + wht_amount, now);
        refund.wht_amount = wht_amount;
        self.payments.push(refund);

        self.status = BillingStatus::Pending;
        self.state = BillingState::Refund;
        self.refund_note = Some(RefundNote {
            amount_type,
            amount,
            wht_amount,
            settled: false,
            created_at: now,
        });
        self.push_reason(ReasonType::CancelledShipment, detail, now);
        self.updated_at = now;
        Ok(())
    }

    /// Close a cancelled shipment's billing when nothing is refunded.
    pub fn close_with_charge(&mut self, detail: Option<String>, now: DateTime<Utc>) -> CoreResult<()> {
        if self.status == BillingStatus::Cancelled {
            return Err(CoreError::invalid_state(
                "BILLING_ALREADY_SETTLED",
                format!("Billing {} is already cancelled", self.billing_number),
            ));
        }
        self.status = BillingStatus::Cancelled;
        self.state = BillingState::Current;
        self.push_reason(ReasonType::CancelledShipment, detail, now);
        self.updated_at = now;
        Ok(())
    }

    /// Settle the outstanding refund, successfully or not.
    pub fn refund(&mut self, is_refunded: bool, amount: Option<i64>, now: DateTime<Utc>) -> CoreResult<RefundOutcome> {
        if !matches!(self.state, BillingState::Refund | BillingState::Current) {
            return Err(CoreError::invalid_state(
                "INVALID_BILLING_STATE",
                format!("Billing {} is {:?}", self.billing_number, self.state),
            ));
        }
        let note = match self.refund_note.as_ref() {
            Some(note) if !note.settled => note.clone(),
            _ => {
                return Err(CoreError::invalid_state(
                    "REFUND_ALREADY_SETTLED",
                    format!("Billing {} has no outstanding refund", self.billing_number),
                ))
            }
        };
        let index = self.pending_refund_index().ok_or_else(|| {
            CoreError::invalid_state(
                "REFUND_ALREADY_SETTLED",
                format!("Billing {} has no pending refund payment", self.billing_number),
            )
        })?;

        let owed = self.payments[index].total;
        let settled_amount = amount.unwrap_or(owed);
        if is_refunded && (settled_amount <= 0 || settled_amount > owed) {
            return Err(CoreError::invalid_state(
                "REFUND_AMOUNT_INVALID",
                format!("Refund of {} on billing {} must be within 1..={}", settled_amount, self.billing_number, owed),
            ));
        }

        let payment = &mut self.payments[index];
        if is_refunded {
            payment.status = PaymentStatus::Complete;
            payment.total = settled_amount;
            payment.paid_at = Some(now);
        } else {
            payment.status = PaymentStatus::Cancelled;
        }
        payment.updated_at = now;

        if let Some(note) = self.refund_note.as_mut() {
            note.settled = true;
        }
        if is_refunded {
            self.status = BillingStatus::Complete;
            self.paid_at = Some(now);
            self.push_reason(ReasonType::Refunded, None, now);
        } else {
            self.status = BillingStatus::Cancelled;
            self.push_reason(ReasonType::NoRefund, None, now);
        }
        self.state = BillingState::Current;
        self.updated_at = now;

        Ok(RefundOutcome {
            refunded: is_refunded,
            amount: if is_refunded { settled_amount } else { 0 },
            amount_type: note.amount_type,
        })
    }

    /// CURRENT and unpaid past the due date.
    pub fn is_past_due(&self, today: NaiveDate) -> bool {
        self.state == BillingState::Current
            && matches!(self.status, BillingStatus::Pending | BillingStatus::Verify)
            && self.payment_due_date.map(|due| due < today).unwrap_or(false)
    }

    pub fn days_overdue(&self, today: NaiveDate) -> i64 {
        self.payment_due_date.map(|due| (today - due).num_days()).unwrap_or(0)
    }

    pub fn mark_overdue(&mut self, today: NaiveDate, now: DateTime<Utc>) -> bool {
        if !self.is_past_due(today) {
            return false;
        }
        self.state = BillingState::Overdue;
        self.push_reason(ReasonType::Overdue, None, now);
        self.updated_at = now;
        true
    }

    /// Record a rendered document, or a pending one when rendering failed.
    pub fn attach_document(
        &mut self,
        kind: DocumentKind,
        amount: i64,
        rendered: CoreResult<GeneratedDocument>,
        now: DateTime<Utc>,
    ) -> DocumentStatus {
        let (document_id, file, status) = match rendered {
            Ok(doc) => (Some(doc.document_id), doc.file, DocumentStatus::Generated),
            Err(e) => {
                tracing::warn!(billing_number = %self.billing_number, ?kind, "Document pending: {}", e);
                (None, None, DocumentStatus::Pending)
            }
        };
        self.documents.push(BillingDocument {
            kind,
            amount,
            document_id,
            file,
            status,
            created_at: now,
        });
        self.updated_at = now;
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cash_billing() -> Billing {
        Billing::issue("MM0001", Uuid::new_v4(), PaymentMethod::Cash, 1000, None, Utc::now())
    }

    #[test]
    fn test_issue_starts_pending_current() {
        let billing = cash_billing();
        assert_eq!(billing.status, BillingStatus::Pending);
        assert_eq!(billing.state, BillingState::Current);
        assert_eq!(billing.open_pay_payment().map(|p| p.status), Some(PaymentStatus::Verify));
    }

    #[test]
    fn test_mark_paid_completes() {
        let mut billing = cash_billing();
        let id = billing.payments[0].id;
        billing.mark_paid(id, Utc::now()).unwrap();
        assert_eq!(billing.status, BillingStatus::Complete);
        assert!(billing.is_paid_in_full());

        let err = billing.mark_paid(id, Utc::now()).unwrap_err();
        assert_eq!(err.code(), "BILLING_ALREADY_SETTLED");
    }

    #[test]
    fn test_mark_paid_unknown_payment() {
        let mut billing = cash_billing();
        let err = billing.mark_paid(Uuid::new_v4(), Utc::now()).unwrap_err();
        assert_eq!(err.code(), "PAYMENT_NOT_FOUND");
        assert_eq!(billing.status, BillingStatus::Pending);
    }

    #[test]
    fn test_reject_then_revert() {
        let mut billing = cash_billing();
        let id = billing.payments[0].id;

        billing.reject(id, Some("blurry slip".into()), Utc::now()).unwrap();
        assert_eq!(billing.status, BillingStatus::Pending);
        assert_eq!(billing.state, BillingState::Refund);
        assert_eq!(billing.payments[0].payment_type, PaymentType::Refund);
        assert_eq!(billing.reasons.len(), 1);

        billing.revert_rejection(Utc::now()).unwrap();
        assert_eq!(billing.state, BillingState::Current);
        assert_eq!(billing.payments[0].payment_type, PaymentType::Pay);
        assert_eq!(billing.payments[0].status, PaymentStatus::Verify);
        assert_eq!(billing.reasons.len(), 2);

        billing.mark_paid(id, Utc::now()).unwrap();
        assert_eq!(billing.status, BillingStatus::Complete);
    }

    #[test]
    fn test_reject_complete_billing_fails() {
        let mut billing = cash_billing();
        let id = billing.payments[0].id;
        billing.mark_paid(id, Utc::now()).unwrap();
        assert_eq!(
            billing.reject(id, None, Utc::now()).unwrap_err().code(),
            "BILLING_ALREADY_SETTLED"
        );
    }

    #[test]
    fn test_refund_success_and_double_settle() {
        let mut billing = cash_billing();
        billing
            .open_refund(RefundAmountType::Full, 1000, 10, None, Utc::now())
            .unwrap();
        assert_eq!(billing.state, BillingState::Refund);
        assert_eq!(billing.payments[0].status, PaymentStatus::Cancelled);

        let outcome = billing.refund(true, None, Utc::now()).unwrap();
        assert!(outcome.refunded);
        assert_eq!(outcome.amount, 1010);
        assert_eq!(billing.status, BillingStatus::Complete);
        assert_eq!(billing.state, BillingState::Current);

        assert_eq!(
            billing.refund(true, None, Utc::now()).unwrap_err().code(),
            "REFUND_ALREADY_SETTLED"
        );
    }

    #[test]
    fn test_refund_amount_must_be_within_owed() {
        let mut billing = cash_billing();
        billing
            .open_refund(RefundAmountType::Full, 1000, 10, None, Utc::now())
            .unwrap();

        for amount in [-50, 0, 1011] {
            let err = billing.refund(true, Some(amount), Utc::now()).unwrap_err();
            assert_eq!(err.code(), "REFUND_AMOUNT_INVALID");
        }
        // Rejected attempts leave the refund open.
        assert_eq!(billing.state, BillingState::Refund);
        assert!(billing.has_outstanding_refund());
        assert_eq!(billing.payments.last().map(|p| p.status), Some(PaymentStatus::Pending));

        let outcome = billing.refund(true, Some(600), Utc::now()).unwrap();
        assert_eq!(outcome.amount, 600);
        assert_eq!(billing.payments.last().map(|p| p.total), Some(600));
    }

    #[test]
    fn test_refund_failure_cancels() {
        let mut billing = cash_billing();
        billing
            .open_refund(RefundAmountType::Half, 500, 0, None, Utc::now())
            .unwrap();
        let outcome = billing.refund(false, None, Utc::now()).unwrap();
        assert!(!outcome.refunded);
        assert_eq!(outcome.amount_type, RefundAmountType::Half);
        assert_eq!(billing.status, BillingStatus::Cancelled);
        assert_eq!(billing.reasons.last().map(|r| r.reason_type), Some(ReasonType::NoRefund));
    }

    #[test]
    fn test_overdue_detection() {
        let today = Utc::now().date_naive();
        let mut billing = Billing::issue(
            "MM0002",
            Uuid::new_v4(),
            PaymentMethod::Credit,
            1000,
            Some(today - Duration::days(2)),
            Utc::now(),
        );
        assert!(billing.mark_overdue(today, Utc::now()));
        assert_eq!(billing.state, BillingState::Overdue);
        assert_eq!(billing.days_overdue(today), 2);
        assert!(!billing.mark_overdue(today, Utc::now()));
    }

    #[test]
    fn test_failed_document_is_pending() {
        let mut billing = cash_billing();
        let status = billing.attach_document(
            DocumentKind::Receipt,
            1000,
            Err(CoreError::ExternalFailure("renderer down".into())),
            Utc::now(),
        );
        assert_eq!(status, DocumentStatus::Pending);
        assert_eq!(billing.documents[0].document_id, None);
    }
}
