use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use movemate_core::documents::{DocumentGenerator, DocumentKind, DocumentRequest};
use movemate_core::drivers::{DriverContact, DriverDirectory};
use movemate_core::notification::{FeedUpdate, Notification, NotificationSink, PushPayload};
use movemate_core::pricing::{PricingService, QuoteRequest};
use movemate_core::{Actor, Clock, CoreError, CoreResult, Quotation, Role};
use std::sync::Arc;
use uuid::Uuid;

use crate::billing::{Billing, BillingState, RefundAmountType};
use crate::cancellation::{compute_fee, wht_gross_up, CancellationFee, FeeInput, FeeTier};
use crate::dispatch::{DispatchJob, DispatchScheduler, DispatchStage, DropReason, Firing, NotifyTarget};
use crate::ledger::StepLedger;
use crate::models::{
    AccountStatus, AdminAcceptanceStatus, CancellationReason, CancellationRecord, CustomerAccount,
    DriverAcceptanceStatus, NewBooking, PaymentMethod, Shipment, ShipmentStatus, Transaction, TransactionOwner,
    TransactionRefType,
};
use crate::policy::LifecyclePolicy;
use crate::queue::DispatchQueue;
use crate::repository::{ChangeSet, CreditDelta, LifecycleStore, Versioned};
use crate::step::{StepKind, StepStatus, StepTemplate};

/// External services the orchestrator calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub pricing: Arc<dyn PricingService>,
    pub notifier: Arc<dyn NotificationSink>,
    pub documents: Arc<dyn DocumentGenerator>,
    pub drivers: Arc<dyn DriverDirectory>,
}

/// Result of one dispatch job delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Dropped(DropReason),
    Notified { recipients: usize },
    Paused(DispatchStage),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancellationOutcome {
    pub shipment: Shipment,
    pub fee: CancellationFee,
}

/// Work done after a commit. Failures are logged, never propagated.
enum Effect {
    Notify(Uuid, Notification),
    NotifyAdmins(Notification),
    Feed(bool),
    CancelJobs,
    StartMatching {
        stage: DispatchStage,
        driver_id: Option<Uuid>,
        round: u64,
    },
    IdleTimer {
        stage: DispatchStage,
        round: u64,
    },
}

/// Shipment lifecycle controller.
///
/// Every handler re-reads the shipment/billing it touches, mutates them in
/// memory, and writes them back in a single `ChangeSet` guarded by the
/// versions it read. Notifications and queue operations run only after the
/// commit succeeded.
pub struct LifecycleOrchestrator {
    pub(crate) store: Arc<dyn LifecycleStore>,
    scheduler: DispatchScheduler,
    pub(crate) collaborators: Collaborators,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) policy: LifecyclePolicy,
}

impl LifecycleOrchestrator {
    pub fn new(
        store: Arc<dyn LifecycleStore>,
        queue: Arc<dyn DispatchQueue>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            store,
            scheduler: DispatchScheduler::new(queue, policy.dispatch),
            collaborators,
            clock,
            policy,
        }
    }

    pub fn scheduler(&self) -> &DispatchScheduler {
        &self.scheduler
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    pub async fn shipment(&self, tracking_number: &str) -> CoreResult<Shipment> {
        Ok(self.load_shipment(tracking_number).await?.value)
    }

    pub async fn billing(&self, billing_number: &str) -> CoreResult<Billing> {
        Ok(self.load_billing(billing_number).await?.value)
    }

    // ========================================================================
    // Booking & payment
    // ========================================================================

    /// New booking → quoted shipment with its step template.
    ///
    /// Cash bookings get a billing awaiting verification and start matching on
    /// approval. Credit bookings reserve credit and start matching now.
    pub async fn on_booking_created(&self, actor: &Actor, booking: NewBooking) -> CoreResult<Shipment> {
        if self.store.shipment(&booking.tracking_number).await?.is_some() {
            return Err(CoreError::invalid_state(
                "DUPLICATE_TRACKING_NUMBER",
                format!("Shipment {} already exists", booking.tracking_number),
            ));
        }
        let account = self.load_account(booking.customer_id).await?;
        if account.status != AccountStatus::Active {
            return Err(CoreError::invalid_state(
                "ACCOUNT_SUSPENDED",
                format!("Customer {} is {:?}", account.id, account.status),
            ));
        }

        let request = QuoteRequest {
            locations: booking.locations.clone(),
            vehicle_type: booking.vehicle_type.clone(),
            services: booking.services.clone(),
            is_round_trip: booking.is_round_trip,
            discount_code: booking.discount_code.clone(),
        };
        let quote = self.collaborators.pricing.quote(&request).await?;

        let now = self.clock.now();
        let quotation = Quotation::new(quote.price, quote.cost, quote.detail, now);
        let total = quotation.price.total;
        let mut shipment = Shipment::new(booking, quotation, now);
        let tracking_number = shipment.tracking_number.clone();

        let mut changes = ChangeSet::new();
        let mut effects = Vec::new();
        match shipment.payment_method {
            PaymentMethod::Cash => {
                let billing = Billing::issue(&tracking_number, shipment.customer_id, PaymentMethod::Cash, total, None, now);
                changes.put_billing(billing, None);
                effects.push(Effect::NotifyAdmins(Notification::new(
                    "Payment to verify",
                    format!("Cash payment for {} is waiting for verification", tracking_number),
                )));
            }
            PaymentMethod::Credit => {
                changes.adjust_credit(CreditDelta {
                    customer_id: shipment.customer_id,
                    usage_delta: total,
                    outstanding_delta: 0,
                    enforce_limit: true,
                });
                let (stage, driver_id) = self.choose_stage(&shipment).await;
                let round = shipment.matching.begin(stage, now);
                effects.push(Effect::StartMatching { stage, driver_id, round });
                effects.push(Effect::Feed(true));
            }
        }
        effects.push(Effect::Notify(
            shipment.customer_id,
            Notification::new("Booking created", format!("Shipment {} has been booked", tracking_number))
                .with_link(shipment_link(&tracking_number)),
        ));

        changes.put_shipment(shipment.clone(), None);
        self.store.commit(changes).await?;

        tracing::info!(
            tracking_number = %tracking_number,
            payment_method = ?shipment.payment_method,
            actor = %actor.user_id,
            total,
            "Booking created"
        );
        self.apply(&tracking_number, effects).await;
        Ok(shipment)
    }

    /// Payment approved → billing COMPLETE.
    ///
    /// Cash: CASH_VERIFY → DRIVER_ACCEPTED and matching starts, as long as
    /// the shipment is still pre-pickup and awaiting admin approval.
    /// Credit: the paid amount is released from usage and outstanding balance.
    pub async fn on_payment_approved(&self, actor: &Actor, billing_number: &str, payment_id: Uuid) -> CoreResult<Billing> {
        let Versioned { value: mut billing, version: billing_version } = self.load_billing(billing_number).await?;
        let now = self.clock.now();
        let paid = billing.mark_paid(payment_id, now)?;
        self.render(&mut billing, DocumentKind::Receipt, paid.total, now).await;

        let mut changes = ChangeSet::new();
        let mut effects = Vec::new();
        match billing.payment_method {
            PaymentMethod::Cash => {
                let Versioned { value: mut shipment, version } = self.load_shipment(billing_number).await?;
                let at_verify = shipment.steps.current_step().map(|s| s.kind) == Some(StepKind::CashVerify);
                if at_verify
                    && shipment.is_pre_pickup()
                    && shipment.admin_acceptance_status == AdminAcceptanceStatus::Pending
                {
                    let (stage, driver_id) = self.choose_stage(&shipment).await;
                    shipment.steps.advance(now);
                    shipment.admin_acceptance_status = AdminAcceptanceStatus::Accepted;
                    shipment.driver_acceptance_status = DriverAcceptanceStatus::Pending;
                    let round = shipment.matching.begin(stage, now);
                    shipment.touch(now);
                    changes.put_shipment(shipment, Some(version));
                    effects.push(Effect::StartMatching { stage, driver_id, round });
                    effects.push(Effect::Feed(true));
                }
            }
            PaymentMethod::Credit => {
                changes.adjust_credit(CreditDelta {
                    customer_id: billing.customer_id,
                    usage_delta: -paid.total,
                    outstanding_delta: -paid.total,
                    enforce_limit: false,
                });
                if self.settles_suspension(&billing).await? {
                    changes.set_account_status(billing.customer_id, AccountStatus::Active);
                    effects.push(Effect::Notify(
                        billing.customer_id,
                        Notification::new("Account reactivated", "All overdue billings are paid; you can book again"),
                    ));
                }
            }
        }
        effects.push(Effect::Notify(
            billing.customer_id,
            Notification::new("Payment approved", format!("Payment for {} has been approved", billing_number)),
        ));

        changes.put_billing(billing.clone(), Some(billing_version));
        self.store.commit(changes).await?;

        tracing::info!(billing_number, payment_id = %paid.id, actor = %actor.user_id, "Payment approved");
        self.apply(billing_number, effects).await;
        Ok(billing)
    }

    /// A suspended customer is reactivated once no other billing of theirs
    /// is still OVERDUE. Banned customers stay banned.
    async fn settles_suspension(&self, paid: &Billing) -> CoreResult<bool> {
        let account = self.load_account(paid.customer_id).await?;
        if account.status != AccountStatus::Inactive {
            return Ok(false);
        }
        let still_overdue = self
            .store
            .billings_in_state(BillingState::Overdue)
            .await?
            .into_iter()
            .any(|b| b.value.customer_id == paid.customer_id && b.value.billing_number != paid.billing_number);
        Ok(!still_overdue)
    }

    /// Payment rejected → billing PENDING/REFUND.
    ///
    /// A cash shipment still at CASH_VERIFY is cut there: the step becomes
    /// REJECTED_PAYMENT and a REFUND step is appended.
    pub async fn on_payment_rejected(
        &self,
        actor: &Actor,
        billing_number: &str,
        payment_id: Uuid,
        detail: Option<String>,
    ) -> CoreResult<Billing> {
        let Versioned { value: mut billing, version: billing_version } = self.load_billing(billing_number).await?;
        let now = self.clock.now();
        billing.reject(payment_id, detail, now)?;

        let mut changes = ChangeSet::new();
        let mut effects = Vec::new();
        if billing.payment_method == PaymentMethod::Cash {
            let Versioned { value: mut shipment, version } = self.load_shipment(billing_number).await?;
            let verify_seq = shipment
                .steps
                .current_step()
                .filter(|s| s.kind == StepKind::CashVerify)
                .map(|s| s.seq);
            if let (true, Some(seq)) = (shipment.is_pre_pickup(), verify_seq) {
                shipment.steps.truncate_from(
                    seq,
                    Some(StepKind::RejectedPayment),
                    vec![StepTemplate::new(StepKind::Refund).with_status(StepStatus::Progressing)],
                    now,
                )?;
                shipment.status = ShipmentStatus::Refund;
                shipment.admin_acceptance_status = AdminAcceptanceStatus::Rejected;
                shipment.matching.halt();
                shipment.touch(now);
                changes.put_shipment(shipment, Some(version));
                effects.push(Effect::CancelJobs);
            }
        }
        effects.push(Effect::Notify(
            billing.customer_id,
            Notification::new("Payment rejected", format!("Payment for {} was rejected", billing_number)),
        ));

        changes.put_billing(billing.clone(), Some(billing_version));
        self.store.commit(changes).await?;

        tracing::info!(billing_number, payment_id = %payment_id, actor = %actor.user_id, "Payment rejected");
        self.apply(billing_number, effects).await;
        Ok(billing)
    }

    /// Undo a rejection: REFUND step removed, CASH_VERIFY reopened.
    pub async fn revert_payment_rejection(&self, actor: &Actor, billing_number: &str) -> CoreResult<Billing> {
        let Versioned { value: mut billing, version: billing_version } = self.load_billing(billing_number).await?;
        let now = self.clock.now();
        billing.revert_rejection(now)?;

        let mut changes = ChangeSet::new();
        if billing.payment_method == PaymentMethod::Cash {
            let Versioned { value: mut shipment, version } = self.load_shipment(billing_number).await?;
            if shipment.steps.find_kind(StepKind::RejectedPayment).is_none() {
                return Err(CoreError::invalid_state(
                    "NO_REJECTED_PAYMENT",
                    format!("Shipment {} has no rejected payment step", billing_number),
                ));
            }
            shipment.steps.revert_truncation(now)?;
            shipment.status = ShipmentStatus::Idle;
            shipment.admin_acceptance_status = AdminAcceptanceStatus::Pending;
            shipment.touch(now);
            changes.put_shipment(shipment, Some(version));
        }
        changes.put_billing(billing.clone(), Some(billing_version));
        self.store.commit(changes).await?;

        tracing::info!(billing_number, actor = %actor.user_id, "Payment rejection reverted");
        Ok(billing)
    }

    /// Refund settled (or refused) → billing closed, REFUND step DONE or CANCELLED.
    pub async fn on_refund_processed(
        &self,
        actor: &Actor,
        billing_number: &str,
        is_refunded: bool,
        amount: Option<i64>,
    ) -> CoreResult<Billing> {
        let Versioned { value: mut billing, version: billing_version } = self.load_billing(billing_number).await?;
        let now = self.clock.now();
        let outcome = billing.refund(is_refunded, amount, now)?;

        let mut changes = ChangeSet::new();
        if outcome.refunded {
            let (kind, document_amount) = match outcome.amount_type {
                RefundAmountType::Full => (DocumentKind::RefundReceipt, outcome.amount),
                RefundAmountType::Half => {
                    let refunded = billing.refund_note.as_ref().map(|n| n.amount).unwrap_or(outcome.amount);
                    (DocumentKind::Receipt, (billing.amount - refunded).max(0))
                }
            };
            self.render(&mut billing, kind, document_amount, now).await;
            changes.record_transaction(Transaction::new(
                billing_number,
                TransactionRefType::Refund,
                TransactionOwner::Customer(billing.customer_id),
                outcome.amount,
                "Refund to customer",
                now,
            ));
        }

        if let Some(Versioned { value: mut shipment, version }) = self.store.shipment(billing_number).await? {
            if shipment.status == ShipmentStatus::Refund {
                let step_status = if outcome.refunded { StepStatus::Done } else { StepStatus::Cancelled };
                if shipment.steps.current_step().map(|s| s.kind) == Some(StepKind::Refund) {
                    shipment.steps.settle_current(step_status, now)?;
                }
                shipment.status = ShipmentStatus::Cancelled;
                shipment.touch(now);
                changes.put_shipment(shipment, Some(version));
            }
        }

        let message = if outcome.refunded {
            format!("Refund of {} for {} has been paid", outcome.amount, billing_number)
        } else {
            format!("No refund will be paid for {}", billing_number)
        };
        let effects = vec![Effect::Notify(billing.customer_id, Notification::new("Refund update", message))];

        changes.put_billing(billing.clone(), Some(billing_version));
        self.store.commit(changes).await?;

        tracing::info!(
            billing_number,
            refunded = outcome.refunded,
            amount = outcome.amount,
            actor = %actor.user_id,
            "Refund processed"
        );
        self.apply(billing_number, effects).await;
        Ok(billing)
    }

    // ========================================================================
    // Matching
    // ========================================================================

    /// Driver accepted → DRIVER_ACCEPTED done, outstanding jobs cancelled.
    pub async fn on_driver_accepted(&self, actor: &Actor, tracking_number: &str) -> CoreResult<Shipment> {
        let Versioned { value: mut shipment, version } = self.load_shipment(tracking_number).await?;
        if shipment.driver_acceptance_status != DriverAcceptanceStatus::Pending || !shipment.awaits_driver() {
            return Err(CoreError::invalid_state(
                "SHIPMENT_NOT_AVAILABLE",
                format!("Shipment {} is not open for drivers", tracking_number),
            ));
        }
        if shipment.steps.current_step().map(|s| s.kind) != Some(StepKind::DriverAccepted) {
            return Err(CoreError::invalid_state(
                "STEP_MISMATCH",
                format!("Shipment {} is not waiting for a driver", tracking_number),
            ));
        }

        let now = self.clock.now();
        shipment.steps.advance(now);
        shipment.driver = Some(actor.user_id);
        shipment.driver_acceptance_status = DriverAcceptanceStatus::Accepted;
        shipment.status = ShipmentStatus::Progressing;
        shipment.is_notification_pause = false;
        shipment.matching.halt();
        shipment.touch(now);

        let mut changes = ChangeSet::new();
        changes.put_shipment(shipment.clone(), Some(version));
        self.store.commit(changes).await?;

        tracing::info!(tracking_number, driver_id = %actor.user_id, "Driver accepted");
        let effects = vec![
            Effect::CancelJobs,
            Effect::Feed(false),
            Effect::Notify(
                shipment.customer_id,
                Notification::new("Driver found", format!("A driver accepted shipment {}", tracking_number))
                    .with_link(shipment_link(tracking_number)),
            ),
        ];
        self.apply(tracking_number, effects).await;
        Ok(shipment)
    }

    /// Driver backed out before pickup → fresh template, INITIAL_BROADCAST again.
    pub async fn on_driver_cancel_after_accept(&self, actor: &Actor, tracking_number: &str) -> CoreResult<Shipment> {
        let Versioned { value: mut shipment, version } = self.load_shipment(tracking_number).await?;
        if shipment.driver_acceptance_status != DriverAcceptanceStatus::Accepted
            || shipment.status != ShipmentStatus::Progressing
            || shipment.pickup_done()
        {
            return Err(CoreError::invalid_state(
                "DRIVER_CANCEL_NOT_ALLOWED",
                format!("Shipment {} cannot be released by its driver", tracking_number),
            ));
        }
        if !actor.is_admin() && shipment.driver != Some(actor.user_id) {
            return Err(CoreError::invalid_state(
                "NOT_ASSIGNED_DRIVER",
                format!("Driver {} is not assigned to {}", actor.user_id, tracking_number),
            ));
        }

        let now = self.clock.now();
        let previous_driver = shipment.driver.take();
        shipment.agent_driver = None;
        shipment.steps = StepLedger::initialize(&shipment.template_shape(), true, now);
        shipment.driver_acceptance_status = DriverAcceptanceStatus::Pending;
        shipment.status = ShipmentStatus::Idle;
        shipment.is_notification_pause = false;
        let round = shipment.matching.begin(DispatchStage::InitialBroadcast, now);
        shipment.touch(now);

        let mut changes = ChangeSet::new();
        changes.put_shipment(shipment.clone(), Some(version));
        self.store.commit(changes).await?;

        tracing::info!(tracking_number, previous_driver = ?previous_driver, round, "Rematching shipment");
        let effects = vec![
            Effect::CancelJobs,
            Effect::StartMatching {
                stage: DispatchStage::InitialBroadcast,
                driver_id: None,
                round,
            },
            Effect::Feed(true),
            Effect::Notify(
                shipment.customer_id,
                Notification::new("Finding a new driver", format!("The driver released {}; matching again", tracking_number)),
            ),
        ];
        self.apply(tracking_number, effects).await;
        Ok(shipment)
    }

    /// Customer answered the pause prompt → continue at the next stage.
    pub async fn on_matching_resumed(&self, actor: &Actor, tracking_number: &str) -> CoreResult<Shipment> {
        let Versioned { value: mut shipment, version } = self.load_shipment(tracking_number).await?;
        let next = match (shipment.is_notification_pause, shipment.matching.paused_stage) {
            (true, Some(paused)) if shipment.awaits_driver() => paused.next(),
            _ => None,
        }
        .ok_or_else(|| {
            CoreError::invalid_state(
                "MATCHING_NOT_PAUSED",
                format!("Matching for {} is not paused", tracking_number),
            )
        })?;

        let now = self.clock.now();
        shipment.is_notification_pause = false;
        let round = shipment.matching.begin(next, now);
        shipment.touch(now);

        let mut changes = ChangeSet::new();
        changes.put_shipment(shipment.clone(), Some(version));
        self.store.commit(changes).await?;

        tracing::info!(tracking_number, stage = next.as_str(), actor = %actor.user_id, "Matching resumed");
        let effects = vec![
            Effect::CancelJobs,
            Effect::StartMatching {
                stage: next,
                driver_id: None,
                round,
            },
        ];
        self.apply(tracking_number, effects).await;
        Ok(shipment)
    }

    /// Deliver one dispatch job.
    ///
    /// Business errors are terminal for the job. `ExternalFailure` and
    /// `Conflict` are retryable: the job stays unacked and is redelivered.
    pub async fn handle_dispatch_job(&self, job: &DispatchJob) -> CoreResult<JobOutcome> {
        let current = self.store.shipment(&job.tracking_number).await?;
        let firing = self.scheduler.plan(job, current.as_ref().map(|v| &v.value));
        let current = match (firing.clone(), current) {
            (Firing::Drop(reason), _) => {
                tracing::debug!(
                    tracking_number = %job.tracking_number,
                    stage = job.stage.as_str(),
                    iteration = job.iteration,
                    ?reason,
                    "Dispatch job dropped"
                );
                return Ok(JobOutcome::Dropped(reason));
            }
            (_, None) => return Ok(JobOutcome::Dropped(DropReason::ShipmentMissing)),
            (_, Some(current)) => current,
        };

        match firing {
            Firing::Notify { target, next, delay } => {
                let contacts = match &target {
                    NotifyTarget::Driver(driver_id) => self
                        .collaborators
                        .drivers
                        .find_available(*driver_id)
                        .await?
                        .into_iter()
                        .collect::<Vec<_>>(),
                    NotifyTarget::VehicleType(vehicle_type_id) => {
                        self.collaborators.drivers.available_drivers(vehicle_type_id).await?
                    }
                };

                // The successor and the fired marker land before any push, so a
                // redelivered copy of this job finds both and is dropped.
                let now = self.clock.now();
                self.scheduler.schedule(&next, now + delay).await?;
                let Versioned { value: mut shipment, version } = current;
                shipment.matching.record_firing(job.iteration);
                let mut changes = ChangeSet::new();
                changes.put_shipment(shipment.clone(), Some(version));
                self.store.commit(changes).await?;

                let recipients = self.broadcast(&shipment, job, &contacts).await;
                tracing::info!(
                    tracking_number = %job.tracking_number,
                    stage = job.stage.as_str(),
                    iteration = job.iteration,
                    recipients,
                    "Dispatch notification sent"
                );
                Ok(JobOutcome::Notified { recipients })
            }
            Firing::Exhausted(stage) if stage.next().is_some() => {
                self.pause_matching(current, stage).await?;
                Ok(JobOutcome::Paused(stage))
            }
            Firing::Exhausted(stage) | Firing::IdleTimeout(stage) => {
                self.cancel_unmatched(current, stage).await?;
                Ok(JobOutcome::Cancelled)
            }
            Firing::Drop(reason) => Ok(JobOutcome::Dropped(reason)),
        }
    }

    /// Claim and deliver due jobs. Returns how many were claimed.
    pub async fn process_due_jobs(&self, limit: usize) -> CoreResult<usize> {
        let now = self.clock.now();
        let queue = self.scheduler.queue();
        let requeued = queue.requeue_expired(now).await?;
        if requeued > 0 {
            tracing::warn!(requeued, "Redelivering expired dispatch jobs");
        }

        let jobs = queue.take_due(now, limit).await?;
        let claimed = jobs.len();
        let deliveries = jobs.iter().map(|job| async move {
            match self.handle_dispatch_job(job).await {
                Ok(outcome) => {
                    tracing::debug!(tracking_number = %job.tracking_number, ?outcome, "Dispatch job handled");
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(tracking_number = %job.tracking_number, error = %e, "Dispatch job will be retried");
                    return;
                }
                Err(e) => {
                    tracing::error!(tracking_number = %job.tracking_number, code = e.code(), error = %e, "Dispatch job failed");
                }
            }
            if let Err(e) = queue.ack(job).await {
                tracing::warn!(tracking_number = %job.tracking_number, error = %e, "Failed to ack dispatch job");
            }
        });
        join_all(deliveries).await;
        Ok(claimed)
    }

    async fn broadcast(&self, shipment: &Shipment, job: &DispatchJob, contacts: &[DriverContact]) -> usize {
        let destination = shipment.locations.last().map(|l| l.name.as_str()).unwrap_or_default();
        let payload = PushPayload {
            title: "New job available".to_string(),
            body: format!("{} to {}", shipment.tracking_number, destination),
            data: serde_json::json!({
                "tracking_number": shipment.tracking_number,
                "stage": job.stage,
                "iteration": job.iteration,
            }),
        };

        let pushes = contacts
            .iter()
            .filter_map(|c| c.fcm_token.as_deref())
            .map(|token| self.collaborators.notifier.push_fcm(token, payload.clone()));
        let results = join_all(pushes).await;

        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            tracing::warn!(tracking_number = %shipment.tracking_number, failed, "Some driver pushes failed");
        }
        results.len() - failed
    }

    async fn pause_matching(&self, current: Versioned<Shipment>, stage: DispatchStage) -> CoreResult<()> {
        let Versioned { value: mut shipment, version } = current;
        let now = self.clock.now();
        let round = shipment.matching.pause(stage);
        shipment.is_notification_pause = true;
        shipment.touch(now);

        let mut changes = ChangeSet::new();
        changes.put_shipment(shipment.clone(), Some(version));
        self.store.commit(changes).await?;

        tracing::info!(tracking_number = %shipment.tracking_number, stage = stage.as_str(), "Matching paused");
        let effects = vec![
            Effect::IdleTimer { stage, round },
            Effect::Notify(
                shipment.customer_id,
                Notification::new(
                    "No driver yet",
                    format!("No driver has accepted {} yet. Keep searching?", shipment.tracking_number),
                )
                .with_link(shipment_link(&shipment.tracking_number)),
            ),
        ];
        self.apply(&shipment.tracking_number, effects).await;
        Ok(())
    }

    // ========================================================================
    // Cancellation & completion
    // ========================================================================

    /// Customer or admin cancels → fee split, ledger cut, billing refund or close.
    pub async fn on_customer_or_admin_cancel(
        &self,
        actor: &Actor,
        tracking_number: &str,
        reason: CancellationReason,
        detail: Option<String>,
    ) -> CoreResult<CancellationOutcome> {
        let current = self.load_shipment(tracking_number).await?;
        let terminal = match actor.role {
            Role::Customer => StepKind::CustomerCancelled,
            _ => StepKind::SystemCancelled,
        };
        self.cancel(current, actor.clone(), reason, detail, vec![terminal], false).await
    }

    /// Matching ran out → system cancellation with reason OTHER.
    ///
    /// Returns `None` when the shipment no longer waits for a driver.
    pub async fn on_scheduler_exhausted(
        &self,
        tracking_number: &str,
        stage: DispatchStage,
    ) -> CoreResult<Option<CancellationOutcome>> {
        let current = self.load_shipment(tracking_number).await?;
        if !current.value.awaits_driver() {
            return Ok(None);
        }
        self.cancel_unmatched(current, stage).await.map(Some)
    }

    async fn cancel_unmatched(&self, current: Versioned<Shipment>, stage: DispatchStage) -> CoreResult<CancellationOutcome> {
        tracing::info!(
            tracking_number = %current.value.tracking_number,
            stage = stage.as_str(),
            "Matching exhausted, cancelling"
        );
        self.cancel(
            current,
            Actor::system(self.policy.operator_account_id),
            CancellationReason::Other,
            Some(format!("No driver accepted during {}", stage.as_str())),
            vec![StepKind::UninterestedDriver, StepKind::SystemCancelled],
            true,
        )
        .await
    }

    async fn cancel(
        &self,
        current: Versioned<Shipment>,
        actor: Actor,
        reason: CancellationReason,
        detail: Option<String>,
        terminal_kinds: Vec<StepKind>,
        unmatched: bool,
    ) -> CoreResult<CancellationOutcome> {
        let Versioned { value: mut shipment, version } = current;
        let tracking_number = shipment.tracking_number.clone();
        if shipment.is_terminal() || shipment.status == ShipmentStatus::Refund {
            return Err(CoreError::invalid_state(
                "SHIPMENT_NOT_CANCELLABLE",
                format!("Shipment {} is {:?}", tracking_number, shipment.status),
            ));
        }
        let quotation = shipment.latest_quotation().cloned().ok_or_else(|| {
            CoreError::invalid_state("NO_QUOTATION", format!("Shipment {} has no quotation", tracking_number))
        })?;
        let account = self.load_account(shipment.customer_id).await?;

        let now = self.clock.now();
        let fee = compute_fee(
            &self.policy.cancellation,
            &FeeInput {
                vehicle_class: shipment.vehicle_type.class,
                minutes_to_booking: shipment.minutes_to_booking(now),
                pickup_done: shipment.pickup_done(),
                driver_assigned: shipment.driver.is_some(),
                acceptance: shipment.driver_acceptance_status,
                outstanding_price: quotation.outstanding_price(),
                outstanding_cost: quotation.outstanding_cost(),
            },
        );
        let cash = shipment.payment_method == PaymentMethod::Cash;
        let refund_owed = cash && fee.for_customer > 0;

        let mut changes = ChangeSet::new();
        if cash {
            let Versioned { value: mut billing, version: billing_version } = self.load_billing(&tracking_number).await?;
            if refund_owed {
                let wht = if account.is_business {
                    wht_gross_up(fee.for_customer, self.policy.wht_percent)
                } else {
                    0
                };
                let amount_type = match fee.tier {
                    FeeTier::FullCustomerRefund => RefundAmountType::Full,
                    _ => RefundAmountType::Half,
                };
                billing.open_refund(amount_type, fee.for_customer, wht, detail.clone(), now)?;
            } else {
                billing.close_with_charge(detail.clone(), now)?;
                self.render(&mut billing, DocumentKind::Receipt, fee.for_operator, now).await;
            }
            changes.put_billing(billing, Some(billing_version));
        } else if fee.for_customer > 0 {
            changes.adjust_credit(CreditDelta {
                customer_id: shipment.customer_id,
                usage_delta: -fee.for_customer,
                outstanding_delta: 0,
                enforce_limit: false,
            });
        }

        let mut terminals: Vec<StepTemplate> = terminal_kinds
            .into_iter()
            .map(|kind| StepTemplate::new(kind).with_status(StepStatus::Done))
            .collect();
        if refund_owed {
            terminals.push(StepTemplate::new(StepKind::Refund).with_status(StepStatus::Progressing));
        }
        let cut = shipment.steps.current_seq();
        shipment.steps.truncate_from(cut, None, terminals, now)?;

        shipment.status = if refund_owed { ShipmentStatus::Refund } else { ShipmentStatus::Cancelled };
        if unmatched {
            shipment.driver_acceptance_status = DriverAcceptanceStatus::Uninterested;
        }
        shipment.is_notification_pause = false;
        shipment.matching.halt();
        shipment.cancellation = Some(CancellationRecord {
            reason,
            detail,
            cancelled_by: actor,
            fee,
            cancelled_at: now,
        });
        shipment.touch(now);

        if fee.for_operator > 0 {
            changes.record_transaction(Transaction::new(
                &tracking_number,
                TransactionRefType::CancellationFee,
                TransactionOwner::Operator,
                fee.for_operator,
                "Cancellation fee",
                now,
            ));
        }
        let mut effects = vec![Effect::CancelJobs, Effect::Feed(false)];
        if let Some(driver_id) = shipment.driver {
            if fee.for_driver > 0 {
                changes.record_transaction(Transaction::new(
                    &tracking_number,
                    TransactionRefType::DriverCompensation,
                    TransactionOwner::Driver(driver_id),
                    fee.for_driver,
                    "Cancellation compensation",
                    now,
                ));
            }
            effects.push(Effect::Notify(
                driver_id,
                Notification::new("Job cancelled", format!("Shipment {} was cancelled", tracking_number)),
            ));
        }
        effects.push(Effect::Notify(
            shipment.customer_id,
            Notification::new(
                "Shipment cancelled",
                format!("Shipment {} was cancelled; refund due {}", tracking_number, fee.for_customer),
            )
            .with_link(shipment_link(&tracking_number)),
        ));

        changes.put_shipment(shipment.clone(), Some(version));
        self.store.commit(changes).await?;

        tracing::info!(
            tracking_number = %tracking_number,
            tier = ?fee.tier,
            for_customer = fee.for_customer,
            for_operator = fee.for_operator,
            for_driver = fee.for_driver,
            "Shipment cancelled"
        );
        self.apply(&tracking_number, effects).await;
        Ok(CancellationOutcome { shipment, fee })
    }

    /// Driver completed the current delivery step → next step PROGRESSING.
    ///
    /// The final hop into FINISH goes through `on_finish_job`.
    pub async fn on_step_completed(&self, actor: &Actor, tracking_number: &str) -> CoreResult<Shipment> {
        let Versioned { value: mut shipment, version } = self.load_shipment(tracking_number).await?;
        if shipment.status != ShipmentStatus::Progressing
            || shipment.driver_acceptance_status != DriverAcceptanceStatus::Accepted
        {
            return Err(CoreError::invalid_state(
                "SHIPMENT_NOT_IN_PROGRESS",
                format!("Shipment {} is {:?}", tracking_number, shipment.status),
            ));
        }
        if !actor.is_admin() && shipment.driver != Some(actor.user_id) {
            return Err(CoreError::invalid_state(
                "NOT_ASSIGNED_DRIVER",
                format!("Driver {} is not assigned to {}", actor.user_id, tracking_number),
            ));
        }
        let next_kind = shipment.steps.step_at(shipment.steps.current_seq() + 1).map(|s| s.kind);
        if matches!(next_kind, None | Some(StepKind::Finish)) {
            return Err(CoreError::invalid_state(
                "FINISH_REQUIRED",
                format!("Shipment {} must be finished explicitly", tracking_number),
            ));
        }

        let now = self.clock.now();
        shipment.steps.advance(now);
        shipment.touch(now);

        let mut changes = ChangeSet::new();
        changes.put_shipment(shipment.clone(), Some(version));
        self.store.commit(changes).await?;

        let step = shipment.steps.current_step().map(|s| (s.kind, s.customer_message.clone()));
        tracing::debug!(tracking_number, step = ?step.as_ref().map(|s| s.0), "Step completed");
        if let Some((_, message)) = step {
            let effects = vec![Effect::Notify(
                shipment.customer_id,
                Notification::new(format!("Shipment {}", tracking_number), message),
            )];
            self.apply(tracking_number, effects).await;
        }
        Ok(shipment)
    }

    /// Last delivery step done → FINISH, receipt and ledger transactions.
    ///
    /// Cash shipments must have every non-refund payment settled first.
    pub async fn on_finish_job(&self, actor: &Actor, tracking_number: &str) -> CoreResult<Shipment> {
        let Versioned { value: mut shipment, version } = self.load_shipment(tracking_number).await?;
        if shipment.status != ShipmentStatus::Progressing
            || shipment.driver_acceptance_status != DriverAcceptanceStatus::Accepted
        {
            return Err(CoreError::invalid_state(
                "SHIPMENT_NOT_IN_PROGRESS",
                format!("Shipment {} is {:?}", tracking_number, shipment.status),
            ));
        }
        let next_kind = shipment.steps.step_at(shipment.steps.current_seq() + 1).map(|s| s.kind);
        if next_kind != Some(StepKind::Finish) {
            return Err(CoreError::invalid_state(
                "STEPS_INCOMPLETE",
                format!("Shipment {} has delivery steps left", tracking_number),
            ));
        }

        let now = self.clock.now();
        let mut changes = ChangeSet::new();
        if shipment.payment_method == PaymentMethod::Cash {
            let Versioned { value: mut billing, version: billing_version } = self.load_billing(tracking_number).await?;
            if !billing.is_paid_in_full() {
                return Err(CoreError::insufficient_funds(
                    "UNSETTLED_PAYMENT",
                    format!("Billing {} has unsettled payments", tracking_number),
                ));
            }
            let amount = billing.amount;
            self.render(&mut billing, DocumentKind::Receipt, amount, now).await;
            changes.put_billing(billing, Some(billing_version));
        }

        shipment.steps.advance(now);
        shipment.steps.settle_current(StepStatus::Done, now)?;
        shipment.status = ShipmentStatus::Delivered;
        shipment.touch(now);

        let existing: Vec<_> = self
            .store
            .transactions_for(tracking_number)
            .await?
            .iter()
            .map(|t| (t.ref_type, t.owner))
            .collect();
        if let Some(quotation) = shipment.latest_quotation() {
            let mut ledger = vec![(
                TransactionRefType::ShipmentIncome,
                TransactionOwner::Operator,
                quotation.margin(),
                "Shipment income",
            )];
            if let Some(driver_id) = shipment.driver {
                ledger.push((
                    TransactionRefType::DriverPayout,
                    TransactionOwner::Driver(driver_id),
                    quotation.cost.total,
                    "Driver payout",
                ));
            }
            for (ref_type, owner, amount, description) in ledger {
                if !existing.contains(&(ref_type, owner)) {
                    changes.record_transaction(Transaction::new(tracking_number, ref_type, owner, amount, description, now));
                }
            }
        }

        changes.put_shipment(shipment.clone(), Some(version));
        self.store.commit(changes).await?;

        tracing::info!(tracking_number, actor = %actor.user_id, "Shipment delivered");
        let effects = vec![Effect::Notify(
            shipment.customer_id,
            Notification::new("Shipment delivered", format!("Shipment {} is complete", tracking_number))
                .with_link(shipment_link(tracking_number)),
        )];
        self.apply(tracking_number, effects).await;
        Ok(shipment)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    pub(crate) async fn load_shipment(&self, tracking_number: &str) -> CoreResult<Versioned<Shipment>> {
        self.store
            .shipment(tracking_number)
            .await?
            .ok_or_else(|| CoreError::not_found("shipment", tracking_number))
    }

    pub(crate) async fn load_billing(&self, billing_number: &str) -> CoreResult<Versioned<Billing>> {
        self.store
            .billing(billing_number)
            .await?
            .ok_or_else(|| CoreError::not_found("billing", billing_number))
    }

    pub(crate) async fn load_account(&self, customer_id: Uuid) -> CoreResult<CustomerAccount> {
        self.store
            .account(customer_id)
            .await?
            .ok_or_else(|| CoreError::not_found("customer", customer_id.to_string()))
    }

    /// Favorite driver if pinned and available, otherwise a broadcast.
    async fn choose_stage(&self, shipment: &Shipment) -> (DispatchStage, Option<Uuid>) {
        if let Some(driver_id) = shipment.requested_driver {
            match self.collaborators.drivers.find_available(driver_id).await {
                Ok(Some(_)) => return (DispatchStage::FavoriteDriver, Some(driver_id)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(tracking_number = %shipment.tracking_number, error = %e, "Favorite driver lookup failed");
                }
            }
        }
        (DispatchStage::InitialBroadcast, None)
    }

    /// Render a document into the billing; failures leave it pending.
    pub(crate) async fn render(&self, billing: &mut Billing, kind: DocumentKind, amount: i64, now: DateTime<Utc>) {
        let request = DocumentRequest {
            kind,
            billing_number: billing.billing_number.clone(),
            customer_id: billing.customer_id,
            amount,
            detail: serde_json::json!({ "payment_method": billing.payment_method }),
        };
        let rendered = self.collaborators.documents.generate(&request).await;
        billing.attach_document(kind, amount, rendered, now);
    }

    async fn apply(&self, tracking_number: &str, effects: Vec<Effect>) {
        let now = self.clock.now();
        let notifier = &self.collaborators.notifier;
        for effect in effects {
            let result: CoreResult<()> = match effect {
                Effect::Notify(user_id, notification) => notifier.notify(user_id, notification).await,
                Effect::NotifyAdmins(notification) => notifier.notify_admins(notification).await,
                Effect::Feed(available) => {
                    notifier
                        .publish_feed(FeedUpdate {
                            tracking_number: tracking_number.to_string(),
                            available,
                        })
                        .await
                }
                Effect::CancelJobs => self.scheduler.cancel(tracking_number).await.map(|_| ()).map_err(Into::into),
                Effect::StartMatching { stage, driver_id, round } => self
                    .scheduler
                    .start(tracking_number, stage, driver_id, round, now)
                    .await
                    .map(|_| ())
                    .map_err(Into::into),
                Effect::IdleTimer { stage, round } => self
                    .scheduler
                    .start_idle_timer(tracking_number, stage, round, now)
                    .await
                    .map(|_| ())
                    .map_err(Into::into),
            };
            if let Err(e) = result {
                tracing::warn!(tracking_number, error = %e, "Post-commit side effect failed");
            }
        }
    }
}

fn shipment_link(tracking_number: &str) -> String {
    format!("/shipments/{}", tracking_number)
}
