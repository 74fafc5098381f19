use chrono::{DateTime, Duration, NaiveDate, Utc};
use movemate_core::documents::DocumentKind;
use movemate_core::notification::Notification;
use movemate_core::{CoreError, CoreResult};
use serde::Serialize;
use uuid::Uuid;

use crate::billing::{Billing, BillingState};
use crate::dispatch::{DispatchJob, DispatchJobKind};
use crate::models::{AccountStatus, PaymentMethod, Shipment};
use crate::orchestrator::LifecycleOrchestrator;
use crate::repository::{ChangeSet, CreditDelta, Versioned};

// ============================================================================
// Periodic sweeps
// ============================================================================
//
// Each item commits on its own. A failing item is recorded in the report
// and the sweep moves on.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub key: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub processed: usize,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn record_failure(&mut self, key: &str, err: &CoreError) {
        tracing::warn!(key, code = err.code(), error = %err, "Sweep item failed");
        self.failures.push(SweepFailure {
            key: key.to_string(),
            code: err.code().to_string(),
            message: err.to_string(),
        });
    }

    fn record(&mut self, key: &str, result: CoreResult<bool>) {
        match result {
            Ok(true) => self.processed += 1,
            Ok(false) => {}
            Err(e) => self.record_failure(key, &e),
        }
    }
}

impl LifecycleOrchestrator {
    /// CURRENT past due → OVERDUE and the customer suspended.
    /// Overdue beyond the ban window → customer banned, admins told once.
    pub async fn check_overdue(&self) -> CoreResult<SweepReport> {
        let now = self.clock.now();
        let today = now.date_naive();
        let mut report = SweepReport::default();

        for current in self.store.billings_in_state(BillingState::Current).await? {
            if !current.value.is_past_due(today) {
                continue;
            }
            let key = current.value.billing_number.clone();
            let result = self.mark_billing_overdue(current, today, now).await;
            report.record(&key, result);
        }

        let mut banned: Vec<Uuid> = Vec::new();
        for overdue in self.store.billings_in_state(BillingState::Overdue).await? {
            let customer_id = overdue.value.customer_id;
            if overdue.value.days_overdue(today) <= self.policy.overdue_ban_days || banned.contains(&customer_id) {
                continue;
            }
            let result = self.ban_customer(customer_id).await;
            if matches!(result, Ok(true)) {
                banned.push(customer_id);
            }
            report.record(&overdue.value.billing_number, result);
        }

        if !banned.is_empty() {
            let lines: Vec<String> = banned.iter().map(|id| format!("Customer {} banned", id)).collect();
            let notification = Notification {
                title: format!("{} customers banned for overdue billing", banned.len()),
                messages: lines,
                links: Vec::new(),
            };
            if let Err(e) = self.collaborators.notifier.notify_admins(notification).await {
                tracing::warn!(error = %e, "Failed to notify admins about banned customers");
            }
        }

        tracing::info!(processed = report.processed, failures = report.failures.len(), "Overdue check finished");
        Ok(report)
    }

    async fn mark_billing_overdue(
        &self,
        current: Versioned<Billing>,
        today: NaiveDate,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let Versioned { value: mut billing, version } = current;
        if !billing.mark_overdue(today, now) {
            return Ok(false);
        }
        let account = self.load_account(billing.customer_id).await?;

        let mut changes = ChangeSet::new();
        if account.status == AccountStatus::Active {
            changes.set_account_status(account.id, AccountStatus::Inactive);
        }
        changes.put_billing(billing.clone(), Some(version));
        self.store.commit(changes).await?;

        tracing::info!(billing_number = %billing.billing_number, customer_id = %billing.customer_id, "Billing overdue");
        let notification = Notification::new(
            "Payment overdue",
            format!("Billing {} is overdue; your account is suspended until it is paid", billing.billing_number),
        );
        if let Err(e) = self.collaborators.notifier.notify(billing.customer_id, notification).await {
            tracing::warn!(billing_number = %billing.billing_number, error = %e, "Overdue notification failed");
        }
        Ok(true)
    }

    async fn ban_customer(&self, customer_id: Uuid) -> CoreResult<bool> {
        let account = self.load_account(customer_id).await?;
        if account.status == AccountStatus::Banned {
            return Ok(false);
        }
        let mut changes = ChangeSet::new();
        changes.set_account_status(customer_id, AccountStatus::Banned);
        self.store.commit(changes).await?;

        tracing::warn!(customer_id = %customer_id, "Customer banned for overdue billing");
        Ok(true)
    }

    /// Invoice every delivered or fee-charged credit shipment not yet billed.
    pub async fn issue_billing_cycle(&self, customer_id: Option<Uuid>) -> CoreResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for current in self.store.unbilled_credit_shipments(customer_id).await? {
            let key = current.value.tracking_number.clone();
            let result = self.bill_credit_shipment(current, now).await;
            report.record(&key, result);
        }

        tracing::info!(processed = report.processed, failures = report.failures.len(), "Billing cycle issued");
        Ok(report)
    }

    async fn bill_credit_shipment(&self, current: Versioned<Shipment>, now: DateTime<Utc>) -> CoreResult<bool> {
        let Versioned { value: mut shipment, version } = current;
        let tracking_number = shipment.tracking_number.clone();
        if self.store.billing(&tracking_number).await?.is_some() {
            return Err(CoreError::invalid_state(
                "BILLING_ALREADY_ISSUED",
                format!("Billing {} already exists", tracking_number),
            ));
        }
        let amount = shipment.billable_amount();
        if amount <= 0 {
            return Ok(false);
        }

        let due = now.date_naive() + Duration::days(self.policy.credit_term_days);
        let mut billing = Billing::issue(
            &tracking_number,
            shipment.customer_id,
            PaymentMethod::Credit,
            amount,
            Some(due),
            now,
        );
        self.render(&mut billing, DocumentKind::Invoice, amount, now).await;
        shipment.is_billed = true;
        shipment.touch(now);

        let mut changes = ChangeSet::new();
        changes
            .put_shipment(shipment.clone(), Some(version))
            .put_billing(billing, None)
            .adjust_credit(CreditDelta {
                customer_id: shipment.customer_id,
                usage_delta: 0,
                outstanding_delta: amount,
                enforce_limit: false,
            });
        self.store.commit(changes).await?;

        tracing::info!(billing_number = %tracking_number, amount, due = %due, "Credit billing issued");
        let notification = Notification::new(
            "Invoice issued",
            format!("Invoice {} for {} is due on {}", tracking_number, amount, due),
        );
        if let Err(e) = self.collaborators.notifier.notify(shipment.customer_id, notification).await {
            tracing::warn!(billing_number = %tracking_number, error = %e, "Invoice notification failed");
        }
        Ok(true)
    }

    /// Remind customers whose CURRENT billing falls due within the reminder
    /// window. Each billing is reminded once.
    pub async fn notify_nearby_duedate(&self) -> CoreResult<SweepReport> {
        let now = self.clock.now();
        let today = now.date_naive();
        let horizon = today + Duration::days(self.policy.due_soon_days);
        let mut report = SweepReport::default();

        for current in self.store.billings_in_state(BillingState::Current).await? {
            let billing = &current.value;
            let due = match billing.payment_due_date {
                Some(due)
                    if billing.due_reminded_at.is_none()
                        && billing.open_pay_payment().is_some()
                        && due >= today
                        && due <= horizon =>
                {
                    due
                }
                _ => continue,
            };
            let key = billing.billing_number.clone();
            let result = self.remind_due(current, due, now).await;
            report.record(&key, result);
        }

        tracing::info!(processed = report.processed, failures = report.failures.len(), "Due date reminders sent");
        Ok(report)
    }

    async fn remind_due(&self, current: Versioned<Billing>, due: NaiveDate, now: DateTime<Utc>) -> CoreResult<bool> {
        let Versioned { value: mut billing, version } = current;
        let notification = Notification::new(
            "Payment due soon",
            format!("Billing {} is due on {}", billing.billing_number, due),
        );
        self.collaborators.notifier.notify(billing.customer_id, notification).await?;

        billing.due_reminded_at = Some(now);
        billing.updated_at = now;
        let mut changes = ChangeSet::new();
        changes.put_billing(billing, Some(version));
        self.store.commit(changes).await?;
        Ok(true)
    }

    // ========================================================================
    // Matching reconciliation
    // ========================================================================

    /// Re-enqueue the next dispatch step for every shipment still looking for
    /// a driver that has no job in the queue.
    ///
    /// Queue writes run after the shipment commit, so a crash or a queue
    /// outage in between leaves matching stalled until this runs.
    pub async fn reconcile_matching(&self) -> CoreResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for current in self.store.shipments_awaiting_driver().await? {
            let shipment = current.value;
            let Some(job) = self.scheduler().pending_step(&shipment) else {
                continue;
            };
            let result = self.reseed_matching(&shipment, job, now).await;
            report.record(&shipment.tracking_number, result);
        }

        tracing::info!(processed = report.processed, failures = report.failures.len(), "Matching reconciled");
        Ok(report)
    }

    async fn reseed_matching(&self, shipment: &Shipment, job: DispatchJob, now: DateTime<Utc>) -> CoreResult<bool> {
        let scheduler = self.scheduler();
        if scheduler.queue().has_jobs(&shipment.tracking_number).await? {
            return Ok(false);
        }
        let deliver_at = match job.kind {
            DispatchJobKind::IdleCustomer => now + scheduler.policy().idle_customer_timeout(),
            DispatchJobKind::Notify => now,
        };
        scheduler.schedule(&job, deliver_at).await?;
        tracing::warn!(
            tracking_number = %shipment.tracking_number,
            stage = job.stage.as_str(),
            iteration = job.iteration,
            kind = ?job.kind,
            "Stalled matching re-enqueued"
        );
        Ok(true)
    }
}
