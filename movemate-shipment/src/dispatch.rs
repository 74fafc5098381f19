use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::Shipment;
use crate::policy::DispatchPolicy;
use crate::queue::{DispatchQueue, QueueError};

// ============================================================================
// Dispatch Scheduler
// ============================================================================
//
// A job's (stage, iteration, round) travels in its payload; the queue keeps
// no other state between firings. Every firing is re-planned against the
// shipment as currently stored, so duplicate or stale deliveries are inert.
//
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchStage {
    FavoriteDriver,
    InitialBroadcast,
    SecondBroadcast,
}

impl DispatchStage {
    /// Stage a paused shipment resumes into.
    pub fn next(&self) -> Option<DispatchStage> {
        match self {
            DispatchStage::FavoriteDriver => Some(DispatchStage::InitialBroadcast),
            DispatchStage::InitialBroadcast => Some(DispatchStage::SecondBroadcast),
            DispatchStage::SecondBroadcast => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStage::FavoriteDriver => "FAVORITE_DRIVER",
            DispatchStage::InitialBroadcast => "INITIAL_BROADCAST",
            DispatchStage::SecondBroadcast => "SECOND_BROADCAST",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchJobKind {
    Notify,
    /// Fires once after a pause prompt went unanswered.
    IdleCustomer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchJob {
    pub id: Uuid,
    pub tracking_number: String,
    pub driver_id: Option<Uuid>,
    pub stage: DispatchStage,
    pub iteration: u32,
    pub round: u64,
    pub kind: DispatchJobKind,
}

impl DispatchJob {
    /// A job is identified by where it sits in the escalation, so enqueuing
    /// the same step twice yields the same job.
    pub fn new(
        tracking_number: &str,
        stage: DispatchStage,
        driver_id: Option<Uuid>,
        iteration: u32,
        round: u64,
        kind: DispatchJobKind,
    ) -> Self {
        let key = format!("{}:{}:{}:{}:{:?}", tracking_number, round, stage.as_str(), iteration, kind);
        Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()),
            tracking_number: tracking_number.to_string(),
            driver_id,
            stage,
            iteration,
            round,
            kind,
        }
    }

    pub fn first(tracking_number: &str, stage: DispatchStage, driver_id: Option<Uuid>, round: u64) -> Self {
        Self::new(tracking_number, stage, driver_id, 1, round, DispatchJobKind::Notify)
    }

    pub fn idle_timer(tracking_number: &str, stage: DispatchStage, round: u64) -> Self {
        Self::new(tracking_number, stage, None, 1, round, DispatchJobKind::IdleCustomer)
    }

    /// The same stage one iteration later.
    pub fn successor(&self) -> Self {
        Self::new(
            &self.tracking_number,
            self.stage,
            self.driver_id,
            self.iteration + 1,
            self.round,
            self.kind,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    ShipmentMissing,
    NotAwaitingDriver,
    StaleRound,
    Paused,
    NotPaused,
    /// This iteration already notified drivers in the current round.
    AlreadyFired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyTarget {
    Driver(Uuid),
    VehicleType(String),
}

/// What a job delivery should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Firing {
    Drop(DropReason),
    Notify {
        target: NotifyTarget,
        next: DispatchJob,
        delay: Duration,
    },
    Exhausted(DispatchStage),
    IdleTimeout(DispatchStage),
}

pub struct DispatchScheduler {
    queue: Arc<dyn DispatchQueue>,
    policy: DispatchPolicy,
}

impl DispatchScheduler {
    pub fn new(queue: Arc<dyn DispatchQueue>, policy: DispatchPolicy) -> Self {
        Self { queue, policy }
    }

    pub fn queue(&self) -> &Arc<dyn DispatchQueue> {
        &self.queue
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Decide a delivery against the stored shipment. Pure.
    pub fn plan(&self, job: &DispatchJob, shipment: Option<&Shipment>) -> Firing {
        let Some(shipment) = shipment else {
            return Firing::Drop(DropReason::ShipmentMissing);
        };
        if !shipment.awaits_driver() {
            return Firing::Drop(DropReason::NotAwaitingDriver);
        }
        if job.round != shipment.matching.round {
            return Firing::Drop(DropReason::StaleRound);
        }

        match job.kind {
            DispatchJobKind::IdleCustomer if shipment.is_notification_pause => Firing::IdleTimeout(job.stage),
            DispatchJobKind::IdleCustomer => Firing::Drop(DropReason::NotPaused),
            DispatchJobKind::Notify if shipment.is_notification_pause => Firing::Drop(DropReason::Paused),
            DispatchJobKind::Notify if job.iteration <= shipment.matching.fired_iteration => {
                Firing::Drop(DropReason::AlreadyFired)
            }
            DispatchJobKind::Notify => {
                let stage = self.policy.stage(job.stage);
                if job.iteration > stage.limit {
                    return Firing::Exhausted(job.stage);
                }
                let target = match job.driver_id {
                    Some(driver_id) => NotifyTarget::Driver(driver_id),
                    None => NotifyTarget::VehicleType(shipment.vehicle_type.id.clone()),
                };
                Firing::Notify {
                    target,
                    next: job.successor(),
                    delay: stage.interval(),
                }
            }
        }
    }

    /// Enqueue the first firing of a stage, due immediately.
    pub async fn start(
        &self,
        tracking_number: &str,
        stage: DispatchStage,
        driver_id: Option<Uuid>,
        round: u64,
        now: DateTime<Utc>,
    ) -> Result<DispatchJob, QueueError> {
        let job = DispatchJob::first(tracking_number, stage, driver_id, round);
        self.queue.enqueue(&job, now).await?;
        tracing::debug!(tracking_number, stage = stage.as_str(), round, "Matching stage started");
        Ok(job)
    }

    pub async fn schedule(&self, job: &DispatchJob, deliver_at: DateTime<Utc>) -> Result<(), QueueError> {
        self.queue.enqueue(job, deliver_at).await
    }

    pub async fn start_idle_timer(
        &self,
        tracking_number: &str,
        stage: DispatchStage,
        round: u64,
        now: DateTime<Utc>,
    ) -> Result<DispatchJob, QueueError> {
        let job = DispatchJob::idle_timer(tracking_number, stage, round);
        self.queue
            .enqueue(&job, now + self.policy.idle_customer_timeout())
            .await?;
        Ok(job)
    }

    /// The job that carries a shipment's matching forward from its stored
    /// state: the next unfired iteration, or the idle timer while paused.
    pub fn pending_step(&self, shipment: &Shipment) -> Option<DispatchJob> {
        if !shipment.awaits_driver() {
            return None;
        }
        let tracking_number = shipment.tracking_number.as_str();
        let round = shipment.matching.round;
        if shipment.is_notification_pause {
            let stage = shipment.matching.paused_stage?;
            return Some(DispatchJob::idle_timer(tracking_number, stage, round));
        }
        let stage = shipment.matching.stage?;
        let driver_id = match stage {
            DispatchStage::FavoriteDriver => shipment.requested_driver,
            _ => None,
        };
        Some(DispatchJob::new(
            tracking_number,
            stage,
            driver_id,
            shipment.matching.fired_iteration + 1,
            round,
            DispatchJobKind::Notify,
        ))
    }

    pub async fn cancel(&self, tracking_number: &str) -> Result<usize, QueueError> {
        let removed = self.queue.cancel_shipment(tracking_number).await?;
        tracing::debug!(tracking_number, removed, "Dispatch jobs cancelled");
        Ok(removed)
    }
}
