use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use movemate_core::CoreError;
use tokio::sync::Mutex;

use crate::dispatch::DispatchJob;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue backend error: {0}")]
    Backend(String),

    #[error("Invalid job payload: {0}")]
    Payload(String),
}

impl From<QueueError> for CoreError {
    fn from(err: QueueError) -> Self {
        CoreError::ExternalFailure(err.to_string())
    }
}

/// Delayed, at-least-once delivery of dispatch jobs.
///
/// `take_due` hands jobs out with a visibility deadline. A job that is not
/// acked before the deadline is put back by `requeue_expired`.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn enqueue(&self, job: &DispatchJob, deliver_at: DateTime<Utc>) -> Result<(), QueueError>;

    /// Remove every pending and in-flight job for a shipment.
    async fn cancel_shipment(&self, tracking_number: &str) -> Result<usize, QueueError>;

    /// Claim up to `limit` jobs due at `now`, earliest first.
    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchJob>, QueueError>;

    async fn ack(&self, job: &DispatchJob) -> Result<(), QueueError>;

    /// Whether any pending or in-flight job exists for a shipment.
    async fn has_jobs(&self, tracking_number: &str) -> Result<bool, QueueError>;

    /// Return expired in-flight jobs to the pending set.
    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError>;
}

#[derive(Default)]
struct QueueState {
    pending: Vec<(DateTime<Utc>, DispatchJob)>,
    in_flight: Vec<(DateTime<Utc>, DispatchJob)>,
}

/// Process-local queue used by tests and single-node setups.
pub struct MemoryDispatchQueue {
    state: Mutex<QueueState>,
    visibility: Duration,
}

impl MemoryDispatchQueue {
    pub fn new(visibility: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            visibility,
        }
    }

    /// Earliest delivery time among pending jobs.
    pub async fn next_due_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state.pending.iter().map(|(at, _)| *at).min()
    }

    pub async fn pending_for(&self, tracking_number: &str) -> Vec<(DateTime<Utc>, DispatchJob)> {
        let state = self.state.lock().await;
        state
            .pending
            .iter()
            .filter(|(_, job)| job.tracking_number == tracking_number)
            .cloned()
            .collect()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

impl Default for MemoryDispatchQueue {
    fn default() -> Self {
        Self::new(Duration::minutes(5))
    }
}

#[async_trait]
impl DispatchQueue for MemoryDispatchQueue {
    async fn enqueue(&self, job: &DispatchJob, deliver_at: DateTime<Utc>) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.pending.retain(|(_, existing)| existing.id != job.id);
        state.pending.push((deliver_at, job.clone()));
        Ok(())
    }

    async fn cancel_shipment(&self, tracking_number: &str) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let before = state.pending.len() + state.in_flight.len();
        state.pending.retain(|(_, job)| job.tracking_number != tracking_number);
        state.in_flight.retain(|(_, job)| job.tracking_number != tracking_number);
        Ok(before - state.pending.len() - state.in_flight.len())
    }

    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchJob>, QueueError> {
        let mut state = self.state.lock().await;
        state.pending.sort_by_key(|(at, _)| *at);

        let due = state
            .pending
            .iter()
            .take_while(|(at, _)| *at <= now)
            .take(limit)
            .count();
        let claimed: Vec<(DateTime<Utc>, DispatchJob)> = state.pending.drain(..due).collect();

        let deadline = now + self.visibility;
        let jobs = claimed.into_iter().map(|(_, job)| job).collect::<Vec<_>>();
        state
            .in_flight
            .extend(jobs.iter().cloned().map(|job| (deadline, job)));
        Ok(jobs)
    }

    async fn ack(&self, job: &DispatchJob) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.in_flight.retain(|(_, claimed)| claimed.id != job.id);
        Ok(())
    }

    async fn has_jobs(&self, tracking_number: &str) -> Result<bool, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .pending
            .iter()
            .chain(state.in_flight.iter())
            .any(|(_, job)| job.tracking_number == tracking_number))
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut state = self.state.lock().await;
        let (expired, live): (Vec<_>, Vec<_>) = state.in_flight.drain(..).partition(|(deadline, _)| *deadline <= now);
        state.in_flight = live;
        let count = expired.len();
        for (_, job) in expired {
            if !state.pending.iter().any(|(_, existing)| existing.id == job.id) {
                state.pending.push((now, job));
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchStage;

    fn job(tracking_number: &str) -> DispatchJob {
        DispatchJob::first(tracking_number, DispatchStage::InitialBroadcast, None, 1)
    }

    #[tokio::test]
    async fn test_take_due_respects_delay() {
        let queue = MemoryDispatchQueue::default();
        let now = Utc::now();
        queue.enqueue(&job("MM1"), now + Duration::minutes(10)).await.unwrap();
        queue.enqueue(&job("MM2"), now).await.unwrap();

        let due = queue.take_due(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].tracking_number, "MM2");
        assert_eq!(queue.next_due_at().await, Some(now + Duration::minutes(10)));
    }

    #[tokio::test]
    async fn test_unacked_jobs_come_back() {
        let queue = MemoryDispatchQueue::new(Duration::minutes(1));
        let now = Utc::now();
        queue.enqueue(&job("MM1"), now).await.unwrap();

        let claimed = queue.take_due(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(queue.requeue_expired(now).await.unwrap(), 0);

        let later = now + Duration::minutes(2);
        assert_eq!(queue.requeue_expired(later).await.unwrap(), 1);
        let again = queue.take_due(later, 10).await.unwrap();
        assert_eq!(again[0].id, claimed[0].id);

        queue.ack(&again[0]).await.unwrap();
        assert_eq!(queue.in_flight_len().await, 0);
    }

    #[tokio::test]
    async fn test_enqueueing_same_step_twice_keeps_one_job() {
        let queue = MemoryDispatchQueue::default();
        let now = Utc::now();
        let next = job("MM1").successor();
        queue.enqueue(&next, now + Duration::minutes(10)).await.unwrap();
        queue.enqueue(&job("MM1").successor(), now + Duration::minutes(12)).await.unwrap();

        let pending = queue.pending_for("MM1").await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.id, next.id);
    }

    #[tokio::test]
    async fn test_cancel_shipment_clears_pending_and_in_flight() {
        let queue = MemoryDispatchQueue::default();
        let now = Utc::now();
        queue.enqueue(&job("MM1"), now).await.unwrap();
        queue.take_due(now, 10).await.unwrap();
        let idle = DispatchJob::idle_timer("MM1", DispatchStage::InitialBroadcast, 1);
        queue.enqueue(&idle, now + Duration::minutes(30)).await.unwrap();
        queue.enqueue(&job("MM2"), now).await.unwrap();

        assert!(queue.has_jobs("MM1").await.unwrap());
        assert_eq!(queue.cancel_shipment("MM1").await.unwrap(), 2);
        assert!(!queue.has_jobs("MM1").await.unwrap());
        assert!(queue.pending_for("MM1").await.is_empty());
        assert_eq!(queue.pending_for("MM2").await.len(), 1);
    }
}
