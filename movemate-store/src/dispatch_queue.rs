use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use movemate_shipment::dispatch::DispatchJob;
use movemate_shipment::queue::{DispatchQueue, QueueError};
use redis::AsyncCommands;
use tracing::debug;

// ============================================================================
// Redis delayed dispatch queue
// ============================================================================
//
// {prefix}:due            ZSET  job payload → due time (ms)
// {prefix}:inflight       ZSET  job payload → visibility deadline (ms)
// {prefix}:shipment:{tn}  SET   job payloads, for cancellation
//
// The payload is the job's JSON and a job's id is derived from its place in
// the escalation, so re-enqueuing a step lands on the existing member.
// Claims and requeues run as Lua scripts so two workers never take the same
// job.
//
// ============================================================================

const CLAIM_SCRIPT: &str = r#"
    local jobs = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, ARGV[2])
    for _, job in ipairs(jobs) do
        redis.call("ZREM", KEYS[1], job)
        redis.call("ZADD", KEYS[2], ARGV[3], job)
    end
    return jobs
"#;

const REQUEUE_SCRIPT: &str = r#"
    local jobs = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1])
    for _, job in ipairs(jobs) do
        redis.call("ZREM", KEYS[1], job)
        redis.call("ZADD", KEYS[2], ARGV[1], job)
    end
    return #jobs
"#;

const CANCEL_SCRIPT: &str = r#"
    local jobs = redis.call("SMEMBERS", KEYS[3])
    local removed = 0
    for _, job in ipairs(jobs) do
        removed = removed + redis.call("ZREM", KEYS[1], job)
        removed = removed + redis.call("ZREM", KEYS[2], job)
    end
    redis.call("DEL", KEYS[3])
    return removed
"#;

#[derive(Clone)]
pub struct RedisDispatchQueue {
    client: redis::Client,
    prefix: String,
    visibility: Duration,
}

impl RedisDispatchQueue {
    pub fn new(connection_string: &str, prefix: &str, visibility: Duration) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            visibility,
        })
    }

    fn due_key(&self) -> String {
        format!("{}:due", self.prefix)
    }

    fn inflight_key(&self) -> String {
        format!("{}:inflight", self.prefix)
    }

    fn shipment_key(&self, tracking_number: &str) -> String {
        format!("{}:shipment:{}", self.prefix, tracking_number)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(redis_error)
    }
}

fn redis_error(err: redis::RedisError) -> QueueError {
    QueueError::Backend(err.to_string())
}

fn encode_job(job: &DispatchJob) -> Result<String, QueueError> {
    serde_json::to_string(job).map_err(|e| QueueError::Payload(e.to_string()))
}

fn decode_job(payload: &str) -> Result<DispatchJob, QueueError> {
    serde_json::from_str(payload).map_err(|e| QueueError::Payload(e.to_string()))
}

#[async_trait]
impl DispatchQueue for RedisDispatchQueue {
    async fn enqueue(&self, job: &DispatchJob, deliver_at: DateTime<Utc>) -> Result<(), QueueError> {
        let member = encode_job(job)?;
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .zadd(self.due_key(), &member, deliver_at.timestamp_millis())
            .ignore()
            .sadd(self.shipment_key(&job.tracking_number), &member)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_error)?;
        debug!(tracking_number = %job.tracking_number, iteration = job.iteration, %deliver_at, "Dispatch job enqueued");
        Ok(())
    }

    async fn cancel_shipment(&self, tracking_number: &str) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let removed: usize = redis::Script::new(CANCEL_SCRIPT)
            .key(self.due_key())
            .key(self.inflight_key())
            .key(self.shipment_key(tracking_number))
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(removed)
    }

    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchJob>, QueueError> {
        let mut conn = self.connection().await?;
        let deadline = now + self.visibility;
        let payloads: Vec<String> = redis::Script::new(CLAIM_SCRIPT)
            .key(self.due_key())
            .key(self.inflight_key())
            .arg(now.timestamp_millis())
            .arg(limit)
            .arg(deadline.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        let mut jobs = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match decode_job(&payload) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    // An undecodable member would be redelivered forever.
                    tracing::error!(error = %e, "Discarding malformed dispatch job");
                    conn.zrem::<_, _, ()>(self.inflight_key(), &payload)
                        .await
                        .map_err(redis_error)?;
                }
            }
        }
        Ok(jobs)
    }

    async fn ack(&self, job: &DispatchJob) -> Result<(), QueueError> {
        let member = encode_job(job)?;
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .zrem(self.inflight_key(), &member)
            .ignore()
            .srem(self.shipment_key(&job.tracking_number), &member)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(redis_error)
    }

    async fn has_jobs(&self, tracking_number: &str) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let count: usize = conn.scard(self.shipment_key(tracking_number)).await.map_err(redis_error)?;
        Ok(count > 0)
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        redis::Script::new(REQUEUE_SCRIPT)
            .key(self.inflight_key())
            .key(self.due_key())
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use movemate_shipment::dispatch::DispatchStage;

    #[test]
    fn test_keys_are_namespaced() {
        let queue = RedisDispatchQueue::new("redis://localhost", "mm:dispatch", Duration::minutes(5)).unwrap();
        assert_eq!(queue.due_key(), "mm:dispatch:due");
        assert_eq!(queue.inflight_key(), "mm:dispatch:inflight");
        assert_eq!(queue.shipment_key("MM1"), "mm:dispatch:shipment:MM1");
    }

    #[test]
    fn test_job_payload_is_stable() {
        let job = DispatchJob::first("MM1", DispatchStage::InitialBroadcast, None, 4).successor();
        let payload = encode_job(&job).unwrap();
        let decoded = decode_job(&payload).unwrap();
        assert_eq!(decoded, job);
        // ack removes by member, so re-encoding must reproduce the member
        assert_eq!(encode_job(&decoded).unwrap(), payload);
    }

    #[test]
    fn test_rescheduled_successor_reuses_member() {
        let job = DispatchJob::first("MM1", DispatchStage::InitialBroadcast, None, 4);
        let once = encode_job(&job.successor()).unwrap();
        let again = encode_job(&job.successor()).unwrap();
        assert_eq!(once, again);
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        assert!(matches!(decode_job("{not json"), Err(QueueError::Payload(_))));
    }
}
