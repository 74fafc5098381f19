use futures_util::future::join;
use movemate_shipment::LifecycleOrchestrator;
use movemate_store::app_config::WorkerConfig;
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{error, info};

/// Claims due dispatch jobs and delivers them, forever.
pub async fn start_dispatch_worker(orchestrator: Arc<LifecycleOrchestrator>, config: WorkerConfig) {
    info!(
        poll_interval_ms = config.poll_interval_ms,
        batch_size = config.batch_size,
        "Dispatch worker started"
    );
    let idle = Duration::from_millis(config.poll_interval_ms);

    loop {
        match orchestrator.process_due_jobs(config.batch_size).await {
            // A full batch means more may be waiting.
            Ok(claimed) if claimed >= config.batch_size => continue,
            Ok(_) => {}
            Err(e) => error!(code = e.code(), "Dispatch poll failed: {}", e),
        }
        sleep(idle).await;
    }
}

/// Runs the overdue check and due-date reminders on a fixed interval.
///
/// Billing cycles are issued on demand through the admin endpoint.
pub async fn start_billing_sweeper(orchestrator: Arc<LifecycleOrchestrator>, config: WorkerConfig) {
    info!(interval_seconds = config.sweep_interval_seconds, "Billing sweeper started");
    let mut ticker = interval(Duration::from_secs(config.sweep_interval_seconds.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let (overdue, reminders) = join(orchestrator.check_overdue(), orchestrator.notify_nearby_duedate()).await;
        match overdue {
            Ok(report) => info!(processed = report.processed, failures = report.failures.len(), "Overdue check done"),
            Err(e) => error!(code = e.code(), "Overdue check failed: {}", e),
        }
        match reminders {
            Ok(report) => info!(processed = report.processed, failures = report.failures.len(), "Due reminders sent"),
            Err(e) => error!(code = e.code(), "Due reminders failed: {}", e),
        }
    }
}

/// Re-enqueues matching for shipments whose dispatch jobs were lost.
pub async fn start_matching_reconciler(orchestrator: Arc<LifecycleOrchestrator>, config: WorkerConfig) {
    info!(interval_seconds = config.reconcile_interval_seconds, "Matching reconciler started");
    let mut ticker = interval(Duration::from_secs(config.reconcile_interval_seconds.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match orchestrator.reconcile_matching().await {
            Ok(report) => info!(processed = report.processed, failures = report.failures.len(), "Matching reconciled"),
            Err(e) => error!(code = e.code(), "Matching reconcile failed: {}", e),
        }
    }
}
