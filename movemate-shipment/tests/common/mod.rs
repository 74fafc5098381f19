#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use movemate_core::documents::{DocumentGenerator, DocumentRequest, GeneratedDocument};
use movemate_core::drivers::{DriverContact, DriverDirectory};
use movemate_core::notification::{FeedUpdate, Notification, NotificationSink, PushPayload};
use movemate_core::pricing::{Location, PricingService, Quote, QuoteRequest, VehicleClass, VehicleType};
use movemate_core::{Actor, Clock, CoreError, CoreResult, Cost, ManualClock, Price, Role};
use movemate_shipment::billing::{Billing, BillingState};
use movemate_shipment::dispatch::DispatchJob;
use movemate_shipment::models::{CustomerAccount, NewBooking, PaymentMethod, Shipment, Transaction};
use movemate_shipment::queue::{DispatchQueue, QueueError};
use movemate_shipment::repository::{ChangeSet, LifecycleStore, StoreError, Versioned};
use movemate_shipment::{Collaborators, LifecycleOrchestrator, LifecyclePolicy, MemoryDispatchQueue, MemoryStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

pub const PRICE: i64 = 1000;
pub const COST: i64 = 800;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
}

pub struct FixedPricing {
    pub fail: AtomicBool,
}

#[async_trait]
impl PricingService for FixedPricing {
    async fn quote(&self, request: &QuoteRequest) -> CoreResult<Quote> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreError::ExternalFailure("pricing unavailable".into()));
        }
        Ok(Quote {
            price: Price::fresh(PRICE, 0, 0),
            cost: Cost::fresh(COST, 0, 0),
            detail: serde_json::json!({ "vehicle_type": request.vehicle_type.id }),
        })
    }
}

pub struct RecordingNotifier {
    clock: Arc<ManualClock>,
    pub fail: AtomicBool,
    pub notes: Mutex<Vec<(Uuid, Notification)>>,
    pub admin_notes: Mutex<Vec<Notification>>,
    pub pushes: Mutex<Vec<(DateTime<Utc>, String, PushPayload)>>,
    pub feed: Mutex<Vec<FeedUpdate>>,
}

impl RecordingNotifier {
    pub fn push_count(&self) -> usize {
        self.pushes.lock().unwrap().len()
    }

    pub fn push_times(&self) -> Vec<DateTime<Utc>> {
        self.pushes.lock().unwrap().iter().map(|(at, _, _)| *at).collect()
    }

    pub fn titles_for(&self, user_id: Uuid) -> Vec<String> {
        self.notes
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == user_id)
            .map(|(_, n)| n.title.clone())
            .collect()
    }

    fn check(&self) -> CoreResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(CoreError::ExternalFailure("notification gateway down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, user_id: Uuid, notification: Notification) -> CoreResult<()> {
        self.check()?;
        self.notes.lock().unwrap().push((user_id, notification));
        Ok(())
    }

    async fn notify_admins(&self, notification: Notification) -> CoreResult<()> {
        self.check()?;
        self.admin_notes.lock().unwrap().push(notification);
        Ok(())
    }

    async fn push_fcm(&self, token: &str, payload: PushPayload) -> CoreResult<()> {
        self.check()?;
        self.pushes.lock().unwrap().push((self.clock.now(), token.to_string(), payload));
        Ok(())
    }

    async fn publish_feed(&self, update: FeedUpdate) -> CoreResult<()> {
        self.check()?;
        self.feed.lock().unwrap().push(update);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDocuments {
    pub fail: AtomicBool,
    pub rendered: Mutex<Vec<DocumentRequest>>,
}

#[async_trait]
impl DocumentGenerator for FakeDocuments {
    async fn generate(&self, request: &DocumentRequest) -> CoreResult<GeneratedDocument> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CoreError::ExternalFailure("renderer down".into()));
        }
        let mut rendered = self.rendered.lock().unwrap();
        rendered.push(request.clone());
        Ok(GeneratedDocument {
            document_id: format!("DOC-{}", rendered.len()),
            file: Some(format!("{}.pdf", request.billing_number)),
        })
    }
}

#[derive(Default)]
pub struct FakeDrivers {
    pub online: Mutex<Vec<DriverContact>>,
}

impl FakeDrivers {
    pub fn add(&self, driver_id: Uuid, token: &str) {
        self.online.lock().unwrap().push(DriverContact {
            driver_id,
            fcm_token: Some(token.to_string()),
        });
    }
}

#[async_trait]
impl DriverDirectory for FakeDrivers {
    async fn available_drivers(&self, _vehicle_type_id: &str) -> CoreResult<Vec<DriverContact>> {
        Ok(self.online.lock().unwrap().clone())
    }

    async fn find_available(&self, driver_id: Uuid) -> CoreResult<Option<DriverContact>> {
        Ok(self.online.lock().unwrap().iter().find(|d| d.driver_id == driver_id).cloned())
    }
}

/// Queue whose writes can be switched off to simulate a Redis outage.
pub struct FlakyQueue {
    inner: Arc<MemoryDispatchQueue>,
    pub fail: AtomicBool,
}

impl FlakyQueue {
    fn check(&self) -> Result<(), QueueError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(QueueError::Backend("queue unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DispatchQueue for FlakyQueue {
    async fn enqueue(&self, job: &DispatchJob, deliver_at: DateTime<Utc>) -> Result<(), QueueError> {
        self.check()?;
        self.inner.enqueue(job, deliver_at).await
    }

    async fn cancel_shipment(&self, tracking_number: &str) -> Result<usize, QueueError> {
        self.check()?;
        self.inner.cancel_shipment(tracking_number).await
    }

    async fn take_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DispatchJob>, QueueError> {
        self.inner.take_due(now, limit).await
    }

    async fn ack(&self, job: &DispatchJob) -> Result<(), QueueError> {
        self.inner.ack(job).await
    }

    async fn has_jobs(&self, tracking_number: &str) -> Result<bool, QueueError> {
        self.inner.has_jobs(tracking_number).await
    }

    async fn requeue_expired(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        self.inner.requeue_expired(now).await
    }
}

/// Store that can park the next commit until released, to interleave two
/// handlers deterministically.
pub struct GatedStore {
    inner: Arc<MemoryStore>,
    hold: AtomicBool,
    pub reached: Notify,
    pub release: Notify,
}

impl GatedStore {
    /// Park the next commit: it signals `reached` and waits for `release`.
    pub fn hold_next_commit(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LifecycleStore for GatedStore {
    async fn shipment(&self, tracking_number: &str) -> Result<Option<Versioned<Shipment>>, StoreError> {
        self.inner.shipment(tracking_number).await
    }

    async fn billing(&self, billing_number: &str) -> Result<Option<Versioned<Billing>>, StoreError> {
        self.inner.billing(billing_number).await
    }

    async fn account(&self, customer_id: Uuid) -> Result<Option<CustomerAccount>, StoreError> {
        self.inner.account(customer_id).await
    }

    async fn billings_in_state(&self, state: BillingState) -> Result<Vec<Versioned<Billing>>, StoreError> {
        self.inner.billings_in_state(state).await
    }

    async fn unbilled_credit_shipments(
        &self,
        customer_id: Option<Uuid>,
    ) -> Result<Vec<Versioned<Shipment>>, StoreError> {
        self.inner.unbilled_credit_shipments(customer_id).await
    }

    async fn shipments_awaiting_driver(&self) -> Result<Vec<Versioned<Shipment>>, StoreError> {
        self.inner.shipments_awaiting_driver().await
    }

    async fn transactions_for(&self, tracking_number: &str) -> Result<Vec<Transaction>, StoreError> {
        self.inner.transactions_for(tracking_number).await
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), StoreError> {
        if self.hold.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
        self.inner.commit(changes).await
    }
}

pub struct Harness {
    pub orchestrator: LifecycleOrchestrator,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryDispatchQueue>,
    pub queue_outage: Arc<FlakyQueue>,
    pub gate: Arc<GatedStore>,
    pub clock: Arc<ManualClock>,
    pub pricing: Arc<FixedPricing>,
    pub notifier: Arc<RecordingNotifier>,
    pub documents: Arc<FakeDocuments>,
    pub drivers: Arc<FakeDrivers>,
    pub customer: CustomerAccount,
    pub admin: Actor,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_account(100_000, false).await
    }

    pub async fn with_account(credit_limit: i64, is_business: bool) -> Self {
        let clock = Arc::new(ManualClock::new(start_time()));
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryDispatchQueue::new(Duration::minutes(1)));
        let pricing = Arc::new(FixedPricing { fail: AtomicBool::new(false) });
        let notifier = Arc::new(RecordingNotifier {
            clock: clock.clone(),
            fail: AtomicBool::new(false),
            notes: Mutex::new(Vec::new()),
            admin_notes: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
            feed: Mutex::new(Vec::new()),
        });
        let documents = Arc::new(FakeDocuments::default());
        let drivers = Arc::new(FakeDrivers::default());

        let customer = CustomerAccount::new(Uuid::new_v4(), credit_limit, is_business);
        store.insert_account(customer.clone()).await;

        let collaborators = Collaborators {
            pricing: pricing.clone(),
            notifier: notifier.clone(),
            documents: documents.clone(),
            drivers: drivers.clone(),
        };
        let policy = LifecyclePolicy {
            operator_account_id: Uuid::new_v4(),
            ..LifecyclePolicy::default()
        };
        let queue_outage = Arc::new(FlakyQueue {
            inner: queue.clone(),
            fail: AtomicBool::new(false),
        });
        let gate = Arc::new(GatedStore {
            inner: store.clone(),
            hold: AtomicBool::new(false),
            reached: Notify::new(),
            release: Notify::new(),
        });
        let orchestrator =
            LifecycleOrchestrator::new(gate.clone(), queue_outage.clone(), collaborators, clock.clone(), policy);

        Self {
            orchestrator,
            store,
            queue,
            queue_outage,
            gate,
            clock,
            pricing,
            notifier,
            documents,
            drivers,
            customer,
            admin: Actor::new(Uuid::new_v4(), Role::Admin),
        }
    }

    pub fn customer_actor(&self) -> Actor {
        Actor::new(self.customer.id, Role::Customer)
    }

    pub fn booking(&self, tracking_number: &str, method: PaymentMethod, minutes_out: i64) -> NewBooking {
        let stop = |name: &str| Location {
            name: name.to_string(),
            latitude: 13.75,
            longitude: 100.5,
        };
        NewBooking {
            tracking_number: tracking_number.to_string(),
            customer_id: self.customer.id,
            payment_method: method,
            booking_date_time: self.clock.now() + Duration::minutes(minutes_out),
            vehicle_type: VehicleType {
                id: "4W-PICKUP".to_string(),
                name: "Pickup truck".to_string(),
                class: VehicleClass::FourWheel,
            },
            locations: vec![stop("Warehouse"), stop("Store")],
            is_round_trip: false,
            services: Vec::new(),
            requested_driver: None,
            discount_code: None,
        }
    }

    pub async fn shipment(&self, tracking_number: &str) -> Shipment {
        self.orchestrator.shipment(tracking_number).await.unwrap()
    }

    /// Deliver due jobs, moving the clock to the next due job whenever
    /// nothing is due, until `stop` holds or the queue is empty.
    pub async fn pump_until<F>(&self, tracking_number: &str, stop: F)
    where
        F: Fn(&Shipment) -> bool,
    {
        for _ in 0..500 {
            if stop(&self.shipment(tracking_number).await) {
                return;
            }
            let claimed = self.orchestrator.process_due_jobs(50).await.unwrap();
            if claimed == 0 {
                match self.queue.next_due_at().await {
                    Some(at) if at > self.clock.now() => self.clock.set(at),
                    Some(_) => {}
                    None => return,
                }
            }
        }
        panic!("dispatch loop did not settle");
    }

    /// Approve the single cash payment on a billing.
    pub async fn approve(&self, tracking_number: &str) {
        let billing = self.orchestrator.billing(tracking_number).await.unwrap();
        let payment_id = billing.payments[0].id;
        self.orchestrator
            .on_payment_approved(&self.admin, tracking_number, payment_id)
            .await
            .unwrap();
    }

    /// Accept as `driver` and walk the steps up to the last one before FINISH.
    pub async fn deliver_until_finish(&self, tracking_number: &str, driver: &Actor) {
        self.orchestrator.on_driver_accepted(driver, tracking_number).await.unwrap();
        while self.orchestrator.on_step_completed(driver, tracking_number).await.is_ok() {}
    }
}

pub fn driver_actor() -> Actor {
    Actor::new(Uuid::new_v4(), Role::Driver)
}

pub fn assert_ledger_consistent(shipment: &Shipment) {
    shipment
        .steps
        .check_invariants(shipment.is_terminal())
        .unwrap_or_else(|e| panic!("{}: {}", shipment.tracking_number, e));
}
