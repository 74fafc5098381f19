pub mod billing;
pub mod cancellation;
pub mod dispatch;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod policy;
pub mod queue;
pub mod repository;
pub mod step;
pub mod sweeps;

pub use billing::{Billing, BillingState, BillingStatus};
pub use dispatch::{DispatchJob, DispatchScheduler, DispatchStage};
pub use ledger::StepLedger;
pub use models::{CancellationReason, CustomerAccount, NewBooking, PaymentMethod, Shipment, ShipmentStatus};
pub use orchestrator::{CancellationOutcome, Collaborators, JobOutcome, LifecycleOrchestrator};
pub use policy::LifecyclePolicy;
pub use queue::{DispatchQueue, MemoryDispatchQueue};
pub use repository::{LifecycleStore, MemoryStore};
pub use sweeps::SweepReport;
