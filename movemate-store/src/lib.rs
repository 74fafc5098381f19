pub mod app_config;
pub mod database;
pub mod dispatch_queue;
pub mod drivers;
pub mod events;
pub mod pricing;

pub use app_config::Config;
pub use database::{DbClient, PgLifecycleStore};
pub use dispatch_queue::RedisDispatchQueue;
pub use drivers::PgDriverDirectory;
pub use events::{EventProducer, KafkaDocumentRequester, KafkaNotificationSink};
pub use pricing::RateTablePricing;
