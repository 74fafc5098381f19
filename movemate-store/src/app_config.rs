use movemate_shipment::LifecyclePolicy;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    pub pricing: PricingConfig,
    #[serde(default)]
    pub lifecycle: LifecyclePolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,
}

fn default_queue_prefix() -> String { "movemate:dispatch".into() }

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default)]
    pub topics: TopicConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TopicConfig {
    pub notifications: String,
    pub admin_notifications: String,
    pub pushes: String,
    pub feed: String,
    pub documents: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            notifications: "movemate.notifications".into(),
            admin_notifications: "movemate.admin-notifications".into(),
            pushes: "movemate.fcm-pushes".into(),
            feed: "movemate.shipment-feed".into(),
            documents: "movemate.documents".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub visibility_timeout_seconds: i64,
    /// How often overdue checks and due-date reminders run.
    pub sweep_interval_seconds: u64,
    /// How often shipments with stalled matching are re-enqueued.
    #[serde(default = "default_reconcile_interval_seconds")]
    pub reconcile_interval_seconds: u64,
}

fn default_reconcile_interval_seconds() -> u64 { 60 }

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 50,
            visibility_timeout_seconds: 300,
            sweep_interval_seconds: 3600,
            reconcile_interval_seconds: default_reconcile_interval_seconds(),
        }
    }
}

/// Rate table for quoting. Amounts are minor units.
#[derive(Debug, Deserialize, Clone)]
pub struct PricingConfig {
    pub rates: Vec<VehicleRate>,
    pub tax_percent: i64,
    /// Share of the pre-tax price paid to the driver.
    pub cost_percent: i64,
    #[serde(default)]
    pub droppoint_fee: i64,
    #[serde(default)]
    pub round_trip_percent: i64,
    #[serde(default)]
    pub service_fees: HashMap<String, i64>,
    #[serde(default)]
    pub discount_percent: HashMap<String, i64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VehicleRate {
    pub vehicle_type_id: String,
    pub base_fare: i64,
    pub per_km: i64,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. MOVEMATE__LIFECYCLE__WHT_PERCENT=3
            .add_source(config::Environment::with_prefix("MOVEMATE").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    const SAMPLE: &str = r#"
        [server]
        port = 8080

        [database]
        url = "postgres://localhost/movemate"

        [redis]
        url = "redis://localhost"

        [kafka]
        brokers = "localhost:9092"

        [auth]
        jwt_secret = "secret"

        [pricing]
        tax_percent = 7
        cost_percent = 80
        rates = [{ vehicle_type_id = "4W", base_fare = 30000, per_km = 1500 }]

        [lifecycle]
        wht_percent = 3

        [lifecycle.dispatch.second_broadcast]
        limit = 4
        interval_minutes = 5
    "#;

    fn parse(source: &str) -> Config {
        config::Config::builder()
            .add_source(File::from_str(source, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_partial_lifecycle_keeps_defaults() {
        let config = parse(SAMPLE);
        assert_eq!(config.lifecycle.wht_percent, 3);
        assert_eq!(config.lifecycle.overdue_ban_days, 16);
        assert_eq!(config.lifecycle.dispatch.second_broadcast.limit, 4);
        assert_eq!(config.lifecycle.dispatch.initial_broadcast.limit, 12);
        assert_eq!(config.lifecycle.cancellation.four_wheel.middle_minutes, 120);
    }

    #[test]
    fn test_optional_sections_default() {
        let config = parse(SAMPLE);
        assert_eq!(config.worker.batch_size, 50);
        assert_eq!(config.redis.queue_prefix, "movemate:dispatch");
        assert_eq!(config.kafka.topics.documents, "movemate.documents");
        assert_eq!(config.pricing.rates[0].per_km, 1500);
        assert!(config.pricing.service_fees.is_empty());
    }
}
