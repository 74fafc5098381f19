use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::quotation::{Cost, Price};
use crate::CoreResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleClass {
    FourWheel,
    SixWheel,
    TenWheel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VehicleType {
    pub id: String,
    pub name: String,
    pub class: VehicleClass,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteRequest {
    /// Origin first, then every destination in visiting order.
    pub locations: Vec<Location>,
    pub vehicle_type: VehicleType,
    pub services: Vec<String>,
    pub is_round_trip: bool,
    pub discount_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub price: Price,
    pub cost: Cost,
    pub detail: serde_json::Value,
}

/// Pricing collaborator. Failures surface as `CoreError::ExternalFailure`.
#[async_trait]
pub trait PricingService: Send + Sync {
    async fn quote(&self, request: &QuoteRequest) -> CoreResult<Quote>;
}
