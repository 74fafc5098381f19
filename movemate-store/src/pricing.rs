use async_trait::async_trait;
use movemate_core::pricing::{Location, PricingService, Quote, QuoteRequest};
use movemate_core::{CoreError, CoreResult, Cost, Price};
use std::collections::HashMap;

use crate::app_config::PricingConfig;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two stops.
fn haversine_km(a: &Location, b: &Location) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Case-insensitive table lookup; config sources may fold key case.
fn lookup(table: &HashMap<String, i64>, key: &str) -> Option<i64> {
    table
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| *v)
}

fn route_km(locations: &[Location]) -> f64 {
    locations.windows(2).map(|pair| haversine_km(&pair[0], &pair[1])).sum()
}

/// Quotes from a static per-vehicle rate table.
pub struct RateTablePricing {
    config: PricingConfig,
}

impl RateTablePricing {
    pub fn new(config: PricingConfig) -> Self {
        Self { config }
    }

    fn price(&self, request: &QuoteRequest) -> CoreResult<Quote> {
        if request.locations.len() < 2 {
            return Err(CoreError::invalid_state(
                "INVALID_ROUTE",
                "A booking needs a pickup and at least one drop-off",
            ));
        }
        let rate = self
            .config
            .rates
            .iter()
            .find(|r| r.vehicle_type_id == request.vehicle_type.id)
            .ok_or_else(|| {
                CoreError::invalid_state(
                    "UNKNOWN_VEHICLE_TYPE",
                    format!("No rate for vehicle type {}", request.vehicle_type.id),
                )
            })?;

        let km = route_km(&request.locations);
        let distance_charge = (rate.per_km as f64 * km).round() as i64;
        let extra_drops = (request.locations.len() as i64 - 2).max(0);
        let droppoint = extra_drops * self.config.droppoint_fee;
        let services: i64 = request
            .services
            .iter()
            .filter_map(|s| lookup(&self.config.service_fees, s))
            .sum();

        let mut sub_total = rate.base_fare + distance_charge + droppoint + services;
        if request.is_round_trip {
            sub_total += sub_total * self.config.round_trip_percent / 100;
        }
        let discount = request
            .discount_code
            .as_ref()
            .and_then(|code| lookup(&self.config.discount_percent, code))
            .map(|pct| sub_total * pct.clamp(0, 100) / 100)
            .unwrap_or(0);
        sub_total -= discount;

        let tax = sub_total * self.config.tax_percent / 100;
        let cost_sub_total = sub_total * self.config.cost_percent / 100;

        tracing::debug!(
            vehicle_type = %request.vehicle_type.id,
            km,
            sub_total,
            tax,
            discount,
            "Quoted booking"
        );
        Ok(Quote {
            price: Price::fresh(sub_total, tax, droppoint),
            cost: Cost::fresh(cost_sub_total, 0, droppoint),
            detail: serde_json::json!({
                "distance_km": km,
                "base_fare": rate.base_fare,
                "distance_charge": distance_charge,
                "services": services,
                "discount": discount,
            }),
        })
    }
}

#[async_trait]
impl PricingService for RateTablePricing {
    async fn quote(&self, request: &QuoteRequest) -> CoreResult<Quote> {
        self.price(request)
    }
}
