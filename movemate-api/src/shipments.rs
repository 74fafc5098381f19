use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use movemate_core::pricing::{Location, VehicleType};
use movemate_core::{Actor, Role};
use movemate_shipment::cancellation::CancellationFee;
use movemate_shipment::{CancellationReason, NewBooking, PaymentMethod, Shipment};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateShipmentRequest {
    /// Admins book on behalf of a customer; customers always book for themselves.
    pub customer_id: Option<Uuid>,
    pub payment_method: PaymentMethod,
    /// When the customer wants the pickup. Fee tiers are measured from it.
    pub booking_date_time: DateTime<Utc>,
    pub vehicle_type: VehicleType,
    pub locations: Vec<Location>,
    #[serde(default)]
    pub is_round_trip: bool,
    #[serde(default)]
    pub services: Vec<String>,
    pub requested_driver: Option<Uuid>,
    pub discount_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelShipmentRequest {
    pub reason: CancellationReason,
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelShipmentResponse {
    pub shipment: Shipment,
    pub fee: CancellationFee,
}

// ============================================================================
// Routes
// ============================================================================

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/shipments", post(create_shipment))
        .route("/v1/shipments/{tn}", get(get_shipment))
        .route("/v1/shipments/{tn}/accept", post(accept_shipment))
        .route("/v1/shipments/{tn}/cancel", post(cancel_shipment))
        .route("/v1/shipments/{tn}/driver-cancel", post(driver_cancel))
        .route("/v1/shipments/{tn}/next-step", post(next_step))
        .route("/v1/shipments/{tn}/finish", post(finish_shipment))
        .route("/v1/shipments/{tn}/resume-matching", post(resume_matching))
}

/// `MM` plus ten upper-case hex digits.
pub fn new_tracking_number() -> String {
    let id = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("MM{}", &id[..10])
}

/// Customers see their own shipments, drivers the ones they hold or can
/// still accept, admins everything.
fn can_view(actor: &Actor, shipment: &Shipment) -> bool {
    match actor.role {
        Role::Admin | Role::System => true,
        Role::Customer => shipment.customer_id == actor.user_id,
        Role::Driver => shipment.driver == Some(actor.user_id) || shipment.awaits_driver(),
    }
}

fn require_role(actor: &Actor, allowed: &[Role]) -> Result<(), AppError> {
    if actor.is_admin() || allowed.contains(&actor.role) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!("{:?} may not perform this action", actor.role)))
    }
}

async fn load_visible(state: &AppState, actor: &Actor, tn: &str) -> Result<Shipment, AppError> {
    let shipment = state.orchestrator.shipment(tn).await?;
    if !can_view(actor, &shipment) {
        return Err(AppError::Forbidden(format!("Shipment {} belongs to someone else", tn)));
    }
    Ok(shipment)
}

// ============================================================================
// Handlers
// ============================================================================

async fn create_shipment(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<CreateShipmentRequest>,
) -> Result<(StatusCode, Json<Shipment>), AppError> {
    let customer_id = match actor.role {
        Role::Customer => actor.user_id,
        Role::Admin => req
            .customer_id
            .ok_or_else(|| AppError::BadRequest("customer_id is required for admin bookings".into()))?,
        _ => return Err(AppError::Forbidden("Only customers and admins can book".into())),
    };

    let booking = NewBooking {
        tracking_number: new_tracking_number(),
        customer_id,
        payment_method: req.payment_method,
        booking_date_time: req.booking_date_time,
        vehicle_type: req.vehicle_type,
        locations: req.locations,
        is_round_trip: req.is_round_trip,
        services: req.services,
        requested_driver: req.requested_driver,
        discount_code: req.discount_code,
    };

    let shipment = state.orchestrator.on_booking_created(&actor, booking).await?;
    Ok((StatusCode::CREATED, Json(shipment)))
}

async fn get_shipment(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(tn): Path<String>,
) -> Result<Json<Shipment>, AppError> {
    Ok(Json(load_visible(&state, &actor, &tn).await?))
}

async fn accept_shipment(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(tn): Path<String>,
) -> Result<Json<Shipment>, AppError> {
    if actor.role != Role::Driver {
        return Err(AppError::Forbidden("Only drivers can accept shipments".into()));
    }
    Ok(Json(state.orchestrator.on_driver_accepted(&actor, &tn).await?))
}

async fn cancel_shipment(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(tn): Path<String>,
    Json(req): Json<CancelShipmentRequest>,
) -> Result<Json<CancelShipmentResponse>, AppError> {
    require_role(&actor, &[Role::Customer])?;
    load_visible(&state, &actor, &tn).await?;

    let outcome = state
        .orchestrator
        .on_customer_or_admin_cancel(&actor, &tn, req.reason, req.detail)
        .await?;
    Ok(Json(CancelShipmentResponse {
        shipment: outcome.shipment,
        fee: outcome.fee,
    }))
}

async fn driver_cancel(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(tn): Path<String>,
) -> Result<Json<Shipment>, AppError> {
    require_role(&actor, &[Role::Driver])?;
    Ok(Json(state.orchestrator.on_driver_cancel_after_accept(&actor, &tn).await?))
}

async fn next_step(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(tn): Path<String>,
) -> Result<Json<Shipment>, AppError> {
    require_role(&actor, &[Role::Driver])?;
    Ok(Json(state.orchestrator.on_step_completed(&actor, &tn).await?))
}

async fn finish_shipment(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(tn): Path<String>,
) -> Result<Json<Shipment>, AppError> {
    require_role(&actor, &[Role::Driver])?;
    let shipment = load_visible(&state, &actor, &tn).await?;
    if !actor.is_admin() && shipment.driver != Some(actor.user_id) {
        return Err(AppError::Forbidden(format!("Shipment {} is assigned to another driver", tn)));
    }
    Ok(Json(state.orchestrator.on_finish_job(&actor, &tn).await?))
}

async fn resume_matching(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(tn): Path<String>,
) -> Result<Json<Shipment>, AppError> {
    require_role(&actor, &[Role::Customer])?;
    load_visible(&state, &actor, &tn).await?;
    Ok(Json(state.orchestrator.on_matching_resumed(&actor, &tn).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking_numbers_are_prefixed_and_unique() {
        let a = new_tracking_number();
        let b = new_tracking_number();
        assert!(a.starts_with("MM"));
        assert_eq!(a.len(), 12);
        assert!(a[2..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_only_drivers_and_admins_pass_driver_guard() {
        let driver = Actor::new(Uuid::new_v4(), Role::Driver);
        let customer = Actor::new(Uuid::new_v4(), Role::Customer);
        let admin = Actor::new(Uuid::new_v4(), Role::Admin);
        assert!(require_role(&driver, &[Role::Driver]).is_ok());
        assert!(require_role(&admin, &[Role::Driver]).is_ok());
        assert!(matches!(require_role(&customer, &[Role::Driver]), Err(AppError::Forbidden(_))));
    }
}
