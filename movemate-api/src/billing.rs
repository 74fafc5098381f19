use axum::{
    extract::{Path, State},
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use movemate_core::{Actor, Role};
use movemate_shipment::{Billing, SweepReport};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::admin_only_middleware;
use crate::state::AppState;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApprovePaymentRequest {
    pub payment_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct RejectPaymentRequest {
    pub payment_id: Uuid,
    pub detail: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub is_refunded: bool,
    /// Defaults to the amount on the refund note.
    pub amount: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IssueCycleRequest {
    pub customer_id: Option<Uuid>,
}

// ============================================================================
// Routes
// ============================================================================

pub fn routes() -> Router<AppState> {
    let admin = Router::new()
        .route("/v1/billings/{bn}/approve", post(approve_payment))
        .route("/v1/billings/{bn}/reject", post(reject_payment))
        .route("/v1/billings/{bn}/revert-rejection", post(revert_rejection))
        .route("/v1/billings/{bn}/refund", post(process_refund))
        .route("/v1/admin/billing/check-overdue", post(check_overdue))
        .route("/v1/admin/billing/issue-cycle", post(issue_cycle))
        .route("/v1/admin/billing/notify-due", post(notify_due))
        .route_layer(middleware::from_fn(admin_only_middleware));

    Router::new()
        .route("/v1/billings/{bn}", get(get_billing))
        .merge(admin)
}

// ============================================================================
// Billing Handlers
// ============================================================================

async fn get_billing(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(bn): Path<String>,
) -> Result<Json<Billing>, AppError> {
    let billing = state.orchestrator.billing(&bn).await?;
    let visible = actor.is_admin() || (actor.role == Role::Customer && billing.customer_id == actor.user_id);
    if !visible {
        return Err(AppError::Forbidden(format!("Billing {} belongs to someone else", bn)));
    }
    Ok(Json(billing))
}

async fn approve_payment(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(bn): Path<String>,
    Json(req): Json<ApprovePaymentRequest>,
) -> Result<Json<Billing>, AppError> {
    Ok(Json(state.orchestrator.on_payment_approved(&actor, &bn, req.payment_id).await?))
}

async fn reject_payment(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(bn): Path<String>,
    Json(req): Json<RejectPaymentRequest>,
) -> Result<Json<Billing>, AppError> {
    let billing = state
        .orchestrator
        .on_payment_rejected(&actor, &bn, req.payment_id, req.detail)
        .await?;
    Ok(Json(billing))
}

async fn revert_rejection(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(bn): Path<String>,
) -> Result<Json<Billing>, AppError> {
    Ok(Json(state.orchestrator.revert_payment_rejection(&actor, &bn).await?))
}

async fn process_refund(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(bn): Path<String>,
    Json(req): Json<RefundRequest>,
) -> Result<Json<Billing>, AppError> {
    let billing = state
        .orchestrator
        .on_refund_processed(&actor, &bn, req.is_refunded, req.amount)
        .await?;
    Ok(Json(billing))
}

// ============================================================================
// Sweep Triggers
// ============================================================================

async fn check_overdue(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<SweepReport>, AppError> {
    tracing::info!(actor = %actor.user_id, "Overdue check triggered");
    Ok(Json(state.orchestrator.check_overdue().await?))
}

async fn issue_cycle(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    req: Option<Json<IssueCycleRequest>>,
) -> Result<Json<SweepReport>, AppError> {
    let Json(req) = req.unwrap_or_default();
    tracing::info!(actor = %actor.user_id, customer_id = ?req.customer_id, "Billing cycle triggered");
    Ok(Json(state.orchestrator.issue_billing_cycle(req.customer_id).await?))
}

async fn notify_due(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
) -> Result<Json<SweepReport>, AppError> {
    tracing::info!(actor = %actor.user_id, "Due-date reminders triggered");
    Ok(Json(state.orchestrator.notify_nearby_duedate().await?))
}
