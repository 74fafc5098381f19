use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use movemate_core::{Actor, Role};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub exp: usize,
}

impl From<Claims> for Actor {
    fn from(claims: Claims) -> Self {
        Actor::new(claims.sub, claims.role)
    }
}

// ============================================================================
// Authentication Middleware
// ============================================================================

/// Decodes the bearer token and stores the caller as an `Actor` extension.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token".into()))?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.auth.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Unauthorized(format!("Invalid token: {}", e)))?;

    // Scheduled work acts as SYSTEM internally; tokens never carry it.
    if token_data.claims.role == Role::System {
        return Err(AppError::Forbidden("System role is not accepted from clients".into()));
    }

    req.extensions_mut().insert(Actor::from(token_data.claims));
    Ok(next.run(req).await)
}

// ============================================================================
// Admin Guard
// ============================================================================

/// Runs after `auth_middleware`; rejects anyone but admins.
pub async fn admin_only_middleware(req: Request, next: Next) -> Result<Response, AppError> {
    let is_admin = req
        .extensions()
        .get::<Actor>()
        .map(Actor::is_admin)
        .ok_or_else(|| AppError::Unauthorized("Missing identity".into()))?;
    if !is_admin {
        return Err(AppError::Forbidden("Admin role required".into()));
    }
    Ok(next.run(req).await)
}
