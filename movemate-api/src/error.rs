use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use movemate_core::CoreError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Core(err) => {
                let status = match err {
                    CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                    CoreError::InvalidState { .. } => StatusCode::CONFLICT,
                    CoreError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
                    CoreError::Conflict(_) => StatusCode::CONFLICT,
                    CoreError::ExternalFailure(_) => StatusCode::BAD_GATEWAY,
                };
                (status, err.code())
            }
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match &self {
            AppError::Internal(err) => {
                tracing::error!("Internal Server Error: {:#}", err);
                "Internal Server Error".to_string()
            }
            AppError::Core(err @ CoreError::ExternalFailure(_)) => {
                tracing::error!(code, "Upstream failure: {}", err);
                err.to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "code": code,
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_map_to_statuses() {
        let cases = [
            (CoreError::not_found("shipment", "MM1"), StatusCode::NOT_FOUND, "SHIPMENT_NOT_FOUND"),
            (
                CoreError::invalid_state("SHIPMENT_NOT_CANCELLABLE", "done"),
                StatusCode::CONFLICT,
                "SHIPMENT_NOT_CANCELLABLE",
            ),
            (
                CoreError::insufficient_funds("CREDIT_LIMIT_EXCEEDED", "over"),
                StatusCode::PAYMENT_REQUIRED,
                "CREDIT_LIMIT_EXCEEDED",
            ),
            (CoreError::Conflict("MM1".into()), StatusCode::CONFLICT, "CONCURRENT_MODIFICATION"),
            (CoreError::ExternalFailure("kafka".into()), StatusCode::BAD_GATEWAY, "EXTERNAL_FAILURE"),
        ];
        for (err, status, code) in cases {
            assert_eq!(AppError::from(err).status_and_code(), (status, code));
        }
    }

    #[tokio::test]
    async fn test_body_carries_code_and_message() {
        let response = AppError::from(CoreError::invalid_state("FINISH_REQUIRED", "finish it")).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "FINISH_REQUIRED");
        assert_eq!(body["error"], "finish it");
    }
}
