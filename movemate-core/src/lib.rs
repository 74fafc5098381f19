pub mod clock;
pub mod identity;
pub mod quotation;
pub mod pricing;
pub mod notification;
pub mod documents;
pub mod drivers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{Actor, Role};
pub use quotation::{Cost, Price, Quotation};

/// Business-rule and dependency failures surfaced to callers.
///
/// `NotFound`, `InvalidState` and `InsufficientFunds` are user-visible rule
/// violations and are never retried. `ExternalFailure` comes from a
/// collaborator (pricing, documents, notifications). `Conflict` means an
/// optimistic guard lost a race with another handler on the same shipment.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{message}")]
    InvalidState { code: &'static str, message: String },

    #[error("{message}")]
    InsufficientFunds { code: &'static str, message: String },

    #[error("External dependency failed: {0}")]
    ExternalFailure(String),

    #[error("Concurrent modification of {0}")]
    Conflict(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn invalid_state(code: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidState { code, message: message.into() }
    }

    pub fn insufficient_funds(code: &'static str, message: impl Into<String>) -> Self {
        Self::InsufficientFunds { code, message: message.into() }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound { entity, .. } => match *entity {
                "shipment" => "SHIPMENT_NOT_FOUND",
                "billing" => "BILLING_NOT_FOUND",
                "payment" => "PAYMENT_NOT_FOUND",
                "step" => "STEP_NOT_FOUND",
                "customer" => "CUSTOMER_NOT_FOUND",
                "driver" => "DRIVER_NOT_FOUND",
                _ => "NOT_FOUND",
            },
            CoreError::InvalidState { code, .. } => code,
            CoreError::InsufficientFunds { code, .. } => code,
            CoreError::ExternalFailure(_) => "EXTERNAL_FAILURE",
            CoreError::Conflict(_) => "CONCURRENT_MODIFICATION",
        }
    }

    /// Whether a queued job hitting this error may be redelivered.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::ExternalFailure(_) | CoreError::Conflict(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(CoreError::not_found("shipment", "MM001").code(), "SHIPMENT_NOT_FOUND");
        assert_eq!(CoreError::not_found("vehicle", "x").code(), "NOT_FOUND");
        assert_eq!(
            CoreError::invalid_state("PAYMENT_ALREADY_SETTLED", "settled").code(),
            "PAYMENT_ALREADY_SETTLED"
        );
        assert_eq!(CoreError::Conflict("MM001".into()).code(), "CONCURRENT_MODIFICATION");
    }

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(CoreError::ExternalFailure("fcm down".into()).is_retryable());
        assert!(!CoreError::invalid_state("X", "y").is_retryable());
        assert!(!CoreError::insufficient_funds("CREDIT_LIMIT_EXCEEDED", "limit").is_retryable());
    }

    #[test]
    fn test_not_found_message() {
        let err = CoreError::not_found("billing", "MM0042");
        assert_eq!(err.to_string(), "billing not found: MM0042");
    }
}
