use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::CoreResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentKind {
    Invoice,
    Receipt,
    RefundReceipt,
}

/// What the renderer needs to produce a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub kind: DocumentKind,
    pub billing_number: String,
    pub customer_id: uuid::Uuid,
    pub amount: i64,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneratedDocument {
    pub document_id: String,
    pub file: Option<String>,
}

/// Document rendering collaborator. Treated as synchronous; callers downgrade
/// failures to a pending document instead of failing the transition.
#[async_trait]
pub trait DocumentGenerator: Send + Sync {
    async fn generate(&self, request: &DocumentRequest) -> CoreResult<GeneratedDocument>;
}
