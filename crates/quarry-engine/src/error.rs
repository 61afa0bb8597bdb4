use quarry_core::document::DocumentStatus;
use quarry_core::errors::{ProtocolError, TransportError, ValidationError};
use quarry_core::ids::{DocumentId, SessionId};
use quarry_store::StoreError;

/// Failure of one submitted query.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    Validation(#[from] ValidationError),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A newer query took over the session. The session was not touched.
    #[error("query superseded by a newer query")]
    Superseded,

    #[error("query aborted")]
    Aborted,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl QueryError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.error_kind(),
            Self::SessionNotFound(_) => "session_not_found",
            Self::Transport(e) => e.error_kind(),
            Self::Protocol(e) => e.error_kind(),
            Self::Superseded => "superseded",
            Self::Aborted => "aborted",
            Self::Store(e) => e.error_kind(),
        }
    }
}

/// Failure while tracking a document.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("upload failed: {0}")]
    Upload(TransportError),

    #[error("status check failed: {0}")]
    Polling(TransportError),

    #[error("processing did not finish after {0} status checks")]
    PollBudgetExhausted(u32),

    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("document {id} cannot be refreshed while {status}")]
    NotRefreshable { id: DocumentId, status: DocumentStatus },

    #[error("delete failed: {0}")]
    Delete(TransportError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Upload(_) => "upload_failed",
            Self::Polling(_) => "polling_failed",
            Self::PollBudgetExhausted(_) => "poll_budget_exhausted",
            Self::DocumentNotFound(_) => "document_not_found",
            Self::NotRefreshable { .. } => "not_refreshable",
            Self::Delete(_) => "delete_failed",
            Self::Store(e) => e.error_kind(),
        }
    }

    /// Text stored on a document that settled in Error because of this.
    pub fn document_message(&self) -> String {
        match self {
            Self::Upload(TransportError::Status { status, body }) if !body.trim().is_empty() => {
                format!("upload rejected ({status}): {}", body.trim())
            }
            Self::Upload(TransportError::Status { status, .. }) => {
                format!("upload rejected ({status})")
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl EngineError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Query(e) => e.error_kind(),
            Self::Ingest(e) => e.error_kind(),
        }
    }
}
