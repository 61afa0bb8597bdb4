use std::time::Duration;

/// Rejected before any network call. Never retried.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("a credential is required")]
    MissingCredential,
    #[error("at least one knowledge base id is required")]
    MissingKnowledgeBase,
    #[error("message list is empty")]
    EmptyMessages,
    #[error("message content is empty")]
    EmptyMessage,
}

impl ValidationError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::MissingKnowledgeBase => "missing_knowledge_base",
            Self::EmptyMessages => "empty_messages",
            Self::EmptyMessage => "empty_message",
        }
    }
}

/// Network failure or non-2xx response. Settles the owning session or
/// document in its error state; not retried automatically.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::Status { .. } => "http_status",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::InvalidResponse(_) => "invalid_response",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn from_status(status: u16, body: String) -> Self {
        Self::Status { status, body }
    }
}

/// One malformed frame. Recovered locally: the frame is logged and dropped
/// and decoding continues with the next one.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed frame JSON: {0}")]
    MalformedJson(String),
    #[error("invalid `{tag}` payload: {reason}")]
    InvalidPayload { tag: String, reason: String },
    #[error("unexpected `{0}` frame in a complete response")]
    UnexpectedTag(String),
}

impl ProtocolError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidUtf8 => "invalid_utf8",
            Self::MalformedJson(_) => "malformed_json",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::UnexpectedTag(_) => "unexpected_tag",
        }
    }
}
