use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::Value;

use quarry_core::config::QueryConfig;
use quarry_core::document::{DocumentStatusReport, UploadFile};
use quarry_core::errors::TransportError;
use quarry_core::ids::DocumentId;
use quarry_core::messages::Message;

/// Decoded frame values from a streaming query, in arrival order.
pub type BoxFrameStream = Pin<Box<dyn Stream<Item = Result<Value, TransportError>> + Send>>;

/// Backend for knowledge queries.
#[async_trait]
pub trait KnowledgeBackend: Send + Sync {
    /// Open the streaming endpoint. A non-2xx status is returned as
    /// `TransportError::Status` before any frame is produced.
    async fn stream_query(
        &self,
        messages: &[Message],
        config: &QueryConfig,
    ) -> Result<BoxFrameStream, TransportError>;

    /// Single-response endpoint. Returns the one frame in the body.
    async fn query(&self, messages: &[Message], config: &QueryConfig)
        -> Result<Value, TransportError>;
}

/// Backend for document upload, status and deletion.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Upload the file; returns the server-issued document id.
    async fn upload(
        &self,
        file: &UploadFile,
        progress: UploadProgress,
    ) -> Result<DocumentId, TransportError>;

    async fn status(&self, id: &DocumentId) -> Result<DocumentStatusReport, TransportError>;

    async fn delete(&self, id: &DocumentId) -> Result<(), TransportError>;
}

/// JSON body of both query endpoints.
#[derive(Debug, Serialize)]
pub struct QueryBody<'a> {
    pub messages: &'a [Message],
    pub token: &'a str,
    pub model: &'a str,
    #[serde(rename = "kbList")]
    pub kb_list: Vec<String>,
    pub documents: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<&'a str>,
    /// Only sent (as `false`) on the single-response endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl<'a> QueryBody<'a> {
    pub fn new(messages: &'a [Message], config: &'a QueryConfig, streaming: bool) -> Self {
        Self {
            messages,
            token: config.token.expose_secret(),
            model: &config.model,
            kb_list: config.knowledge_bases(),
            documents: &config.documents,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            response_format: config.response_format.as_deref(),
            stream: (!streaming).then_some(false),
        }
    }
}

/// Upload progress sink. Percentages are clamped to 0..=100 and only
/// forwarded when they increase, so observers see a monotonic sequence.
#[derive(Clone)]
pub struct UploadProgress {
    inner: Arc<ProgressInner>,
}

struct ProgressInner {
    last: Mutex<Option<u8>>,
    sink: Box<dyn Fn(u8) + Send + Sync>,
}

impl UploadProgress {
    pub fn new(sink: impl Fn(u8) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                last: Mutex::new(None),
                sink: Box::new(sink),
            }),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn percent(&self, percent: u8) {
        let percent = percent.min(100);
        {
            let mut last = self.inner.last.lock();
            if matches!(*last, Some(prev) if prev >= percent) {
                return;
            }
            *last = Some(percent);
        }
        (self.inner.sink)(percent);
    }

    pub fn bytes(&self, sent: u64, total: u64) {
        let percent = if total == 0 {
            100
        } else {
            (sent.min(total) * 100 / total) as u8
        };
        self.percent(percent);
    }

    pub fn last(&self) -> Option<u8> {
        *self.inner.last.lock()
    }
}

impl std::fmt::Debug for UploadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadProgress")
            .field("last", &self.last())
            .finish()
    }
}
