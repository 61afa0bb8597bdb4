use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use quarry_core::config::QueryConfig;
use quarry_core::document::{DocumentStatus, DocumentStatusReport, UploadFile};
use quarry_core::errors::TransportError;
use quarry_core::ids::DocumentId;
use quarry_core::messages::Message;

use crate::backend::{BoxFrameStream, DocumentBackend, KnowledgeBackend, UploadProgress};
use crate::decoder::FrameStream;

/// Pre-programmed reply to one query call.
pub enum MockReply {
    /// Yield these decoded frames, then end.
    Frames(Vec<Value>),
    /// Raw body chunks, run through the frame decoder.
    Chunks(Vec<Bytes>),
    /// Yield these frames, then fail mid-stream.
    FramesThenError(Vec<Value>, TransportError),
    /// Caller-controlled stream; see [`MockReply::channel`].
    Live(BoxFrameStream),
    /// Body of the single-response endpoint.
    Complete(Value),
    /// Fail the call itself.
    Error(TransportError),
    /// Wait, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    /// `searching`, then each text piece as a `final` delta.
    pub fn answer(pieces: &[&str]) -> Self {
        let mut frames = vec![json!({"tag": "searching", "content": null})];
        frames.extend(pieces.iter().map(|p| json!({"tag": "final", "content": p})));
        Self::Frames(frames)
    }

    pub fn complete(text: &str) -> Self {
        Self::Complete(json!({"tag": "final", "content": text}))
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    /// A stream the test feeds frame by frame. Dropping the sender ends it.
    pub fn channel() -> (mpsc::UnboundedSender<Result<Value, TransportError>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let frames = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (tx, Self::Live(Box::pin(frames)))
    }
}

/// Pre-programmed reply to one upload call.
pub enum MockUpload {
    Accept(DocumentId),
    Fail(TransportError),
    Delay(Duration, Box<MockUpload>),
}

/// Scripted backend for engine tests. Replies are consumed in order; an
/// exhausted query script is an error, an exhausted upload script accepts
/// with a generated id.
#[derive(Default)]
pub struct MockBackend {
    replies: Mutex<VecDeque<MockReply>>,
    uploads: Mutex<VecDeque<MockUpload>>,
    statuses: Mutex<HashMap<DocumentId, VecDeque<Result<DocumentStatusReport, TransportError>>>>,
    sent_messages: Mutex<Vec<Vec<Message>>>,
    deleted: Mutex<Vec<DocumentId>>,
    delete_failures: Mutex<VecDeque<TransportError>>,
    query_calls: AtomicUsize,
    upload_calls: AtomicUsize,
    status_calls: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: Vec<MockReply>) -> Self {
        let mock = Self::new();
        mock.replies.lock().extend(replies);
        mock
    }

    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn push_upload(&self, upload: MockUpload) {
        self.uploads.lock().push_back(upload);
    }

    /// Script status answers for one document. The last answer repeats once
    /// the script runs out.
    pub fn script_status(
        &self,
        id: &DocumentId,
        answers: Vec<Result<DocumentStatusReport, TransportError>>,
    ) {
        self.statuses.lock().insert(id.clone(), answers.into());
    }

    /// Shorthand for a status script built from bare statuses.
    pub fn script_statuses(&self, id: &DocumentId, statuses: &[DocumentStatus]) {
        let answers = statuses
            .iter()
            .map(|status| {
                Ok(DocumentStatusReport {
                    name: String::new(),
                    size: 0,
                    status: *status,
                    error: None,
                })
            })
            .collect();
        self.script_status(id, answers);
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::Relaxed)
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::Relaxed)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::Relaxed)
    }

    /// Message lists sent with each query call, in call order.
    pub fn sent_messages(&self) -> Vec<Vec<Message>> {
        self.sent_messages.lock().clone()
    }

    /// Fail the next delete call with `error`. Queued failures are used in
    /// order before deletes succeed again.
    pub fn push_delete_failure(&self, error: TransportError) {
        self.delete_failures.lock().push_back(error);
    }

    /// Ids of successful delete calls.
    pub fn deleted(&self) -> Vec<DocumentId> {
        self.deleted.lock().clone()
    }

    fn next_reply(&self, messages: &[Message]) -> Result<MockReply, TransportError> {
        let idx = self.query_calls.fetch_add(1, Ordering::Relaxed);
        self.sent_messages.lock().push(messages.to_vec());
        self.replies.lock().pop_front().ok_or_else(|| {
            TransportError::InvalidResponse(format!(
                "MockBackend: no reply configured for call {idx}"
            ))
        })
    }
}

/// Unroll nested delays iteratively.
async fn settle_delays(mut reply: MockReply) -> MockReply {
    while let MockReply::Delay(duration, inner) = reply {
        tokio::time::sleep(duration).await;
        reply = *inner;
    }
    reply
}

#[async_trait]
impl KnowledgeBackend for MockBackend {
    async fn stream_query(
        &self,
        messages: &[Message],
        _config: &QueryConfig,
    ) -> Result<BoxFrameStream, TransportError> {
        let reply = self.next_reply(messages)?;
        match settle_delays(reply).await {
            MockReply::Frames(frames) => Ok(Box::pin(stream::iter(
                frames.into_iter().map(Ok::<Value, TransportError>),
            ))),
            MockReply::Chunks(chunks) => Ok(Box::pin(FrameStream::new(stream::iter(
                chunks.into_iter().map(Ok::<Bytes, std::convert::Infallible>),
            )))),
            MockReply::FramesThenError(frames, error) => Ok(Box::pin(stream::iter(
                frames
                    .into_iter()
                    .map(Ok::<Value, TransportError>)
                    .chain(std::iter::once(Err(error))),
            ))),
            MockReply::Live(frames) => Ok(frames),
            MockReply::Error(error) => Err(error),
            MockReply::Complete(_) | MockReply::Delay(..) => Err(TransportError::InvalidResponse(
                "MockBackend: complete reply on the streaming endpoint".into(),
            )),
        }
    }

    async fn query(
        &self,
        messages: &[Message],
        _config: &QueryConfig,
    ) -> Result<Value, TransportError> {
        let reply = self.next_reply(messages)?;
        match settle_delays(reply).await {
            MockReply::Complete(body) => Ok(body),
            MockReply::Error(error) => Err(error),
            _ => Err(TransportError::InvalidResponse(
                "MockBackend: streaming reply on the single-response endpoint".into(),
            )),
        }
    }
}

#[async_trait]
impl DocumentBackend for MockBackend {
    async fn upload(
        &self,
        _file: &UploadFile,
        progress: UploadProgress,
    ) -> Result<DocumentId, TransportError> {
        let idx = self.upload_calls.fetch_add(1, Ordering::Relaxed);
        let mut upload = self
            .uploads
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockUpload::Accept(DocumentId::from_raw(format!("doc-{idx}"))));

        progress.percent(0);
        loop {
            match upload {
                MockUpload::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    upload = *inner;
                }
                MockUpload::Accept(id) => {
                    progress.percent(50);
                    progress.percent(100);
                    return Ok(id);
                }
                MockUpload::Fail(error) => return Err(error),
            }
        }
    }

    async fn status(&self, id: &DocumentId) -> Result<DocumentStatusReport, TransportError> {
        self.status_calls.fetch_add(1, Ordering::Relaxed);
        let mut statuses = self.statuses.lock();
        let Some(script) = statuses.get_mut(id) else {
            return Err(TransportError::from_status(404, format!("unknown document {id}")));
        };
        let answer = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        answer.unwrap_or_else(|| Err(TransportError::from_status(404, "empty script".into())))
    }

    async fn delete(&self, id: &DocumentId) -> Result<(), TransportError> {
        if let Some(error) = self.delete_failures.lock().pop_front() {
            return Err(error);
        }
        self.deleted.lock().push(id.clone());
        Ok(())
    }
}
