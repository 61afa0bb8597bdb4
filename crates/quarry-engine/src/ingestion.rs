//! Document ingestion: upload with progress, then poll until the server
//! reports a terminal status.
//!
//! Lifecycle per document: uploading → processing → ready | error. The
//! placeholder record exists before any network call; it is promoted in
//! place once the server issues an id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use quarry_client::{DocumentBackend, UploadProgress};
use quarry_core::document::{Document, UploadFile};
use quarry_core::ids::DocumentId;
use quarry_store::{DocumentStore, StoreError};

use crate::error::IngestError;

/// Timing and budget of the status poll loop.
#[derive(Clone, Debug, PartialEq)]
pub struct PollPolicy {
    /// Wait before the first status check.
    pub initial_delay: Duration,
    /// Wait before the second check; later waits grow by `multiplier`.
    pub interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Status checks allowed before the document is settled in Error.
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            interval: Duration::from_secs(2),
            multiplier: 1.5,
            max_interval: Duration::from_secs(30),
            max_attempts: 120,
        }
    }
}

impl PollPolicy {
    /// Delay before status check number `attempt` (zero-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }
        let grown = self.interval.as_millis() as f64 * self.multiplier.powi(attempt as i32 - 1);
        let capped = grown.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Published on a handle's update channel.
#[derive(Clone, Debug, PartialEq)]
pub enum UploadUpdate {
    /// Bytes sent so far, 0..=100. Never decreases.
    Progress { document_id: DocumentId, percent: u8 },
    /// The document's status changed. Repeated statuses are not published.
    Status(Document),
}

/// Caller's view of one tracked document.
pub struct UploadHandle {
    document: Document,
    updates: mpsc::UnboundedReceiver<UploadUpdate>,
    uploaded: Option<oneshot::Receiver<Document>>,
    task: JoinHandle<Document>,
}

impl UploadHandle {
    /// The record as it was when tracking started: the placeholder for a
    /// fresh upload, the restarted record for a refresh.
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn updates(&mut self) -> &mut mpsc::UnboundedReceiver<UploadUpdate> {
        &mut self.updates
    }

    /// Resolves once the upload step settled: Processing under the server
    /// id, or Error. `None` if tracking stopped before that.
    pub async fn uploaded(&mut self) -> Option<Document> {
        match self.uploaded.take() {
            Some(rx) => rx.await.ok(),
            None => None,
        }
    }

    /// Resolves when the document reaches a terminal status or its poll
    /// loop is cancelled; returns the last observed record.
    pub async fn finished(self) -> Option<Document> {
        self.task.await.ok()
    }
}

struct PollEntry {
    generation: u64,
    cancel: CancellationToken,
}

type PollRegistry = DashMap<DocumentId, PollEntry>;

/// Drives documents through upload and processing. Dropping the tracker
/// cancels every poll loop it started.
pub struct IngestionTracker {
    backend: Arc<dyn DocumentBackend>,
    documents: Arc<dyn DocumentStore>,
    policy: PollPolicy,
    root: CancellationToken,
    polls: Arc<PollRegistry>,
    generation: AtomicU64,
}

impl IngestionTracker {
    pub fn new(backend: Arc<dyn DocumentBackend>, documents: Arc<dyn DocumentStore>) -> Self {
        Self::with_policy(backend, documents, PollPolicy::default())
    }

    pub fn with_policy(
        backend: Arc<dyn DocumentBackend>,
        documents: Arc<dyn DocumentStore>,
        policy: PollPolicy,
    ) -> Self {
        Self {
            backend,
            documents,
            policy,
            root: CancellationToken::new(),
            polls: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Start tracking a file. The returned handle's document is the
    /// placeholder, already stored in Uploading; the upload itself runs on
    /// a spawned task. Must be called inside a tokio runtime.
    pub fn submit(&self, file: UploadFile) -> Result<UploadHandle, IngestError> {
        let placeholder = Document::placeholder(&file.name, file.size());
        self.documents.insert(placeholder.clone())?;
        info!(document_id = %placeholder.id, name = %file.name, size = file.size(), "upload queued");

        let (worker, updates) = self.worker(&placeholder.id);
        worker.publish(&placeholder);
        let (uploaded_tx, uploaded_rx) = oneshot::channel();
        let task = tokio::spawn(worker.upload_and_poll(file, placeholder.clone(), uploaded_tx));

        Ok(UploadHandle {
            document: placeholder,
            updates,
            uploaded: Some(uploaded_rx),
            task,
        })
    }

    /// Manual refresh: put a settled document back at Processing and start
    /// a new poll loop. A loop already running for it is replaced.
    pub fn refresh(&self, id: &DocumentId) -> Result<UploadHandle, IngestError> {
        let mut restarted = false;
        let document = self
            .documents
            .update(id, &mut |doc| restarted = doc.restart())
            .map_err(|e| not_found(id, e))?;
        if !restarted {
            return Err(IngestError::NotRefreshable {
                id: id.clone(),
                status: document.status,
            });
        }
        self.cancel(id);
        info!(document_id = %id, "refresh requested");

        let (worker, updates) = self.worker(id);
        worker.publish(&document);
        let (uploaded_tx, uploaded_rx) = oneshot::channel();
        let _ = uploaded_tx.send(document.clone());
        let task = tokio::spawn(worker.poll(document.clone()));

        Ok(UploadHandle {
            document,
            updates,
            uploaded: Some(uploaded_rx),
            task,
        })
    }

    /// Stop the poll loop for one document. The document keeps its last
    /// observed status. Returns whether a loop was running.
    pub fn cancel(&self, id: &DocumentId) -> bool {
        match self.polls.remove(id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                debug!(document_id = %id, "poll loop cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<DocumentId> = self.polls.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Delete on the server (unless the upload never got that far), stop
    /// polling and drop the local record. A failed server delete leaves the
    /// document tracked and its poll loop running.
    #[instrument(skip(self), fields(document_id = %id))]
    pub async fn delete(&self, id: &DocumentId) -> Result<(), IngestError> {
        if id.is_placeholder() {
            if self.documents.get(id).is_err() {
                return Err(IngestError::DocumentNotFound(id.clone()));
            }
        } else {
            self.backend.delete(id).await.map_err(IngestError::Delete)?;
        }
        self.cancel(id);
        self.documents.remove(id)?;
        info!("document deleted");
        Ok(())
    }

    fn worker(&self, id: &DocumentId) -> (Worker, mpsc::UnboundedReceiver<UploadUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.root.child_token();
        self.polls.insert(
            id.clone(),
            PollEntry {
                generation,
                cancel: cancel.clone(),
            },
        );
        let worker = Worker {
            backend: self.backend.clone(),
            documents: self.documents.clone(),
            policy: self.policy.clone(),
            polls: self.polls.clone(),
            generation,
            cancel,
            updates: tx,
        };
        (worker, rx)
    }
}

impl Drop for IngestionTracker {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

/// Everything one spawned tracking task needs.
struct Worker {
    backend: Arc<dyn DocumentBackend>,
    documents: Arc<dyn DocumentStore>,
    policy: PollPolicy,
    polls: Arc<PollRegistry>,
    generation: u64,
    cancel: CancellationToken,
    updates: mpsc::UnboundedSender<UploadUpdate>,
}

impl Worker {
    #[instrument(skip_all, fields(document_id = %placeholder.id, name = %file.name))]
    async fn upload_and_poll(
        self,
        file: UploadFile,
        placeholder: Document,
        uploaded: oneshot::Sender<Document>,
    ) -> Document {
        let placeholder_id = placeholder.id.clone();
        let progress = {
            let updates = self.updates.clone();
            let document_id = placeholder_id.clone();
            UploadProgress::new(move |percent| {
                let _ = updates.send(UploadUpdate::Progress {
                    document_id: document_id.clone(),
                    percent,
                });
            })
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                let document = self
                    .transition(&placeholder_id, |doc| doc.fail("upload cancelled"))
                    .unwrap_or(placeholder);
                self.release(&placeholder_id);
                return document;
            }
            result = self.backend.upload(&file, progress) => result,
        };

        let server_id = match result {
            Ok(server_id) => server_id,
            Err(e) => {
                let error = IngestError::Upload(e);
                warn!(error_kind = error.error_kind(), error = %error, "upload failed");
                let document = self
                    .transition(&placeholder_id, |doc| doc.fail(error.document_message()))
                    .unwrap_or(placeholder);
                let _ = uploaded.send(document.clone());
                self.release(&placeholder_id);
                return document;
            }
        };

        let Some(document) =
            self.transition(&placeholder_id, |doc| doc.promote(server_id.clone()))
        else {
            self.release(&placeholder_id);
            return placeholder;
        };
        self.rekey(&placeholder_id, &server_id);
        info!(server_id = %server_id, "upload accepted");
        let _ = uploaded.send(document.clone());

        self.poll(document).await
    }

    async fn poll(self, mut document: Document) -> Document {
        let id = document.id.clone();
        for attempt in 0..self.policy.max_attempts {
            let delay = self.policy.delay_before(attempt);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return document,
                _ = tokio::time::sleep(delay) => {}
            }

            let report = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return document,
                report = self.backend.status(&id) => report,
            };

            match report {
                Ok(report) => {
                    match self.transition(&id, |doc| doc.apply_report(&report)) {
                        Some(next) => document = next,
                        None => return document,
                    }
                    if document.status.is_terminal() {
                        info!(document_id = %id, status = %document.status, attempts = attempt + 1, "processing finished");
                        self.release(&id);
                        return document;
                    }
                }
                Err(e) => {
                    let error = IngestError::Polling(e);
                    warn!(document_id = %id, error_kind = error.error_kind(), error = %error, "status check failed");
                    return self.settle_error(&id, document, error);
                }
            }
        }

        let error = IngestError::PollBudgetExhausted(self.policy.max_attempts);
        warn!(document_id = %id, error = %error, "giving up on processing");
        self.settle_error(&id, document, error)
    }

    fn settle_error(&self, id: &DocumentId, document: Document, error: IngestError) -> Document {
        let settled = self
            .transition(id, |doc| doc.fail(error.document_message()))
            .unwrap_or(document);
        self.release(id);
        settled
    }

    /// Apply `change` in the store and publish the result if the status
    /// moved. `None` once the document is gone from the store.
    fn transition(
        &self,
        id: &DocumentId,
        mut change: impl FnMut(&mut Document) -> bool,
    ) -> Option<Document> {
        let mut changed = false;
        let updated = self.documents.update(id, &mut |doc| changed = change(doc));
        match updated {
            Ok(document) => {
                if changed {
                    debug!(document_id = %document.id, status = %document.status, "status changed");
                    self.publish(&document);
                }
                Some(document)
            }
            Err(e) => {
                debug!(document_id = %id, error = %e, "document no longer tracked");
                None
            }
        }
    }

    fn publish(&self, document: &Document) {
        let _ = self.updates.send(UploadUpdate::Status(document.clone()));
    }

    fn rekey(&self, from: &DocumentId, to: &DocumentId) {
        if let Some((_, entry)) = self
            .polls
            .remove_if(from, |_, e| e.generation == self.generation)
        {
            self.polls.insert(to.clone(), entry);
        }
    }

    fn release(&self, id: &DocumentId) {
        self.polls.remove_if(id, |_, e| e.generation == self.generation);
    }
}

fn not_found(id: &DocumentId, error: StoreError) -> IngestError {
    match error {
        StoreError::NotFound(_) => IngestError::DocumentNotFound(id.clone()),
        other => IngestError::Store(other),
    }
}
