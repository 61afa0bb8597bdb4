//! Sequential multi-file ingestion.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use quarry_core::document::{Document, DocumentStatus, UploadFile};

use crate::ingestion::{IngestionTracker, UploadHandle};

/// Files whose upload step has settled, out of the batch size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchProgress {
    pub processed: usize,
    pub total: usize,
}

/// One file's result. `document` is the record as of the moment its upload
/// settled; server-side processing may still be running.
pub struct BatchEntry {
    pub document: Document,
    handle: Option<UploadHandle>,
}

impl BatchEntry {
    /// Wait for the tracker to finish with this file.
    pub async fn finished(self) -> Document {
        match self.handle {
            Some(handle) => handle.finished().await.unwrap_or(self.document),
            None => self.document,
        }
    }
}

pub struct BatchCoordinator {
    tracker: Arc<IngestionTracker>,
}

impl BatchCoordinator {
    pub fn new(tracker: Arc<IngestionTracker>) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &Arc<IngestionTracker> {
        &self.tracker
    }

    /// Upload `files` one at a time, in order. A file that fails does not stop
    /// the batch. `on_progress` runs after each file.
    #[instrument(skip_all, fields(total = files.len()))]
    pub async fn run(
        &self,
        files: Vec<UploadFile>,
        mut on_progress: impl FnMut(BatchProgress),
    ) -> Vec<BatchEntry> {
        let total = files.len();
        let mut entries = Vec::with_capacity(total);

        for (idx, file) in files.into_iter().enumerate() {
            let entry = self.upload_one(file).await;
            if entry.document.status == DocumentStatus::Error {
                warn!(
                    position = idx + 1,
                    name = %entry.document.name,
                    error = entry.document.error.as_deref().unwrap_or_default(),
                    "batch entry failed"
                );
            }
            entries.push(entry);
            on_progress(BatchProgress {
                processed: idx + 1,
                total,
            });
        }

        let failed = entries
            .iter()
            .filter(|e| e.document.status == DocumentStatus::Error)
            .count();
        info!(total, failed, "batch finished");
        entries
    }

    async fn upload_one(&self, file: UploadFile) -> BatchEntry {
        let name = file.name.clone();
        let size = file.size();
        let mut handle = match self.tracker.submit(file) {
            Ok(handle) => handle,
            Err(e) => {
                let mut document = Document::placeholder(name, size);
                document.fail(e.to_string());
                return BatchEntry {
                    document,
                    handle: None,
                };
            }
        };

        let document = match handle.uploaded().await {
            Some(document) => document,
            None => self
                .tracker
                .documents()
                .get(&handle.document().id)
                .unwrap_or_else(|_| handle.document().clone()),
        };
        BatchEntry {
            document,
            handle: Some(handle),
        }
    }
}
