use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::DocumentId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploading,
    Processing,
    Ready,
    Error,
}

impl DocumentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }

    /// Forward-only: uploading → processing → ready | error. Uploading may
    /// also fail directly. Restarting at processing goes through
    /// [`Document::restart`], not through this check.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Uploading, Processing) | (Uploading, Error) | (Processing, Ready) | (Processing, Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked upload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub name: String,
    pub size: u64,
    pub status: DocumentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Local record shown before the server has seen the file.
    pub fn placeholder(name: impl Into<String>, size: u64) -> Self {
        Self {
            id: DocumentId::new(),
            name: name.into(),
            size,
            status: DocumentStatus::Uploading,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Upload accepted: take the server-issued id and start processing.
    pub fn promote(&mut self, server_id: DocumentId) -> bool {
        if !self.status.can_transition_to(DocumentStatus::Processing) {
            return false;
        }
        self.id = server_id;
        self.status = DocumentStatus::Processing;
        self.touch();
        true
    }

    /// Fold a status report into the record. Returns whether the status
    /// changed; a repeated `processing` report is not a change.
    pub fn apply_report(&mut self, report: &DocumentStatusReport) -> bool {
        if report.status == self.status || !self.status.can_transition_to(report.status) {
            return false;
        }
        if !report.name.is_empty() {
            self.name = report.name.clone();
        }
        if report.size > 0 {
            self.size = report.size;
        }
        self.status = report.status;
        self.error = match report.status {
            DocumentStatus::Error => Some(
                report
                    .error
                    .clone()
                    .unwrap_or_else(|| "processing failed".to_string()),
            ),
            _ => None,
        };
        self.touch();
        true
    }

    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if !self.status.can_transition_to(DocumentStatus::Error) {
            return false;
        }
        self.status = DocumentStatus::Error;
        self.error = Some(message.into());
        self.touch();
        true
    }

    /// Manual refresh: back to processing so the poll cycle can run again.
    /// Not allowed while the upload itself is still running.
    pub fn restart(&mut self) -> bool {
        if self.status == DocumentStatus::Uploading || self.id.is_placeholder() {
            return false;
        }
        self.status = DocumentStatus::Processing;
        self.error = None;
        self.touch();
        true
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Response body of the document status endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStatusReport {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: u64,
    pub status: DocumentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// File contents handed to the tracker.
#[derive(Clone, Debug)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Bytes,
    pub mime_type: Option<String>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}
