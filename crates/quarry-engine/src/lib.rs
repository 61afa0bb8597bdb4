//! Query orchestration and document ingestion on top of the backend
//! traits and the repository stores.

pub mod batch;
pub mod error;
pub mod ingestion;
pub mod orchestrator;

pub use batch::{BatchCoordinator, BatchEntry, BatchProgress};
pub use error::{EngineError, IngestError, QueryError};
pub use ingestion::{IngestionTracker, PollPolicy, UploadHandle, UploadUpdate};
pub use orchestrator::{QueryOrchestrator, QueryState};
