//! Repository interfaces for the state the client keeps between calls.
//!
//! The engine only depends on the traits. The in-memory implementations
//! back the CLI and the tests; a host application supplies its own.

pub mod documents;
pub mod error;
pub mod sessions;

pub use documents::{DocumentStore, MemoryDocumentStore};
pub use error::StoreError;
pub use sessions::{MemorySessionStore, SessionStore};
