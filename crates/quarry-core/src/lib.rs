pub mod config;
pub mod dispatch;
pub mod document;
pub mod errors;
pub mod frame;
pub mod ids;
pub mod messages;
pub mod seeds;
pub mod session;

pub use config::QueryConfig;
pub use dispatch::{dispatch, Outcome};
pub use document::{Document, DocumentStatus, DocumentStatusReport, UploadFile};
pub use errors::{ProtocolError, TransportError, ValidationError};
pub use frame::{Frame, RawFrame};
pub use ids::{DocumentId, QueryId, SessionId};
pub use messages::{Message, Role};
pub use seeds::KnowledgeSeed;
pub use session::{Phase, Session};
