pub mod backend;
pub mod decoder;
pub mod http;
pub mod mock;

pub use backend::{BoxFrameStream, DocumentBackend, KnowledgeBackend, UploadProgress};
pub use decoder::{FrameDecoder, FrameStream};
pub use http::{BackendConfig, HttpBackend};
pub use mock::{MockBackend, MockReply, MockUpload};
