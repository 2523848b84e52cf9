pub mod engine;
pub mod local;
pub mod source;
pub mod transport;

pub use engine::{ClientUploadTask, EngineOptions, ProgressCallback, TaskId, UploadEngine, UploadStatus};
pub use local::LocalTransport;
pub use source::{chunk_range, FileSource, UploadFile};
pub use transport::{ByteProgress, HttpTransport, UploadTransport};
