mod error;
mod store;

pub use error::{UploadError, UploadResult};
pub use store::{
    safe_filename, validate_upload_id, AssembledUpload, ChunkReceipt, CleanupEntry,
    CleanupOutcome, CleanupReport, UploadSession, UploadStatus, UploadStore,
};
