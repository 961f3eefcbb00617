// Domain Layer - Pure business logic and entities

pub mod error;
pub mod job;
pub mod mode;
pub mod payload;
pub mod principal;
pub mod progress;

// Re-exports
pub use error::DomainError;
pub use job::{Job, JobError, JobErrorKind, JobId, JobKind, JobStatus, OwnerId, ProgressMeta};
pub use mode::QueueMode;
pub use payload::{DownloadPayload, GeneratePayload, JobPayload, ParsePayload};
pub use principal::{Principal, Scope};
pub use progress::ProgressUpdate;
