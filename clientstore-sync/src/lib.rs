pub mod archive;
pub mod backend;
pub mod config;
pub mod deletion;
pub mod progress;
pub mod upload;
pub mod worker;

pub use archive::{ArchiveDownloader, ArchiveError, DownloadJob};
pub use config::SyncConfig;
pub use progress::{ProgressEvent, ProgressSink};
pub use upload::{UploadItem, UploadOutcome};
pub use worker::{spawn_job, Job, JobHandle, JobOutcome};
