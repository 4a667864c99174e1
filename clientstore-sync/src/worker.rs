//! Background execution of storage batches.
//!
//! A job runs on its own tokio task so the caller's thread stays free.
//! Progress comes back over an unbounded channel that the caller drains on
//! its own thread; the job never touches caller state directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use clientstore_common::{ErrorKind, StorageBackend};

use crate::archive::{ArchiveDownloader, DownloadJob};
use crate::deletion::{self, PurgeReport};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::upload::{self, ContentTypePolicy, RemoteKeyContext, RemotePathBuilder, UploadItem, UploadOutcome};

pub enum Job {
    Upload {
        items: Vec<UploadItem>,
        ctx: RemoteKeyContext,
        build_key: Arc<RemotePathBuilder>,
        content_type: ContentTypePolicy,
    },
    DownloadZip {
        downloader: Arc<ArchiveDownloader>,
        prefix: String,
        zip_name: Option<String>,
        out_dir: PathBuf,
        read_timeout: Duration,
    },
    Purge {
        prefix: String,
    },
    EnsureSubfolders {
        prefix: String,
        names: Vec<String>,
    },
}

impl Job {
    fn label(&self) -> &'static str {
        match self {
            Job::Upload { .. } => "upload",
            Job::DownloadZip { .. } => "download_zip",
            Job::Purge { .. } => "purge",
            Job::EnsureSubfolders { .. } => "ensure_subfolders",
        }
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    Uploaded(UploadOutcome),
    Downloaded(PathBuf),
    Purged(PurgeReport),
    FoldersEnsured(usize),
    Cancelled,
    Failed { kind: ErrorKind, message: String },
}

impl JobOutcome {
    fn failed(kind: ErrorKind, err: impl std::fmt::Display) -> Self {
        JobOutcome::Failed {
            kind,
            message: err.to_string(),
        }
    }

    /// Text for the user. Cancellation is informational and timeouts
    /// suggest trying again; duplicate skips are never mentioned.
    pub fn user_message(&self) -> String {
        match self {
            JobOutcome::Uploaded(o) if o.failures.is_empty() => {
                format!("{} file(s) uploaded.", o.ok_count)
            }
            JobOutcome::Uploaded(o) => format!(
                "{} file(s) uploaded, {} failed.",
                o.ok_count,
                o.failures.len()
            ),
            JobOutcome::Downloaded(path) => format!("Saved to {}.", path.display()),
            JobOutcome::Purged(r) if r.failed == 0 => format!("{} file(s) removed.", r.removed),
            JobOutcome::Purged(r) => format!(
                "{} file(s) removed, {} could not be removed.",
                r.removed, r.failed
            ),
            JobOutcome::FoldersEnsured(n) => format!("{} folder(s) created.", n),
            JobOutcome::Cancelled => "Download cancelled.".to_string(),
            JobOutcome::Failed {
                kind: ErrorKind::Timeout,
                ..
            } => "The server took too long to respond. Please try again.".to_string(),
            JobOutcome::Failed {
                kind: ErrorKind::AccessDenied,
                ..
            } => "Access denied by the storage server.".to_string(),
            JobOutcome::Failed { message, .. } => format!("Operation failed: {}", message),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, JobOutcome::Failed { .. })
    }
}

pub struct JobHandle {
    pub progress: mpsc::UnboundedReceiver<ProgressEvent>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<JobOutcome>,
}

impl JobHandle {
    /// Request cancellation. Only archive downloads stop mid-transfer;
    /// other jobs finish the item in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the job, treating a panicked task as a failure.
    pub async fn wait(self) -> JobOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => JobOutcome::failed(ErrorKind::Transport, e),
        }
    }
}

/// Run `job` against `backend` on a background task.
pub fn spawn_job(backend: Arc<dyn StorageBackend>, job: Job) -> JobHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    let join = tokio::spawn(async move {
        let label = job.label();
        info!(job = label, bucket = %backend.bucket(), "Job started");
        let outcome = run_job(backend.as_ref(), job, &tx, task_cancel).await;
        if let JobOutcome::Failed { kind, message } = &outcome {
            error!(job = label, kind = %kind, error = %message, "Job failed");
        } else {
            info!(job = label, "Job finished");
        }
        outcome
    });

    JobHandle {
        progress: rx,
        cancel,
        join,
    }
}

async fn run_job(
    backend: &dyn StorageBackend,
    job: Job,
    tx: &mpsc::UnboundedSender<ProgressEvent>,
    cancel: CancellationToken,
) -> JobOutcome {
    let sink: &dyn ProgressSink = tx;

    match job {
        Job::Upload {
            items,
            ctx,
            build_key,
            content_type,
        } => {
            let outcome =
                upload::upload_items(backend, &items, &ctx, build_key.as_ref(), &content_type, Some(sink))
                    .await;
            JobOutcome::Uploaded(outcome)
        }
        Job::DownloadZip {
            downloader,
            prefix,
            zip_name,
            out_dir,
            read_timeout,
        } => {
            let mut dl = DownloadJob::new(backend.bucket(), prefix);
            dl.zip_name = zip_name;
            dl.cancel = cancel;
            match downloader
                .download_folder_as_zip(&dl, &out_dir, read_timeout, Some(sink))
                .await
            {
                Ok(path) => JobOutcome::Downloaded(path),
                Err(e) if e.kind() == ErrorKind::Cancelled => JobOutcome::Cancelled,
                Err(e) => JobOutcome::failed(e.kind(), e),
            }
        }
        Job::Purge { prefix } => match deletion::remove_prefix(backend, &prefix, Some(sink)).await {
            Ok(report) => JobOutcome::Purged(report),
            Err(e) => JobOutcome::failed(e.kind(), e),
        },
        Job::EnsureSubfolders { prefix, names } => {
            match deletion::ensure_mandatory_subfolders(backend, &prefix, &names).await {
                Ok(n) => JobOutcome::FoldersEnsured(n),
                Err(e) => JobOutcome::failed(e.kind(), e),
            }
        }
    }
}
