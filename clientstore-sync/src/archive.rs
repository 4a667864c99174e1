//! Folder download as a server-side zip.
//!
//! The archive function zips every object under a prefix on demand. The
//! response is streamed into `<name>.part` next to the destination and only
//! renamed to its final name once every declared byte has arrived, so a
//! half-written archive never carries the final name.
//!
//! Per request: Requesting → Streaming → Finalizing → Done | Cancelled | Failed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, Response};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use clientstore_common::keys::{last_segment, normalize_path};
use clientstore_common::ErrorKind;

use crate::progress::{self, ProgressSink};

pub const ZIPPER_PATH: &str = "/functions/v1/zipper";
/// Size of the buffer in front of the `.part` file. Network chunks arrive
/// at whatever size the transport delivers; cancellation is checked once
/// per received chunk.
pub const WRITE_BUFFER_SIZE: usize = 256 * 1024;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);

const FALLBACK_NAME: &str = "pasta";
const PART_SUFFIX: &str = ".part";
const ERROR_BODY_LIMIT: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    Requesting,
    Streaming,
    Finalizing,
}

impl fmt::Display for DownloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadPhase::Requesting => "requesting the archive",
            DownloadPhase::Streaming => "streaming the archive",
            DownloadPhase::Finalizing => "finalizing the archive",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("download cancelled")]
    Cancelled,
    #[error("timed out while {0}")]
    Timeout(DownloadPhase),
    #[error("archive truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },
    #[error("archive function rejected the request (HTTP {status}): {detail}")]
    ServerRejected { status: u16, detail: String },
    #[error("invalid archive request: {0}")]
    InvalidRequest(String),
    #[error("HTTP error while {phase}: {source}")]
    Transport {
        phase: DownloadPhase,
        #[source]
        source: reqwest::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::Cancelled => ErrorKind::Cancelled,
            ArchiveError::Timeout(_) => ErrorKind::Timeout,
            ArchiveError::Truncated { .. } => ErrorKind::Truncated,
            ArchiveError::ServerRejected { status: 401 | 403, .. } => ErrorKind::AccessDenied,
            ArchiveError::ServerRejected { .. } => ErrorKind::ServerRejected,
            ArchiveError::InvalidRequest(_) => ErrorKind::InvalidKey,
            ArchiveError::Transport { .. } | ArchiveError::Io(_) => ErrorKind::Transport,
        }
    }

    fn from_reqwest(phase: DownloadPhase, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            ArchiveError::Timeout(phase)
        } else {
            ArchiveError::Transport { phase, source }
        }
    }
}

/// One folder-to-zip request. Owned by the caller for the duration of a
/// single download; `cancel` may be triggered from any thread.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub bucket: String,
    pub prefix: String,
    pub zip_name: Option<String>,
    pub cancel: CancellationToken,
}

impl DownloadJob {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
            zip_name: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.zip_name = Some(name.into());
        self
    }

    /// `zip_name`, else the last prefix segment, else `pasta`; always `.zip`.
    pub fn desired_file_name(&self) -> String {
        let base = self
            .zip_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .unwrap_or_else(|| last_segment(&normalize_path(&self.prefix)).to_string());
        let base = sanitize_file_name(&base).unwrap_or_else(|| FALLBACK_NAME.to_string());

        let stem = strip_zip_extension(&base);
        let stem = if stem.is_empty() { FALLBACK_NAME } else { stem };
        format!("{}.zip", stem)
    }
}

fn strip_zip_extension(name: &str) -> &str {
    match name.len().checked_sub(4) {
        Some(idx) if name.is_char_boundary(idx) && name[idx..].eq_ignore_ascii_case(".zip") => {
            &name[..idx]
        }
        _ => name,
    }
}

pub struct ArchiveDownloader {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ArchiveDownloader {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, ArchiveError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ArchiveError::from_reqwest(DownloadPhase::Requesting, e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn zipper_url(&self, job: &DownloadJob, name: &str) -> String {
        format!(
            "{}{}?bucket={}&prefix={}&name={}",
            self.base_url,
            ZIPPER_PATH,
            urlencoding::encode(job.bucket.trim()),
            urlencoding::encode(&normalize_path(&job.prefix)),
            urlencoding::encode(name)
        )
    }

    /// Download everything under `job.prefix` as one zip into `out_dir`.
    ///
    /// `read_timeout` bounds the wait for the response and for each chunk;
    /// archive generation time grows with folder size.
    pub async fn download_folder_as_zip(
        &self,
        job: &DownloadJob,
        out_dir: &Path,
        read_timeout: Duration,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<PathBuf, ArchiveError> {
        if job.bucket.trim().is_empty() {
            return Err(ArchiveError::InvalidRequest("bucket must not be empty".into()));
        }
        if normalize_path(&job.prefix).is_empty() {
            return Err(ArchiveError::InvalidRequest("prefix must not be empty".into()));
        }
        let desired = job.desired_file_name();

        info!(bucket = %job.bucket, prefix = %job.prefix, name = %desired, "Requesting folder archive");

        let request = self
            .client
            .get(self.zipper_url(job, &desired))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("apikey", &self.api_key)
            .header("Accept", "application/zip,application/json")
            // Compressed transfer would make Content-Length useless for the size check.
            .header("Accept-Encoding", "identity")
            .send();

        let resp = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => {
                info!(prefix = %job.prefix, "Archive download cancelled before response");
                return Err(ArchiveError::Cancelled);
            }
            res = tokio::time::timeout(read_timeout, request) => match res {
                Err(_) => return Err(ArchiveError::Timeout(DownloadPhase::Requesting)),
                Ok(Err(e)) => return Err(ArchiveError::from_reqwest(DownloadPhase::Requesting, e)),
                Ok(Ok(resp)) => resp,
            },
        };

        let status = resp.status().as_u16();
        if status != 200 {
            let detail = read_error_detail(resp, read_timeout).await;
            warn!(status, detail = %detail, "Archive function rejected request");
            return Err(ArchiveError::ServerRejected { status, detail });
        }

        let content_type = header_str(&resp, CONTENT_TYPE).unwrap_or_default();
        if !is_zip_content_type(&content_type) {
            let detail = read_error_detail(resp, read_timeout).await;
            let detail = format!("unexpected content type {:?}: {}", content_type, detail);
            warn!(detail = %detail, "Archive function returned a non-zip body");
            return Err(ArchiveError::ServerRejected { status, detail });
        }

        let expected = header_str(&resp, CONTENT_LENGTH).and_then(|v| v.trim().parse::<u64>().ok());
        let file_name = header_str(&resp, CONTENT_DISPOSITION)
            .and_then(|v| filename_from_disposition(&v))
            .and_then(|n| sanitize_file_name(&n))
            .unwrap_or(desired);

        tokio::fs::create_dir_all(out_dir).await?;
        let final_path = unique_path(out_dir, &file_name);
        let part_path = part_path_for(&final_path);

        debug!(path = %part_path.display(), expected = ?expected, "Streaming archive");

        let mut source = ResponseChunks {
            resp,
            read_timeout,
        };
        let written = match stream_to_part(
            &mut source,
            &part_path,
            expected,
            &job.cancel,
            progress,
            &job.prefix,
        )
        .await
        {
            Ok(n) => n,
            Err(ArchiveError::Cancelled) => {
                info!(prefix = %job.prefix, "Archive download cancelled");
                return Err(ArchiveError::Cancelled);
            }
            Err(e) => {
                warn!(prefix = %job.prefix, error = %e, "Archive download failed");
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&part_path, &final_path).await {
            remove_partial(&part_path).await;
            return Err(e.into());
        }

        info!(path = %final_path.display(), bytes = written, "Archive download complete");
        Ok(final_path)
    }
}

// ── Streaming ────────────────────────────────────────────────────────────────

/// Pull-based body reader, so the streaming loop can run against something
/// other than a live HTTP response.
#[async_trait]
trait ChunkSource: Send {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ArchiveError>;
}

struct ResponseChunks {
    resp: Response,
    read_timeout: Duration,
}

#[async_trait]
impl ChunkSource for ResponseChunks {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, ArchiveError> {
        match tokio::time::timeout(self.read_timeout, self.resp.chunk()).await {
            Err(_) => Err(ArchiveError::Timeout(DownloadPhase::Streaming)),
            Ok(Err(e)) => Err(ArchiveError::from_reqwest(DownloadPhase::Streaming, e)),
            Ok(Ok(chunk)) => Ok(chunk),
        }
    }
}

/// Stream `source` into `part`, removing the partial file on any failure.
async fn stream_to_part<S: ChunkSource>(
    source: &mut S,
    part: &Path,
    expected: Option<u64>,
    cancel: &CancellationToken,
    progress: Option<&dyn ProgressSink>,
    label: &str,
) -> Result<u64, ArchiveError> {
    match write_part(source, part, expected, cancel, progress, label).await {
        Ok(written) => Ok(written),
        Err(e) => {
            remove_partial(part).await;
            Err(e)
        }
    }
}

async fn write_part<S: ChunkSource>(
    source: &mut S,
    part: &Path,
    expected: Option<u64>,
    cancel: &CancellationToken,
    progress: Option<&dyn ProgressSink>,
    label: &str,
) -> Result<u64, ArchiveError> {
    let file = tokio::fs::File::create(part).await?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
    let mut written: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ArchiveError::Cancelled),
            next = source.next_chunk() => next,
        };

        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            // Connection closed before the declared length arrived.
            Err(ArchiveError::Transport { .. }) if expected.is_some_and(|exp| written < exp) => {
                return Err(ArchiveError::Truncated {
                    expected: expected.unwrap_or_default(),
                    received: written,
                });
            }
            Err(e) => return Err(e),
        };

        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
        progress::report(progress, written, expected, label);
    }

    writer.flush().await?;
    writer.get_ref().sync_all().await?;

    if let Some(expected) = expected {
        if written != expected {
            return Err(ArchiveError::Truncated {
                expected,
                received: written,
            });
        }
    }

    Ok(written)
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial archive"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial archive"),
    }
}

// ── Response helpers ─────────────────────────────────────────────────────────

fn header_str(resp: &Response, name: reqwest::header::HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn is_zip_content_type(value: &str) -> bool {
    value
        .split(';')
        .next()
        .map(|mime| mime.trim().eq_ignore_ascii_case("application/zip"))
        .unwrap_or(false)
}

/// Read a short error body and pull out a JSON `error`/`message`/`detail`
/// field when there is one.
async fn read_error_detail(mut resp: Response, read_timeout: Duration) -> String {
    let status = resp.status();
    let mut body: Vec<u8> = Vec::new();
    while body.len() < ERROR_BODY_LIMIT {
        match tokio::time::timeout(read_timeout, resp.chunk()).await {
            Ok(Ok(Some(chunk))) => body.extend_from_slice(&chunk),
            _ => break,
        }
    }
    body.truncate(ERROR_BODY_LIMIT);
    let text = String::from_utf8_lossy(&body).trim().to_string();

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
        for field in ["error", "message", "detail"] {
            if let Some(s) = json.get(field).and_then(|v| v.as_str()) {
                return s.to_string();
            }
        }
    }
    if text.is_empty() {
        status.canonical_reason().unwrap_or("no detail").to_string()
    } else {
        text
    }
}

/// File name from a Content-Disposition value. `filename*=UTF-8''…` wins
/// over a plain `filename=`.
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';') {
        let Some((key, val)) = part.trim().split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let val = val.trim().trim_matches('"');
        if key == "filename*" {
            let encoded = val.splitn(3, '\'').nth(2).unwrap_or(val);
            if let Ok(decoded) = urlencoding::decode(encoded) {
                if !decoded.trim().is_empty() {
                    return Some(decoded.into_owned());
                }
            }
        } else if key == "filename" && !val.is_empty() {
            plain = Some(val.to_string());
        }
    }
    plain
}

/// Reduce a server-suggested name to a bare file name.
fn sanitize_file_name(name: &str) -> Option<String> {
    let name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let name: String = name.chars().filter(|c| !c.is_control()).collect();
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

/// `dir/name`, or `dir/stem (n).ext` for the first free `n`.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    let mut n = 1u32;
    loop {
        let numbered = match ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dir.join(numbered);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

fn part_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PART_SUFFIX);
    final_path.with_file_name(name)
}
