use std::fmt;

/// Coarse classification shared by every storage operation, used to pick
/// the message shown to the user and whether a batch skips or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// User-initiated abort. Not a failure.
    Cancelled,
    /// Connect or read timeout; worth retrying.
    Timeout,
    /// Fewer bytes arrived than the response declared.
    Truncated,
    /// Non-200 status or unexpected content type from a server function.
    ServerRejected,
    /// Object already exists.
    Duplicate,
    /// Authorization or row-level-security rejection.
    AccessDenied,
    /// Malformed storage key or request parameters.
    InvalidKey,
    /// Any other network or I/O failure.
    Transport,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Truncated => "truncated",
            ErrorKind::ServerRejected => "server_rejected",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::InvalidKey => "invalid_key",
            ErrorKind::Transport => "transport",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("storage API error (HTTP {status}): {error} - {message}")]
    Api {
        status: u16,
        error: String,
        message: String,
    },
    #[error("object already exists: {0}")]
    AlreadyExists(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),
    #[error("failed to decode storage response: {0}")]
    Decode(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Build an API error from an HTTP status and a (possibly empty) body.
    ///
    /// The store sometimes answers 400 with `"statusCode": "409"` inside the
    /// JSON body; the embedded code wins over the transport status.
    pub fn from_response(status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();
        match parsed {
            Some(b) => StorageError::Api {
                status: b.status_code().unwrap_or(status),
                error: b.error.unwrap_or_default(),
                message: b.message.unwrap_or_else(|| truncate(body, 200)),
            },
            None => StorageError::Api {
                status,
                error: String::new(),
                message: truncate(body, 200),
            },
        }
    }

    /// True for "object already present" conditions, which batch uploads
    /// treat as a benign skip.
    ///
    /// Only the store's own answer counts. Transport and local errors carry
    /// keys and URLs in their text, which must never be read as a status.
    pub fn is_duplicate(&self) -> bool {
        match self {
            StorageError::AlreadyExists(_) => true,
            StorageError::Api {
                status,
                error,
                message,
            } => {
                *status == 409
                    || error.eq_ignore_ascii_case("duplicate")
                    || mentions_already_exists(message)
                    || mentions_already_exists(error)
            }
            StorageError::Http(_)
            | StorageError::Io(_)
            | StorageError::NotFound(_)
            | StorageError::InvalidKey(_)
            | StorageError::Decode(_) => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_duplicate() {
            return ErrorKind::Duplicate;
        }
        match self {
            StorageError::Http(e) if e.is_timeout() => ErrorKind::Timeout,
            StorageError::Http(_) | StorageError::Io(_) | StorageError::Decode(_) => {
                ErrorKind::Transport
            }
            StorageError::Api { status, message, .. } => match *status {
                401 | 403 => ErrorKind::AccessDenied,
                _ if message.to_ascii_lowercase().contains("row-level security") => {
                    ErrorKind::AccessDenied
                }
                400 if message.to_ascii_lowercase().contains("invalid key") => {
                    ErrorKind::InvalidKey
                }
                408 | 504 => ErrorKind::Timeout,
                _ => ErrorKind::ServerRejected,
            },
            StorageError::InvalidKey(_) => ErrorKind::InvalidKey,
            StorageError::NotFound(_) => ErrorKind::ServerRejected,
            StorageError::AlreadyExists(_) => ErrorKind::Duplicate,
        }
    }
}

fn mentions_already_exists(text: &str) -> bool {
    text.to_ascii_lowercase().contains("already exists")
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Error payload returned by the storage REST API.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    #[serde(default)]
    pub status_code: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiErrorBody {
    /// `statusCode` arrives as either a string or a number.
    pub fn status_code(&self) -> Option<u16> {
        match self.status_code.as_ref()? {
            serde_json::Value::String(s) => s.trim().parse().ok(),
            serde_json::Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            _ => None,
        }
    }
}
