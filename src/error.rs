//! Error types shared across the service.
//!
//! Every subsystem reports failures through [`AppError`]. The variants map
//! one-to-one onto the HTTP error envelope (see `server::error`), and the
//! sync workers classify retryability from the rendered message, so
//! `Display` keeps upstream messages unmodified wherever callers inspect
//! them.

use std::fmt;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Clone)]
pub enum AppError {
    /// Bad input: missing source/target, invalid id, malformed body.
    Validation(String),
    /// Missing task/pipe/archive/credential id.
    NotFound(String),
    /// Optimistic-concurrency conflict or retry of a running task. Pipe
    /// conflicts carry the current version and concurrency token so the
    /// caller can rebase.
    Conflict {
        message: String,
        current_version: Option<i64>,
        current_updated_at: Option<String>,
    },
    /// Registry rejected the supplied credentials.
    Auth(String),
    /// Masked or empty password would have been sent to a registry.
    AuthGate(String),
    /// Upstream registry failure. `status` is set when the registry
    /// answered with an HTTP error, `detail` carries its parsed error body.
    Upstream {
        status: Option<u16>,
        message: String,
        detail: Option<String>,
    },
    /// Cooperative cancellation (user request or fail-fast).
    Canceled(String),
    /// File system failure on the data directory.
    Io(String),
    /// Malformed JSON in an authoritative file or response body.
    Parse(String),
    /// Anything else.
    Internal(String),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        AppError::Conflict {
            message: msg.into(),
            current_version: None,
            current_updated_at: None,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AppError::Internal(msg.into())
    }

    /// Upstream failure with no HTTP status attached (timeouts, resets).
    pub fn upstream(msg: impl Into<String>) -> Self {
        AppError::Upstream {
            status: None,
            message: msg.into(),
            detail: None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, AppError::Canceled(_))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Validation(msg) => write!(f, "{}", msg),
            AppError::NotFound(msg) => write!(f, "{}", msg),
            AppError::Conflict { message, .. } => write!(f, "{}", message),
            AppError::Auth(msg) => write!(f, "{}", msg),
            AppError::AuthGate(msg) => write!(f, "{}", msg),
            AppError::Upstream {
                status: Some(code),
                message,
                ..
            } => write!(f, "upstream status {}: {}", code, message),
            AppError::Upstream { message, .. } => write!(f, "{}", message),
            AppError::Canceled(msg) => write!(f, "{}", msg),
            AppError::Io(msg) => write!(f, "io error: {}", msg),
            AppError::Parse(msg) => write!(f, "parse error: {}", msg),
            AppError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Upstream {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
            detail: None,
        }
    }
}

impl From<url::ParseError> for AppError {
    fn from(err: url::ParseError) -> Self {
        AppError::Validation(err.to_string())
    }
}
