use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// One validation or compile finding, addressed by JSON path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyIssue {
    /// JSON path of the offending field, e.g. `$.rules[3].remote.ports`.
    pub path: String,
    pub message: String,
}

impl PolicyIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for PolicyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Closed set of outcome kinds. The wire carries `kind().as_str()` as
/// `errorCode` so callers can branch without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Unknown,
    InvalidArgument,
    NotFound,
    PermissionDenied,
    AccessDenied,
    InvalidPolicy,
    InvalidState,
    WfpError,
    ServiceError,
    ServiceUnavailable,
    IpcError,
    NetworkError,
    ProtocolVersionMismatch,
    RequestTooLarge,
    RequestTimeout,
    RateLimited,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::PermissionDenied => "PermissionDenied",
            Self::AccessDenied => "AccessDenied",
            Self::InvalidPolicy => "InvalidPolicy",
            Self::InvalidState => "InvalidState",
            Self::WfpError => "WfpError",
            Self::ServiceError => "ServiceError",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::IpcError => "IpcError",
            Self::NetworkError => "NetworkError",
            Self::ProtocolVersionMismatch => "ProtocolVersionMismatch",
            Self::RequestTooLarge => "RequestTooLarge",
            Self::RequestTimeout => "RequestTimeout",
            Self::RateLimited => "RateLimited",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every fallible operation in the control plane resolves to one of these.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Unknown(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid policy: {}", summarize_issues(.0))]
    InvalidPolicy(Vec<PolicyIssue>),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Filtering platform failure with the underlying status preserved.
    #[error("filtering platform error {code:#010x}: {message}")]
    Wfp { code: u32, message: String },

    #[error("service error: {0}")]
    Service(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("ipc error: {0}")]
    Ipc(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol version {requested} is not supported (supported range {min}..={current})")]
    ProtocolVersionMismatch {
        requested: i64,
        min: i64,
        current: i64,
    },

    #[error("request too large: {size} bytes exceeds limit of {max}")]
    RequestTooLarge { size: usize, max: usize },

    #[error("request timed out after {seconds}s")]
    RequestTimeout { seconds: u64 },

    #[error("Rate limit exceeded for '{identity}'; retry after the current window")]
    RateLimited { identity: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unknown(_) => ErrorKind::Unknown,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::AccessDenied(_) => ErrorKind::AccessDenied,
            Self::InvalidPolicy(_) => ErrorKind::InvalidPolicy,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Wfp { .. } => ErrorKind::WfpError,
            Self::Service(_) => ErrorKind::ServiceError,
            Self::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            Self::Ipc(_) => ErrorKind::IpcError,
            Self::Network(_) => ErrorKind::NetworkError,
            Self::ProtocolVersionMismatch { .. } => ErrorKind::ProtocolVersionMismatch,
            Self::RequestTooLarge { .. } => ErrorKind::RequestTooLarge,
            Self::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
        }
    }

    /// Issues attached to an `InvalidPolicy`, empty for everything else.
    pub fn issues(&self) -> &[PolicyIssue] {
        match self {
            Self::InvalidPolicy(issues) => issues,
            _ => &[],
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            std::io::ErrorKind::TimedOut => Self::RequestTimeout { seconds: 0 },
            _ => Self::Ipc(err.to_string()),
        }
    }
}

fn summarize_issues(issues: &[PolicyIssue]) -> String {
    match issues {
        [] => "no details".to_string(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{} (+{} more)", first, rest.len()),
    }
}
