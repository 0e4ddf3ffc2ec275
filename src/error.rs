//! Error types for worker-farm.

use serde_json::{Map, Value};
use thiserror::Error;

/// Main error type for worker-farm.
///
/// Every variant carries a stable [`kind`](FarmError::kind) tag that callers
/// can branch on, plus a human-readable message via `Display`.
#[derive(Error, Debug)]
pub enum FarmError {
    /// The call exceeded its effective `max_call_time`. Never retried.
    #[error("{0}")]
    Timeout(String),

    /// The worker running the call died repeatedly and retries ran out.
    #[error("{0}")]
    ProcessTerminated(String),

    /// Admission rejected: the farm is at its concurrent call limit.
    #[error("{0}")]
    MaxConcurrentCalls(String),

    /// A worker failed to start or to finish its async-init handshake.
    #[error("{0}")]
    WorkerInit(String),

    /// The farm is shutting down and no longer accepts calls.
    #[error("Worker farm is shutting down")]
    ShuttingDown,

    /// An error raised by the worker module, reconstructed from the wire.
    #[error("{0}")]
    Remote(RemoteError),

    /// Invalid farm configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FarmError {
    /// Stable tag identifying the kind of failure.
    pub fn kind(&self) -> &str {
        match self {
            Self::Timeout(_) => "TimeoutError",
            Self::ProcessTerminated(_) => "ProcessTerminatedError",
            Self::MaxConcurrentCalls(_) => "MaxConcurrentCallsError",
            Self::WorkerInit(_) => "WorkerInitError",
            Self::ShuttingDown => "ShuttingDownError",
            Self::Remote(e) => e.type_name(),
            Self::Config(_) => "ConfigError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
        }
    }

    /// The reconstructed worker-side error, if this is one.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for worker-farm operations.
pub type Result<T> = std::result::Result<T, FarmError>;

/// Error kinds a worker module can report.
///
/// Tags received from a worker are mapped through [`RemoteErrorKind::from_tag`];
/// anything unrecognised becomes [`RemoteErrorKind::Generic`] while the
/// original tag is kept on the [`RemoteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    Generic,
    Type,
    Range,
    InvalidArgument,
    NotFound,
    Unsupported,
    NoSuchMethod,
}

impl RemoteErrorKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "TypeError" => Self::Type,
            "RangeError" => Self::Range,
            "InvalidArgument" => Self::InvalidArgument,
            "NotFound" => Self::NotFound,
            "Unsupported" => Self::Unsupported,
            "NoSuchMethod" => Self::NoSuchMethod,
            _ => Self::Generic,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Generic => "Error",
            Self::Type => "TypeError",
            Self::Range => "RangeError",
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::Unsupported => "Unsupported",
            Self::NoSuchMethod => "NoSuchMethod",
        }
    }
}

/// An error produced by a worker module and carried back over the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    kind: RemoteErrorKind,
    type_name: String,
    message: String,
    stack: Option<String>,
    fields: Map<String, Value>,
}

impl RemoteError {
    /// Reconstruct from a kind tag as sent by the worker.
    pub fn from_parts(
        type_name: impl Into<String>,
        message: impl Into<String>,
        stack: Option<String>,
        fields: Map<String, Value>,
    ) -> Self {
        let type_name = type_name.into();
        Self {
            kind: RemoteErrorKind::from_tag(&type_name),
            type_name,
            message: message.into(),
            stack,
            fields,
        }
    }

    pub fn kind(&self) -> RemoteErrorKind {
        self.kind
    }

    /// The tag the worker sent, even when it mapped to `Generic`.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    /// Custom fields the worker attached to the error.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteError {}
