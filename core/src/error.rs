use thiserror::Error;

/// Classification used by the dispatcher and sinks to decide whether a
/// failure should be retried, dead-lettered, or treated as fatal.
///
/// Propagation policy groups these into recovered-locally, retryable,
/// permanent, and fatal buckets via [`ErrorKind::disposition`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    IoRead,
    IoWrite,
    Parse,
    Permission,
    NetworkTransient,
    NetworkPermanent,
    RateLimited,
    SchemaRejected,
    TimestampTooOld,
    TimestampTooNew,
    OutOfOrder,
    DiskFull,
    ConfigInvalid,
    ShutdownTimeout,
}

/// Where a failure of this kind should be routed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// Handled at the point of occurrence; never surfaces past the monitor/sink.
    RecoveredLocally,
    /// Re-enqueued onto the dispatcher's low-priority retry queue.
    Retryable,
    /// Written directly to the DLQ; no further retry.
    Permanent,
    /// Process cannot continue (startup only).
    Fatal,
}

impl ErrorKind {
    pub fn disposition(&self) -> Disposition {
        use Disposition::*;
        use ErrorKind::*;
        match self {
            IoRead | Parse | NetworkTransient | RateLimited => RecoveredLocally,
            IoWrite => Retryable,
            SchemaRejected | TimestampTooOld | TimestampTooNew | OutOfOrder | Permission => {
                Permanent
            }
            NetworkPermanent | DiskFull => Permanent,
            ConfigInvalid | ShutdownTimeout => Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.disposition(), Disposition::Retryable)
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("container runtime error: {0}")]
    Container(#[from] bollard::errors::Error),

    #[error("{kind:?}: {message}")]
    Classified { kind: ErrorKind, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl IngestError {
    pub fn classified(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Classified {
            kind,
            message: message.into(),
        }
    }

    /// Best-effort classification for errors that did not originate as
    /// [`IngestError::Classified`]. IO/serialization errors map to their
    /// nearest spec'd kind; anything else is treated as a permanent failure
    /// since it is, by construction, unanticipated.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Classified { kind, .. } => *kind,
            IngestError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorKind::Permission
            }
            IngestError::Io(_) => ErrorKind::IoRead,
            IngestError::Serialization(_) => ErrorKind::Parse,
            IngestError::Http(e) if e.is_timeout() || e.is_connect() => ErrorKind::NetworkTransient,
            IngestError::Http(_) => ErrorKind::NetworkPermanent,
            IngestError::Container(_) => ErrorKind::NetworkTransient,
            IngestError::Config(_) => ErrorKind::ConfigInvalid,
            IngestError::Cancelled(_) => ErrorKind::ShutdownTimeout,
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
