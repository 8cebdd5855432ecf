//! Error types used by the preemption runtime, its stages and its collaborators.
//!
//! - [`StageError`] failure of one pipeline stage attempt (drives retries).
//! - [`ClientError`] failure reported by a [`ResourceClient`](crate::ResourceClient).
//! - [`QueryError`] failure answering a state query.
//! - [`SignalError`] a trigger could not be enqueued.
//! - [`ConfigError`] configuration could not be loaded or is invalid.
//! - [`RuntimeError`] failure of the worker runtime itself.
//!
//! Every enum provides `as_label` (stable snake_case label for logs/metrics);
//! [`StageError`] and [`RuntimeError`] also provide `as_message`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Which activity deadline an attempt ran into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The attempt as a whole ran longer than `start_to_close_timeout`.
    StartToClose,
    /// The attempt stopped reporting liveness for longer than `heartbeat_timeout`.
    Heartbeat,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::StartToClose => f.write_str("start-to-close"),
            TimeoutKind::Heartbeat => f.write_str("heartbeat"),
        }
    }
}

/// # Errors produced by a stage attempt.
///
/// The activity runner consults [`StageError::is_retryable`] to decide whether
/// another attempt is scheduled. Retries exhausted on a retryable error end the
/// stage exactly like an immediate [`StageError::NonRetryable`].
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Transient failure; the runner may try again.
    #[error("stage failed: {reason}")]
    Retryable {
        /// What the stage or its client reported.
        reason: String,
    },

    /// Programmer or precondition error; must not be retried.
    #[error("stage failed ({kind}, no retry): {reason}")]
    NonRetryable {
        /// Coarse origin of the fault (`"resource"`, `"internal"`, ...).
        kind: &'static str,
        reason: String,
    },

    /// Attempt exceeded one of its deadlines.
    #[error("{kind} timeout after {timeout:?}")]
    Timeout {
        /// Which deadline was hit.
        kind: TimeoutKind,
        /// The configured deadline.
        timeout: Duration,
    },

    /// The control loop was cancelled before (or while) the stage could run.
    #[error("stage cancelled")]
    Canceled,
}

impl StageError {
    /// Builds a [`StageError::Retryable`].
    pub fn retryable(reason: impl fmt::Display) -> Self {
        StageError::Retryable {
            reason: reason.to_string(),
        }
    }

    /// Builds a [`StageError::NonRetryable`].
    pub fn non_retryable(kind: &'static str, reason: impl fmt::Display) -> Self {
        StageError::NonRetryable {
            kind,
            reason: reason.to_string(),
        }
    }

    /// Stable snake_case label, e.g. `stage_timeout`.
    ///
    /// # Example
    /// ```
    /// use preemptvisor::StageError;
    ///
    /// assert_eq!(StageError::retryable("boom").as_label(), "stage_retryable");
    /// assert_eq!(StageError::Canceled.as_label(), "stage_canceled");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            StageError::Retryable { .. } => "stage_retryable",
            StageError::NonRetryable { .. } => "stage_non_retryable",
            StageError::Timeout { .. } => "stage_timeout",
            StageError::Canceled => "stage_canceled",
        }
    }

    /// Returns a human-readable message for logs.
    pub fn as_message(&self) -> String {
        match self {
            StageError::Retryable { reason } => format!("retryable failure: {reason}"),
            StageError::NonRetryable { kind, reason } => format!("fatal {kind} failure: {reason}"),
            StageError::Timeout { kind, timeout } => format!("{kind} timeout after {timeout:?}"),
            StageError::Canceled => "cancelled".to_string(),
        }
    }

    /// Indicates whether another attempt may be scheduled.
    ///
    /// `true` for [`StageError::Retryable`] and [`StageError::Timeout`].
    ///
    /// # Example
    /// ```
    /// use preemptvisor::StageError;
    ///
    /// assert!(StageError::retryable("connection reset").is_retryable());
    /// assert!(!StageError::non_retryable("resource", "field missing").is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Retryable { .. } | StageError::Timeout { .. })
    }
}

/// # Errors reported by the remote resource API.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The referenced object (resource, tag, annotation field) does not exist.
    #[error("{what} not found")]
    NotFound { what: String },

    /// The object to be created already exists.
    #[error("{what} already exists")]
    AlreadyExists { what: String },

    /// The remote API refused the request (invalid state, permission, ...).
    #[error("request rejected: {reason}")]
    Rejected { reason: String },

    /// Connection or session level failure.
    #[error("transport error: {reason}")]
    Transport { reason: String },
}

impl ClientError {
    /// Stable snake_case label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ClientError::NotFound { .. } => "client_not_found",
            ClientError::AlreadyExists { .. } => "client_already_exists",
            ClientError::Rejected { .. } => "client_rejected",
            ClientError::Transport { .. } => "client_transport",
        }
    }

    /// Whether the same call may succeed when repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Transport { .. } | ClientError::Rejected { .. }
        )
    }
}

impl From<ClientError> for StageError {
    fn from(err: ClientError) -> Self {
        if err.is_transient() {
            StageError::retryable(err)
        } else {
            StageError::non_retryable("resource", err)
        }
    }
}

/// # Errors answering a state query.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum QueryError {
    /// No handler is registered under this query type.
    #[error("unknown query type {name:?}")]
    UnknownQueryType { name: String },

    /// The committed state could not be serialized.
    #[error("encode run state: {0}")]
    Encode(#[from] serde_json::Error),
}

impl QueryError {
    pub fn as_label(&self) -> &'static str {
        match self {
            QueryError::UnknownQueryType { .. } => "query_unknown_type",
            QueryError::Encode(_) => "query_encode",
        }
    }
}

/// Error returned by [`TriggerHandle`](crate::TriggerHandle).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    /// Signal queue is full (try again later or use async `signal`).
    #[error("signal queue full")]
    Full,

    /// The control loop has terminated.
    #[error("signal channel closed")]
    Closed,
}

/// # Errors loading or validating configuration.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is not valid TOML for [`Config`](crate::Config).
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of its accepted range.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// # Errors produced by the worker runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded while a stage was still running.
    #[error("shutdown timeout {grace:?} exceeded; active stages: {active:?}")]
    GraceExceeded {
        /// `Config::grace` at the time of shutdown.
        grace: Duration,
        /// Stages that had not reported completion.
        active: Vec<String>,
    },

    /// OS signal handlers could not be installed.
    #[error("install shutdown signal handler: {0}")]
    Signal(#[from] std::io::Error),

    /// The control loop task panicked.
    #[error("control loop panicked: {reason}")]
    LoopPanicked { reason: String },
}

impl RuntimeError {
    /// Label for logs; `runtime_*` prefixed.
    ///
    /// # Example
    /// ```
    /// use preemptvisor::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), active: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
            RuntimeError::Signal(_) => "runtime_signal",
            RuntimeError::LoopPanicked { .. } => "runtime_loop_panicked",
        }
    }

    /// Returns a human-readable message for logs.
    pub fn as_message(&self) -> String {
        match self {
            RuntimeError::GraceExceeded { grace, active } => {
                format!("grace exceeded after {grace:?}; active stages={active:?}")
            }
            RuntimeError::Signal(e) => format!("signal handler: {e}"),
            RuntimeError::LoopPanicked { reason } => format!("control loop panicked: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_are_retryable_cancellation_is_not() {
        let timeout = StageError::Timeout {
            kind: TimeoutKind::Heartbeat,
            timeout: Duration::from_secs(5),
        };
        assert!(timeout.is_retryable());
        assert!(!StageError::Canceled.is_retryable());
    }

    #[test]
    fn test_client_error_classification() {
        let transient: StageError = ClientError::Transport {
            reason: "connection reset".into(),
        }
        .into();
        assert!(transient.is_retryable());

        let missing: StageError = ClientError::NotFound {
            what: "tag \"preemptible\"".into(),
        }
        .into();
        assert!(!missing.is_retryable());
        assert_eq!(missing.as_label(), "stage_non_retryable");
    }

    #[test]
    fn test_messages_name_the_failure() {
        let timeout = StageError::Timeout {
            kind: TimeoutKind::StartToClose,
            timeout: Duration::from_secs(300),
        };
        assert_eq!(timeout.as_message(), "start-to-close timeout after 300s");

        let grace = RuntimeError::GraceExceeded {
            grace: Duration::from_secs(30),
            active: vec!["deactivate".into()],
        };
        assert_eq!(grace.as_message(), "grace exceeded after 30s; active stages=[\"deactivate\"]");
    }
}
