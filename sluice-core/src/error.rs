//! Structured error types for sluice-core.
//!
//! Uses `thiserror` so callers can match on the failure class.
//! The CLI wraps these in `anyhow` for context, library consumers
//! get the full taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Coarse failure class used by [`crate::retry::RetryPolicy`] to decide
/// whether an operation is worth re-attempting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Cannot acquire or keep a connection.
    Connection,
    /// Contention or timeout; likely to succeed on retry.
    Transient,
    /// Will fail identically on retry.
    Permanent,
}

/// Main error type for sluice-core operations
#[derive(Error, Debug)]
pub enum DbError {
    /// Connection could not be acquired or was lost
    #[error("connection error: {reason}")]
    Connection { reason: String },

    /// Serialization conflict, deadlock, lock wait timeout
    #[error("transient query error: {reason}")]
    TransientQuery {
        reason: String,
        sqlstate: Option<String>,
    },

    /// Malformed query, constraint violation, type mismatch
    #[error("permanent query error: {reason}")]
    PermanentQuery {
        reason: String,
        sqlstate: Option<String>,
    },

    /// Attempt budget used up; wraps the failure of the final attempt
    #[error("gave up after {attempts} attempt(s): {last}")]
    ExhaustedRetries {
        attempts: u32,
        #[source]
        last: Box<DbError>,
    },

    /// An external deadline aborted an attempt or a backoff wait
    #[error("deadline exceeded after {elapsed:?}")]
    DeadlineExceeded { elapsed: Duration },

    /// Caller passed a value outside the accepted range
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Configuration error
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// A concurrent fetch task panicked or was cancelled
    #[error("fetch task {index} failed: {reason}")]
    TaskFailed { index: usize, reason: String },
}

/// Result type alias for sluice-core operations
pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Create a connection error
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    /// Create a transient query error without a SQLSTATE
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientQuery {
            reason: reason.into(),
            sqlstate: None,
        }
    }

    /// Create a permanent query error without a SQLSTATE
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentQuery {
            reason: reason.into(),
            sqlstate: None,
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a config error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Build an error of the given class.
    pub fn of_kind(kind: FailureKind, reason: impl Into<String>) -> Self {
        match kind {
            FailureKind::Connection => Self::connection(reason),
            FailureKind::Transient => Self::transient(reason),
            FailureKind::Permanent => Self::permanent(reason),
        }
    }

    /// Build a query error from an engine-reported SQLSTATE.
    pub fn from_sqlstate(code: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let sqlstate = Some(code.to_string());
        match classify_sqlstate(code) {
            FailureKind::Connection => Self::Connection {
                reason: format!("{reason} (SQLSTATE {code})"),
            },
            FailureKind::Transient => Self::TransientQuery { reason, sqlstate },
            FailureKind::Permanent => Self::PermanentQuery { reason, sqlstate },
        }
    }

    /// Failure class of this error.
    ///
    /// `ExhaustedRetries` reports the class of the wrapped failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Connection { .. } => FailureKind::Connection,
            Self::TransientQuery { .. } => FailureKind::Transient,
            Self::ExhaustedRetries { last, .. } => last.kind(),
            _ => FailureKind::Permanent,
        }
    }

    /// True when re-running the whole operation may succeed.
    ///
    /// An `ExhaustedRetries` is never transient itself, so nested
    /// retry loops do not multiply the attempt budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::TransientQuery { .. }
        )
    }

    /// The SQLSTATE reported by the engine, if any.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::TransientQuery { sqlstate, .. } | Self::PermanentQuery { sqlstate, .. } => {
                sqlstate.as_deref()
            }
            Self::ExhaustedRetries { last, .. } => last.sqlstate(),
            _ => None,
        }
    }

    /// The underlying failure: the wrapped error for `ExhaustedRetries`,
    /// `self` otherwise.
    pub fn last_failure(&self) -> &DbError {
        match self {
            Self::ExhaustedRetries { last, .. } => last.last_failure(),
            other => other,
        }
    }
}

/// Classify a PostgreSQL-style SQLSTATE code.
///
/// - `40001` serialization failure, `40P01` deadlock, `55P03` lock not
///   available, `57014` statement timeout / cancel: transient
/// - class `08`, `53300` too many connections, `57P01..57P03` shutdown:
///   connection
/// - everything else: permanent
pub fn classify_sqlstate(code: &str) -> FailureKind {
    match code {
        "40001" | "40P01" | "55P03" | "57014" => FailureKind::Transient,
        "53300" | "57P01" | "57P02" | "57P03" => FailureKind::Connection,
        _ if code.starts_with("08") => FailureKind::Connection,
        _ => FailureKind::Permanent,
    }
}
