//! Error and status types for pvdb.
//!
//! Failures that abort an operation are strongly typed with thiserror
//! (`DatabaseError`). Operations that always complete but need to report how
//! they went (monitor start/stop, channel requests) hand back a `Status`
//! carrying a severity and a message, so callers can inspect the outcome
//! without matching on control flow.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Severity of a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusType {
    /// The operation succeeded.
    Ok,
    /// The operation did nothing but the caller should know why.
    Warning,
    /// The operation failed.
    Error,
    /// The operation failed unexpectedly (for example record processing panicked).
    Fatal,
}

impl fmt::Display for StatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Outcome of an operation, paired with any data the operation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    kind: StatusType,
    message: Cow<'static, str>,
}

impl Status {
    /// The success status.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            kind: StatusType::Ok,
            message: Cow::Borrowed(""),
        }
    }

    /// Creates a status with the given severity and message.
    #[must_use]
    pub fn new(kind: StatusType, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a warning status.
    #[must_use]
    pub fn warning(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(StatusType::Warning, message)
    }

    /// Creates an error status.
    #[must_use]
    pub fn error(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(StatusType::Error, message)
    }

    /// Creates a fatal status.
    #[must_use]
    pub fn fatal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(StatusType::Fatal, message)
    }

    pub(crate) const fn already_started() -> Self {
        Self {
            kind: StatusType::Warning,
            message: Cow::Borrowed("already started"),
        }
    }

    pub(crate) const fn not_started() -> Self {
        Self {
            kind: StatusType::Warning,
            message: Cow::Borrowed("not started"),
        }
    }

    pub(crate) const fn was_destroyed() -> Self {
        Self {
            kind: StatusType::Error,
            message: Cow::Borrowed("was destroyed"),
        }
    }

    /// Severity of this status.
    #[must_use]
    pub const fn kind(&self) -> StatusType {
        self.kind
    }

    /// Human readable message; empty for plain success.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true for `StatusType::Ok`.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.kind, StatusType::Ok)
    }

    /// Returns true for `Ok` and `Warning`: nothing failed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.kind, StatusType::Ok | StatusType::Warning)
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// Errors surfaced by database, record, projection and monitor operations.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Record not found: {name}")]
    RecordNotFound {
        name: String,
    },

    #[error("Record already exists: {name}")]
    DuplicateRecord {
        name: String,
    },

    #[error("Invalid request: {reason}")]
    InvalidRequest {
        reason: String,
    },

    #[error("Field at offset {offset} is not part of record {record}")]
    FieldNotInRecord {
        record: String,
        offset: usize,
    },

    #[error("Field not found: '{path}'")]
    FieldNotFound {
        path: String,
    },

    #[error("Type mismatch for '{path}': expected {expected}, got {actual}")]
    TypeMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("{what} was destroyed")]
    Destroyed {
        what: String,
    },

    #[error("{what} is not implemented")]
    NotImplemented {
        what: String,
    },

    #[error("Processing record {record} failed: {message}")]
    Process {
        record: String,
        message: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl DatabaseError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid request error.
    #[must_use]
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Returns true if the named object did not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::RecordNotFound { .. } | Self::FieldNotFound { .. })
    }

    /// Returns true if the operation hit an already destroyed object.
    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        matches!(self, Self::Destroyed { .. })
    }

    /// Severity this error maps to when reported as a [`Status`].
    #[must_use]
    pub const fn status_type(&self) -> StatusType {
        match self {
            Self::Internal { .. } => StatusType::Fatal,
            Self::DuplicateRecord { .. } => StatusType::Warning,
            _ => StatusType::Error,
        }
    }
}

impl From<&DatabaseError> for Status {
    fn from(err: &DatabaseError) -> Self {
        Self::new(err.status_type(), err.to_string())
    }
}

impl From<DatabaseError> for Status {
    fn from(err: DatabaseError) -> Self {
        Self::from(&err)
    }
}

/// Result type alias for pvdb operations.
pub type DbResult<T> = Result<T, DatabaseError>;
