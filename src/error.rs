//! Error kinds and Result alias for DBSQL
//!
//! Every fallible operation in the engine reports one of the error kinds
//! below. The kinds are part of the engine's contract: `Busy` and `Row`
//! are cooperative suspensions, `Schema` asks the caller to re-prepare,
//! and `Misuse` flags API calls made while a connection is busy.

use std::fmt;

// ============================================================================
// Error Codes
// ============================================================================

/// Engine result kind (DBSQL_*)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result
    Ok = 0,
    /// Generic SQL error or missing database
    Error = 1,
    /// Internal logic error
    Internal = 2,
    /// Access permission denied
    Perm = 3,
    /// A callback requested an abort
    Abort = 4,
    /// A table in the database is locked
    Busy = 5,
    /// A table in the same connection is locked
    Locked = 6,
    /// Memory allocation failed
    NoMem = 7,
    /// Attempt to write a readonly database
    ReadOnly = 8,
    /// Interrupted by `interrupt()`
    Interrupted = 9,
    /// Disk I/O error
    IoErr = 10,
    /// The database image is malformed
    Corrupt = 11,
    /// Table or record not found
    NotFound = 12,
    /// Insertion failed because the table is full
    Full = 13,
    /// Unable to open the database file
    CantOpen = 14,
    /// Database lock protocol error
    Protocol = 15,
    /// The database is empty
    Empty = 16,
    /// The schema changed; re-prepare the statement
    Schema = 17,
    /// Too much data for one row
    TooBig = 18,
    /// Constraint violation
    Constraint = 19,
    /// Data type mismatch
    Mismatch = 20,
    /// Library used incorrectly
    Misuse = 21,
    /// `step()` has another row ready
    Row = 100,
    /// `step()` has finished executing
    Done = 101,
}

impl ErrorCode {
    /// Canonical message for this code when no context is available.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "not an error",
            ErrorCode::Error => "SQL logic error or missing database",
            ErrorCode::Internal => "internal error",
            ErrorCode::Perm => "access permission denied",
            ErrorCode::Abort => "callback requested query abort",
            ErrorCode::Busy => "database is locked",
            ErrorCode::Locked => "database table is locked",
            ErrorCode::NoMem => "out of memory",
            ErrorCode::ReadOnly => "attempt to write a readonly database",
            ErrorCode::Interrupted => "interrupted",
            ErrorCode::IoErr => "disk I/O error",
            ErrorCode::Corrupt => "database disk image is malformed",
            ErrorCode::NotFound => "table or record not found",
            ErrorCode::Full => "database is full",
            ErrorCode::CantOpen => "unable to open database file",
            ErrorCode::Protocol => "database locking protocol failure",
            ErrorCode::Empty => "table contains no data",
            ErrorCode::Schema => "database schema has changed",
            ErrorCode::TooBig => "too much data for one table row",
            ErrorCode::Constraint => "constraint failed",
            ErrorCode::Mismatch => "datatype mismatch",
            ErrorCode::Misuse => "library routine called out of sequence",
            ErrorCode::Row => "another row available",
            ErrorCode::Done => "no more rows available",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Error Type
// ============================================================================

/// An engine error: a kind plus an optional human-readable message.
///
/// Messages are built from fixed templates and identifier slices at the
/// point of failure; `code.as_str()` fills in when none was provided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub code: ErrorCode,
    message: Option<String>,
}

impl Error {
    /// Create an error carrying only a kind.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Create an error with a specific message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// The message for this error.
    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or(self.code.as_str())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for Error {}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_messages() {
        let e = Error::new(ErrorCode::Busy);
        assert_eq!(e.message(), "database is locked");
        assert_eq!(e.code, ErrorCode::Busy);
    }

    #[test]
    fn test_custom_message() {
        let e = Error::with_message(ErrorCode::Error, "no such table: t1");
        assert_eq!(e.message(), "no such table: t1");
        assert_eq!(format!("{}", e), "no such table: t1");
    }

    #[test]
    fn test_code_values_are_stable() {
        assert_eq!(ErrorCode::Ok as i32, 0);
        assert_eq!(ErrorCode::Schema as i32, 17);
        assert_eq!(ErrorCode::Misuse as i32, 21);
        assert_eq!(ErrorCode::Row as i32, 100);
        assert_eq!(ErrorCode::Done as i32, 101);
    }
}
