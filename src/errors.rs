//! Error taxonomy for the recovery log.
//!
//! Every failure is sorted into one of three [`ErrorClass`]es. Store
//! and lease code only report; the coordinator is the one place that
//! decides what a class means for availability.

use std::panic::Location;

use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;

use crate::coordinator::LogState;
use crate::model::FailureScope;
use crate::model::OwnerId;

pub type Result<T> = std::result::Result<T, RecoveryLogError>;

/// How the caller should react to an error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Try again, with backoff, within the retry budget.
    Retryable,
    /// Refuse to bring the failure scope into service.
    Fatal,
    /// A normal consequence of failover or shutdown.
    Expected,
}

#[derive(Debug, Error)]
pub enum RecoveryLogError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store schema error: {0}")]
    Schema(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("unsupported record format version {found}; this build reads up to {supported}")]
    UnsupportedVersion { found: u8, supported: u8 },

    #[error("ownership of {scope} denied; held by {holder} until {expiry}")]
    OwnershipDenied {
        scope: FailureScope,
        holder: OwnerId,
        expiry: DateTime<Utc>,
    },

    #[error("lease on {scope} lost: {reason}")]
    LeaseLost { scope: FailureScope, reason: String },

    #[error("gave up on {op} after {attempts} attempts: {last}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        #[source]
        last: Box<RecoveryLogError>,
    },

    #[error("open of {0} was cancelled")]
    Cancelled(FailureScope),

    #[error("recovery log is {found:?}, operation needs {needed:?}")]
    InvalidState { found: LogState, needed: LogState },

    #[error("recovery log for {0} has failed and refuses further work")]
    LogFailed(FailureScope),

    #[error("cannot retire {scope}: {live} live recovery units remain")]
    RetireRefused { scope: FailureScope, live: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{context}\nCaused by => {source}")]
    Context {
        context: String,
        #[source]
        source: Box<RecoveryLogError>,
    },
}

impl RecoveryLogError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::StoreUnavailable(..) => ErrorClass::Retryable,
            Self::LeaseLost { .. } | Self::Cancelled(..) => ErrorClass::Expected,
            Self::Context { source, .. } => source.class(),
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Strip any [`RecoveryLogError::Context`] wrappers.
    pub fn root(&self) -> &RecoveryLogError {
        match self {
            Self::Context { source, .. } => source.root(),
            err => err,
        }
    }
}

impl From<rusqlite::Error> for RecoveryLogError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(ffi_err, msg) => match ffi_err.code {
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::OperationInterrupted
                | ErrorCode::FileLockingProtocolFailed => Self::StoreUnavailable(err.to_string()),
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    Self::Schema(err.to_string())
                }
                _ => {
                    // Missing tables and columns come back as a plain
                    // `SQLITE_ERROR` with only the message to go on.
                    let missing = msg
                        .as_deref()
                        .map_or(false, |m| m.contains("no such table") || m.contains("no such column"));
                    if missing {
                        Self::Schema(err.to_string())
                    } else {
                        Self::Store(err.to_string())
                    }
                }
            },
            rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::InvalidColumnIndex(..)
            | rusqlite::Error::InvalidColumnName(..)
            | rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => Self::Schema(err.to_string()),
            _ => Self::Store(err.to_string()),
        }
    }
}

impl From<rusqlite_migration::Error> for RecoveryLogError {
    fn from(err: rusqlite_migration::Error) -> Self {
        match err {
            rusqlite_migration::Error::RusqliteError { err, .. } => {
                let err = RecoveryLogError::from(err);
                if err.is_retryable() {
                    err
                } else {
                    Self::Schema(err.to_string())
                }
            }
            err => Self::Schema(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RecoveryLogError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

/// Attach caller-located context to anything that converts into our
/// [`Result`].
///
/// The [`ErrorClass`] of the wrapped error is preserved, so a
/// retryable error stays retryable after being annotated.
pub trait LogException<T> {
    /// Only this needs to be implemented.
    fn into_result(self) -> Result<T>;

    /// Wrap the existing error with a message and the caller's
    /// location.
    ///
    /// Example:
    ///     store.read_lease(&scope).reraise("Error reading lease row")?;
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_result().map_err(|err| RecoveryLogError::Context {
            context: prepend_caller(caller, msg),
            source: Box::new(err),
        })
    }
}

impl<T> LogException<T> for Result<T> {
    fn into_result(self) -> Result<T> {
        self
    }
}

impl<T> LogException<T> for std::result::Result<T, rusqlite::Error> {
    fn into_result(self) -> Result<T> {
        self.map_err(RecoveryLogError::from)
    }
}

impl<T> LogException<T> for std::result::Result<T, rusqlite_migration::Error> {
    fn into_result(self) -> Result<T> {
        self.map_err(RecoveryLogError::from)
    }
}

impl<T> LogException<T> for std::io::Result<T> {
    fn into_result(self) -> Result<T> {
        self.map_err(|err| RecoveryLogError::InvalidConfig(err.to_string()))
    }
}

impl<T> LogException<T> for std::result::Result<T, serde_json::Error> {
    fn into_result(self) -> Result<T> {
        self.map_err(RecoveryLogError::from)
    }
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

#[test]
fn busy_is_retryable() {
    let err = rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
        Some("database is locked".to_owned()),
    );
    let err = RecoveryLogError::from(err);
    assert!(matches!(err, RecoveryLogError::StoreUnavailable(..)));
    assert!(err.is_retryable());
}

#[test]
fn missing_table_is_schema() {
    let err = rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
        Some("no such table: log_records".to_owned()),
    );
    let err = RecoveryLogError::from(err);
    assert!(matches!(err, RecoveryLogError::Schema(..)));
    assert_eq!(err.class(), ErrorClass::Fatal);
}

#[test]
fn reraise_keeps_class_and_location() {
    let res: Result<()> = Err(RecoveryLogError::StoreUnavailable("down".to_owned()));
    let err = res.reraise("Error committing batch").unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err.root(), RecoveryLogError::StoreUnavailable(..)));
    let msg = err.to_string();
    assert!(msg.contains("errors.rs"));
    assert!(msg.contains("Error committing batch"));
}

#[test]
fn lease_lost_is_expected() {
    let err = RecoveryLogError::LeaseLost {
        scope: FailureScope::new("server1"),
        reason: "version moved".to_owned(),
    };
    assert_eq!(err.class(), ErrorClass::Expected);
}
