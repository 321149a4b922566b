use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// CinderDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The database handle has been closed; no further calls are accepted.
    DatabaseClosed,
    /// Another live process holds the database directory lock.
    DatabaseLocked(String),
    /// A table with this name already exists.
    TableAlreadyExists(String),
    /// No table with this name exists on disk or in memory.
    TableNotFound(String),
    /// The table exists on disk but has not been opened.
    TableNotOpen(String),
    /// The table is marked corrupted; reopen with repair to recover.
    TableCorrupted(String),
    /// No shard with this name exists in the sharded table.
    ShardNotFound(String),
    /// A required call parameter is missing.
    MissingParameter(String),
    /// A lock queue rejected a waiter because its bound was exceeded.
    LockQueueOverflow,
    /// Unique hash/range indexes are not supported on sharded tables.
    UniqueConstraintUnsupported,
    /// Invalid data, typically decoding errors, corruption, or unexpected internal values.
    InvalidData(String),
    /// Invalid user input, typically malformed queries or misuse of the API.
    InvalidInput(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::DatabaseClosed => write!(f, "database is closed"),
            Error::DatabaseLocked(msg) => write!(f, "database is locked: {msg}"),
            Error::TableAlreadyExists(name) => write!(f, "table already exists: {name}"),
            Error::TableNotFound(name) => write!(f, "table not found: {name}"),
            Error::TableNotOpen(name) => write!(f, "table not open: {name}"),
            Error::TableCorrupted(msg) => write!(f, "table corrupted: {msg}"),
            Error::ShardNotFound(name) => write!(f, "shard not found: {name}"),
            Error::MissingParameter(name) => write!(f, "missing parameter: {name}"),
            Error::LockQueueOverflow => write!(f, "lock queue overflow"),
            Error::UniqueConstraintUnsupported => {
                write!(f, "unique indexes are not supported on sharded tables")
            }
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A CinderDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}
