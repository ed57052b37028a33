//! Unified error type for the Otterbrix kernel
//!
//! Every public error carries a stable [`ErrorCode`] so callers can react
//! without matching on variants, plus a human-readable description that
//! surfaces through cursors.
//!
//! Categories:
//! - **User errors** (unknown name, type mismatch, constraint violation)
//!   are returned through the cursor and never crash the engine.
//! - **Write conflicts** abort the offending transaction only.
//! - **System errors** (WAL I/O failure) poison the affected writer
//!   partition until restart.
//! - **Corruption** (bad CRC, truncated file) is recovered where possible.

use std::io;
use thiserror::Error;

/// Result type alias for Otterbrix operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    /// No error
    None,
    /// Database with this name already exists
    DatabaseAlreadyExists,
    /// Database does not exist
    DatabaseNotExists,
    /// Collection with this name already exists
    CollectionAlreadyExists,
    /// Collection does not exist
    CollectionNotExists,
    /// Collection was dropped while the operation was in flight
    CollectionDropped,
    /// Upstream parser rejected the statement
    SqlParseError,
    /// Logical plan could not be lowered to a physical plan
    CreatePhysicalPlanError,
    /// Index creation failed
    IndexCreateFail,
    /// UDF name not registered
    UnrecognizedFunction,
    /// UDF argument types do not match the registered signature
    IncorrectFunctionArgument,
    /// Concurrent transaction already deleted the row
    WriteConflict,
    /// Anything else
    OtherError,
}

/// Error type for the Otterbrix kernel.
#[derive(Debug, Error)]
pub enum Error {
    /// Database with this name already exists
    #[error("database already exists: {name}")]
    DatabaseAlreadyExists {
        /// Database name
        name: String,
    },

    /// Database does not exist
    #[error("database not exists: {name}")]
    DatabaseNotExists {
        /// Database name
        name: String,
    },

    /// Collection with this name already exists
    #[error("collection already exists: {name}")]
    CollectionAlreadyExists {
        /// Qualified collection name
        name: String,
    },

    /// Collection does not exist
    #[error("collection not exists: {name}")]
    CollectionNotExists {
        /// Qualified collection name
        name: String,
    },

    /// Collection was dropped while the operation was in flight
    #[error("collection dropped: {name}")]
    CollectionDropped {
        /// Qualified collection name
        name: String,
    },

    /// Statement rejected by the upstream parser
    #[error("sql parse error: {what}")]
    SqlParse {
        /// Parser diagnostic
        what: String,
    },

    /// Logical plan could not be lowered to a physical plan
    #[error("cannot create physical plan: {what}")]
    PhysicalPlan {
        /// Lowering diagnostic
        what: String,
    },

    /// Index creation failed
    #[error("index create fail: {what}")]
    IndexCreate {
        /// Failure description
        what: String,
    },

    /// UDF name not registered
    #[error("unrecognized function: {name}")]
    UnrecognizedFunction {
        /// Function name as requested
        name: String,
    },

    /// UDF argument types do not match any registered signature
    #[error("incorrect function argument: {what}")]
    IncorrectFunctionArgument {
        /// Mismatch description
        what: String,
    },

    /// Concurrent transaction already deleted or updated the row
    #[error("write conflict: {what}")]
    WriteConflict {
        /// Conflict description
        what: String,
    },

    /// Row group is at capacity; caller allocates a new one
    #[error("row group full")]
    RowGroupFull,

    /// Value cannot be stored in the declared column type
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        /// Declared column type
        expected: String,
        /// Offending value type
        got: String,
    },

    /// NULL offered to a NOT NULL column with no default
    #[error("not null constraint violated for column {column}")]
    NotNullViolation {
        /// Column name
        column: String,
    },

    /// I/O failure (WAL or checkpoint files)
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Data integrity failure (bad CRC, truncated file, torn rename)
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// WAL writer partition refused writes and was taken out of service
    #[error("wal partition {partition} unhealthy: {what}")]
    WalUnhealthy {
        /// Writer partition index
        partition: usize,
        /// Underlying failure
        what: String,
    },

    /// Invalid request or state transition
    #[error("invalid operation: {0}")]
    Invalid(String),

    /// Unexpected internal state; indicates a bug
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The stable code surfaced through cursors.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::DatabaseAlreadyExists { .. } => ErrorCode::DatabaseAlreadyExists,
            Error::DatabaseNotExists { .. } => ErrorCode::DatabaseNotExists,
            Error::CollectionAlreadyExists { .. } => ErrorCode::CollectionAlreadyExists,
            Error::CollectionNotExists { .. } => ErrorCode::CollectionNotExists,
            Error::CollectionDropped { .. } => ErrorCode::CollectionDropped,
            Error::SqlParse { .. } => ErrorCode::SqlParseError,
            Error::PhysicalPlan { .. } => ErrorCode::CreatePhysicalPlanError,
            Error::IndexCreate { .. } => ErrorCode::IndexCreateFail,
            Error::UnrecognizedFunction { .. } => ErrorCode::UnrecognizedFunction,
            Error::IncorrectFunctionArgument { .. } => ErrorCode::IncorrectFunctionArgument,
            Error::WriteConflict { .. } => ErrorCode::WriteConflict,
            _ => ErrorCode::OtherError,
        }
    }

    /// Human-readable description, mirrored into cursor payloads.
    pub fn what(&self) -> String {
        self.to_string()
    }

    /// User errors are surfaced through the cursor and never abort the
    /// engine.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::DatabaseAlreadyExists { .. }
                | Error::DatabaseNotExists { .. }
                | Error::CollectionAlreadyExists { .. }
                | Error::CollectionNotExists { .. }
                | Error::CollectionDropped { .. }
                | Error::SqlParse { .. }
                | Error::PhysicalPlan { .. }
                | Error::IndexCreate { .. }
                | Error::UnrecognizedFunction { .. }
                | Error::IncorrectFunctionArgument { .. }
                | Error::TypeMismatch { .. }
                | Error::NotNullViolation { .. }
        )
    }

    /// Write conflicts abort the offending transaction and may be retried.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::WriteConflict { .. })
    }

    /// Corruption is recovered where possible (torn tail discarded,
    /// missing checkpoint replayed from WAL).
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    /// Fatal errors poison the affected service until restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::WalUnhealthy { .. } | Error::Internal(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
