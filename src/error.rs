//! Error taxonomy for the coordinator.
//!
//! Internal plumbing uses `anyhow::Result` and converts to `CoordinatorError`
//! only at the boundary where an operation's outcome is reported: an RPC
//! response, a streaming update, or a durable progress row. Every operation
//! in `rpc::Coordinator` returns `CoordinatorResult<T>`.

use thiserror::Error;

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Transient(#[from] TransientError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

/// Missing output path, unknown compression, invalid worker count (before
/// clamping), invalid state transition request, missing PK for merge.
/// Surfaced immediately, with no side effects.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("output path must not be empty")]
    EmptyOutputPath,

    #[error("unknown compression algorithm: {0}")]
    UnknownCompression(String),

    #[error("invalid init method: {0}")]
    InvalidMethod(String),

    #[error("table {schema}.{table} has no primary key")]
    MissingPrimaryKey { schema: String, table: String },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{0}")]
    Other(String),
}

/// Source unreachable, extension missing, slot already exists, schema
/// mismatch in strict mode, operation already active. Surfaced before any
/// write; the caller retries after fixing the precondition.
#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("operation already in progress for node {0}")]
    AlreadyActive(String),

    #[error("source node unreachable: {0}")]
    SourceUnreachable(String),

    #[error("steep_repl extension missing or below required version")]
    ExtensionMissing,

    #[error("schema mismatch in strict mode: {0}")]
    SchemaMismatch(String),

    #[error("replication slot already exists: {0}")]
    SlotExists(String),

    #[error("insufficient wal senders available")]
    InsufficientWalSenders,

    #[error("{0}")]
    Other(String),
}

/// Network flap mid-copy, peer restart. The affected operation fails; no
/// automatic retry at this layer. Local cleanup runs before returning.
#[derive(Debug, Error)]
pub enum TransientError {
    #[error("connection to {node} lost: {source}")]
    ConnectionLost {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Checksum mismatch during apply, FK cycle, circular schema. Fatal for the
/// operation; no data is applied.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("circular foreign key dependency among tables: {0:?}")]
    CircularDependency(Vec<String>),

    #[error(
        "merge on {table_schema}.{table_name} committed on node A but not node B; recorded as an incident in merge_audit_log"
    )]
    PartialMergeCommit {
        table_schema: String,
        table_name: String,
    },

    #[error("{0}")]
    Other(String),
}

/// Unexpected failures from a subsystem. Reported, state transitions to
/// `failed`, cleanup is attempted.
#[derive(Debug, Error)]
pub enum InternalError {
    #[error("internal error: {0}")]
    Unexpected(#[source] anyhow::Error),
}

impl From<anyhow::Error> for CoordinatorError {
    fn from(err: anyhow::Error) -> Self {
        CoordinatorError::Internal(InternalError::Unexpected(err))
    }
}

impl From<postgres::Error> for CoordinatorError {
    fn from(err: postgres::Error) -> Self {
        CoordinatorError::Internal(InternalError::Unexpected(err.into()))
    }
}

impl From<r2d2::Error> for CoordinatorError {
    fn from(err: r2d2::Error) -> Self {
        CoordinatorError::Internal(InternalError::Unexpected(err.into()))
    }
}
