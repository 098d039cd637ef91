use thiserror::Error;

use crate::types::{IndexId, ReplicaId, SpaceId};

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Wire error codes carried in error replies (`0x8000 | code` response type).
pub mod codes {
    pub const ER_UNKNOWN_REQUEST_TYPE: u32 = 1;
    pub const ER_INVALID_MSGPACK: u32 = 2;
    pub const ER_TUPLE_FOUND: u32 = 3;
    pub const ER_TUPLE_NOT_FOUND: u32 = 4;
    pub const ER_NO_SUCH_SPACE: u32 = 5;
    pub const ER_NO_SUCH_INDEX: u32 = 6;
    pub const ER_UNSUPPORTED_ITERATOR: u32 = 7;
    pub const ER_WRONG_SCHEMA_VERSION: u32 = 8;
    pub const ER_FIELD_TYPE: u32 = 9;
    pub const ER_UPDATE_OP: u32 = 10;
    pub const ER_ACCESS_DENIED: u32 = 11;
    pub const ER_NO_SUCH_FUNCTION: u32 = 12;
    pub const ER_CHECKPOINT_IN_PROGRESS: u32 = 13;
    pub const ER_BACKPRESSURE: u32 = 14;
    pub const ER_WAL_IO: u32 = 15;
    pub const ER_READ_ONLY: u32 = 16;
    pub const ER_FUNC_FAILED: u32 = 17;
    pub const ER_INTERNAL: u32 = 99;
}

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — bad request, unknown space, duplicate key
/// - `Retryable`   — schema raced with DDL; client SHOULD retry
/// - `Transient`   — backpressure, WAL backlog; client MAY retry after back-off
/// - `InternalBug` — should never happen; logged at error level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Wire protocol decode/encode errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid msgpack: {0}")]
    InvalidMsgpack(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    #[error("header is missing the request type key")]
    MissingRequestType,

    #[error("unknown request type: {0}")]
    UnknownRequestType(u32),

    #[error("body field 0x{key:02x} has the wrong msgpack type")]
    BadField { key: u8 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordered index errors.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("duplicate key exists in unique index '{index}' in space '{space}'")]
    Duplicate { space: String, index: String },

    #[error("tuple not found")]
    NotFound,

    #[error("exact-match lookup is only defined for unique indexes")]
    NonUniqueFind,

    #[error("field {field_no} does not match index part type {expected}")]
    FieldType { field_no: u32, expected: &'static str },

    #[error("tuple has {have} fields, index requires at least {need}")]
    MissingField { have: usize, need: usize },
}

/// WAL segment read/write errors.
#[derive(Error, Debug)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad block magic at offset {offset}")]
    BadMagic { offset: u64 },

    #[error("block checksum mismatch at offset {offset}: stored {stored:08x}, computed {computed:08x}")]
    Checksum {
        offset: u64,
        stored: u32,
        computed: u32,
    },

    #[error("truncated block header at offset {offset}")]
    TruncatedHeader { offset: u64 },

    #[error("truncated block body at offset {offset}: need {need}, have {have}")]
    TruncatedBody {
        offset: u64,
        need: usize,
        have: usize,
    },

    #[error("{len} trailing bytes after the end-of-segment marker")]
    TrailingGarbage { len: usize },

    #[error("bad segment metadata: {0}")]
    BadMeta(String),

    #[error("segment {file} regresses the directory vclock order")]
    VclockOrder { file: String },

    #[error("row codec error: {0}")]
    Codec(String),

    #[error("compression error: {0}")]
    Compression(String),
}

/// Engine / dispatch errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("space {0} does not exist")]
    NoSuchSpace(SpaceId),

    #[error("index {index} does not exist in space '{space}'")]
    NoSuchIndex { space: String, index: IndexId },

    #[error("schema version mismatch: request has {requested}, current is {current}")]
    SchemaVersionMismatch { requested: u64, current: u64 },

    #[error("vclock regression for replica {replica}: {from} -> {to}")]
    VclockRegression { replica: ReplicaId, from: i64, to: i64 },

    #[error("a checkpoint is already in progress")]
    CheckpointInProgress,

    #[error("access denied for user '{user}'")]
    AccessDenied { user: String },

    #[error("invalid update operation: {0}")]
    UpdateOp(String),

    #[error("unknown iterator type {0}")]
    UnsupportedIterator(u32),

    #[error("write attempted on a read-only instance")]
    ReadOnly,

    #[error("invalid space definition: {0}")]
    SpaceDef(String),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Wal(#[from] WalError),
}

/// Function/module registry errors.
#[derive(Error, Debug)]
pub enum FuncError {
    #[error("function '{0}' is not defined")]
    NoSuchFunction(String),

    #[error("module '{0}' is not loaded")]
    NoSuchModule(String),

    #[error("failed to load module '{path}': {reason}")]
    Load { path: String, reason: String },

    #[error("symbol '{0}' not found in module")]
    NoSuchSymbol(String),

    #[error("module is closed")]
    ModuleClosed,

    #[error("function '{name}' failed: {reason}")]
    Call { name: String, reason: String },
}

/// Top-level error type that all subsystem errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("function error: {0}")]
    Func(#[from] FuncError),

    #[error("backpressure: request pool exhausted (retry after {retry_after_ms}ms)")]
    Backpressure { retry_after_ms: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl KestrelError {
    /// Classify this error for retry/severity decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KestrelError::Protocol(_) => ErrorKind::UserError,
            KestrelError::Index(_) => ErrorKind::UserError,
            KestrelError::Func(_) => ErrorKind::UserError,
            KestrelError::Engine(EngineError::SchemaVersionMismatch { .. }) => ErrorKind::Retryable,
            KestrelError::Engine(EngineError::CheckpointInProgress) => ErrorKind::Transient,
            KestrelError::Engine(EngineError::Wal(_)) => ErrorKind::Transient,
            KestrelError::Engine(EngineError::VclockRegression { .. }) => ErrorKind::InternalBug,
            KestrelError::Engine(_) => ErrorKind::UserError,
            KestrelError::Wal(_) => ErrorKind::Transient,
            KestrelError::Backpressure { .. } => ErrorKind::Transient,
            KestrelError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    /// Map to the wire error code carried in an error reply.
    pub fn error_code(&self) -> u32 {
        use codes::*;
        match self {
            KestrelError::Protocol(ProtocolError::UnknownRequestType(_)) => ER_UNKNOWN_REQUEST_TYPE,
            KestrelError::Protocol(_) => ER_INVALID_MSGPACK,
            KestrelError::Index(IndexError::Duplicate { .. }) => ER_TUPLE_FOUND,
            KestrelError::Index(IndexError::NotFound) => ER_TUPLE_NOT_FOUND,
            KestrelError::Index(IndexError::NonUniqueFind) => ER_UNSUPPORTED_ITERATOR,
            KestrelError::Index(_) => ER_FIELD_TYPE,
            KestrelError::Engine(EngineError::NoSuchSpace(_)) => ER_NO_SUCH_SPACE,
            KestrelError::Engine(EngineError::NoSuchIndex { .. }) => ER_NO_SUCH_INDEX,
            KestrelError::Engine(EngineError::SchemaVersionMismatch { .. }) => {
                ER_WRONG_SCHEMA_VERSION
            }
            KestrelError::Engine(EngineError::AccessDenied { .. }) => ER_ACCESS_DENIED,
            KestrelError::Engine(EngineError::UpdateOp(_)) => ER_UPDATE_OP,
            KestrelError::Engine(EngineError::UnsupportedIterator(_)) => ER_UNSUPPORTED_ITERATOR,
            KestrelError::Engine(EngineError::CheckpointInProgress) => ER_CHECKPOINT_IN_PROGRESS,
            KestrelError::Engine(EngineError::ReadOnly) => ER_READ_ONLY,
            KestrelError::Engine(EngineError::SpaceDef(_)) => ER_INTERNAL,
            KestrelError::Engine(EngineError::VclockRegression { .. }) => ER_INTERNAL,
            KestrelError::Engine(EngineError::Wal(_)) => ER_WAL_IO,
            KestrelError::Engine(EngineError::Index(e)) => match e {
                IndexError::Duplicate { .. } => ER_TUPLE_FOUND,
                IndexError::NotFound => ER_TUPLE_NOT_FOUND,
                IndexError::NonUniqueFind => ER_UNSUPPORTED_ITERATOR,
                _ => ER_FIELD_TYPE,
            },
            KestrelError::Func(FuncError::Call { .. }) => ER_FUNC_FAILED,
            KestrelError::Func(_) => ER_NO_SUCH_FUNCTION,
            KestrelError::Wal(_) => ER_WAL_IO,
            KestrelError::Backpressure { .. } => ER_BACKPRESSURE,
            KestrelError::Internal(_) => ER_INTERNAL,
        }
    }

    /// Returns true if the client may retry after a short back-off.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Log internal bugs at error level; no-op for expected errors.
    pub fn log_if_internal(&self) {
        if self.kind() == ErrorKind::InternalBug {
            tracing::error!(error = %self, "internal error");
        }
    }
}
