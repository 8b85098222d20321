use thiserror::Error;

pub type Result<T> = std::result::Result<T, SableError>;

/// Errors surfaced by the store, its buckets, and the radix/visitor layer.
#[derive(Debug, Error)]
pub enum SableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("database not open")]
    DatabaseNotOpen,
    #[error("database opened read-only")]
    DatabaseReadOnly,
    #[error("transaction has already been committed or rolled back")]
    TxClosed,
    #[error("transaction is not writable")]
    TxNotWritable,
    #[error("key required")]
    KeyRequired,
    #[error("key too large")]
    KeyTooLarge,
    #[error("value required")]
    ValueRequired,
    #[error("value too large")]
    ValueTooLarge,
    #[error("bucket name required")]
    BucketNameRequired,
    #[error("bucket already exists")]
    BucketExists,
    #[error("bucket not found")]
    BucketNotFound,
    #[error("incompatible value")]
    IncompatibleValue,
    #[error("write attempt on read-only cursor operation")]
    InvalidWriteAttempt,
    #[error("timeout waiting for file lock")]
    Timeout,
}
