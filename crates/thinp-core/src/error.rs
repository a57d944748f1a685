//! Typed error hierarchy, one enum per boundary.

use thiserror::Error;

use crate::ids::ThinId;

/// Errors raised while parsing or validating constructor arguments and
/// runtime messages (§6.3). Surfaced at construct time; the target refuses
/// to load.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("invalid value for {name}: {value}")]
    InvalidArgument { name: &'static str, value: String },

    #[error("sectors_per_block must be a power of two in [{min}, {max}], got {got}")]
    BadBlockSize { min: u32, max: u32, got: u32 },

    #[error("metadata device exceeds the maximum of {max} sectors")]
    MetadataDeviceTooLarge { max: u64 },

    #[error("unknown feature: {0}")]
    UnknownFeature(String),

    #[error("device id {id} exceeds the maximum of {max}")]
    DeviceIdOutOfRange { id: u32, max: u32 },

    #[error("unrecognized message: {0}")]
    UnknownMessage(String),
}

/// Errors from the metadata store (§6.1).
#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    #[error("data device is out of space")]
    OutOfSpace,

    #[error("metadata device is out of space")]
    MetadataOutOfSpace,

    #[error("thin device {0} not found")]
    ThinNotFound(ThinId),

    #[error("thin device {0} already exists")]
    ThinExists(ThinId),

    #[error("lookup would block")]
    WouldBlock,

    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("stale transaction id: expected {expected}, got {got}")]
    StaleTransactionId { expected: u64, got: u64 },

    #[error("metadata store error: {0}")]
    Other(String),
}

/// Errors from the copy engine (§6.2).
#[derive(Debug, Clone, Copy, Error)]
pub enum CopyError {
    #[error("read error on source region")]
    ReadFailed,

    #[error("write error on destination region")]
    WriteFailed,
}

/// Errors visible on the per-bio data path and from pool-wide operations.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Copy(#[from] CopyError),

    #[error("I/O error")]
    Io,

    #[error("device id {0} is already bound to this pool")]
    AlreadyBound(ThinId),

    #[error("device id {0} is not bound to this pool")]
    NotBound(ThinId),

    #[error("cell allocation failed; pool reserve exhausted")]
    ReserveExhausted,
}

/// Terminal, per-bio completion error. Peers detained in the same cell are
/// failed with this same error (§7, "User-visible behavior").
#[derive(Debug, Clone, Error)]
pub enum BioError {
    #[error("I/O error")]
    Io,

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl From<MetadataError> for BioError {
    fn from(e: MetadataError) -> Self {
        BioError::Pool(PoolError::from(e))
    }
}

impl From<CopyError> for BioError {
    fn from(e: CopyError) -> Self {
        BioError::Pool(PoolError::from(e))
    }
}
