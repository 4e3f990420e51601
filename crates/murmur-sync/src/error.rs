use murmur_cache::CacheError;
use murmur_types::{ChannelId, UserId};
use thiserror::Error;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Failure of the relational source of truth. These are the only errors
    /// that should reach end users as request failures.
    #[error(transparent)]
    Source(#[from] anyhow::Error),

    /// A cached payload could not be decoded or failed validation.
    #[error("corrupt cached {kind}: {reason}")]
    Corrupt { kind: &'static str, reason: String },

    #[error("unknown author {0}")]
    UnknownAuthor(UserId),

    #[error("no free message id could be allocated in channel {0}")]
    Allocation(ChannelId),
}

impl SyncError {
    /// Shape mismatches are key-naming bugs and must never be absorbed by a fallback.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Cache(e) if e.is_fatal())
    }

    /// Cache-side failures that a source-of-truth fallback can absorb.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::Cache(e) => !e.is_fatal(),
            SyncError::Corrupt { .. } => true,
            _ => false,
        }
    }
}
