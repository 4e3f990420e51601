use thiserror::Error;

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Failures of the cache backend.
///
/// A missing key or field is not an error: lookups return `None`, empty
/// collections or zero instead.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Connection to the backend failed or timed out.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    /// A command was issued against a key holding a different container kind.
    /// This is a key-naming bug, never a condition to recover from.
    #[error("WRONGTYPE operation against key '{key}' holding the wrong kind of value")]
    ShapeMismatch { key: String },

    /// Any other error reply from the backend.
    #[error("cache backend error: {0}")]
    Protocol(String),
}

impl CacheError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CacheError::Unavailable(_))
    }

    /// Errors that must reach the caller instead of triggering a fallback.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::ShapeMismatch { .. })
    }
}
