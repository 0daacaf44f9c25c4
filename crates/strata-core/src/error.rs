//! Cache error types

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum CacheError {
    /// Key absent or expired. Expected during normal operation; every
    /// caller can single this condition out with [`CacheError::is_not_found`].
    #[error("not found")]
    NotFound,

    #[error("config error: {0}")]
    Config(String),

    #[error("value for key {key:?} is {found}, not an integer")]
    Type { key: String, found: &'static str },

    #[error("counter {key:?} out of range")]
    Range { key: String },

    /// A write against a namespace whose backing entry has expired or was
    /// overwritten. The caller must recreate the namespace.
    #[error("map {name:?} is expired")]
    NamespaceExpired { name: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Concatenation of two tier errors from a composed operation. Callers
    /// of composed stores must not pattern-match beyond the NotFound
    /// sentinel.
    #[error("{0}")]
    Composite(String),
}

impl CacheError {
    /// True for the single sentinel condition "key absent or expired".
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound)
    }

    /// Merge the outcomes of a two-tier operation: success requires
    /// neither side to error, a single error is returned as-is, and two
    /// errors are concatenated textually.
    pub fn merge(tier1: Option<CacheError>, tier2: Option<CacheError>) -> Result<()> {
        match (tier1, tier2) {
            (None, None) => Ok(()),
            (Some(e), None) | (None, Some(e)) => Err(e),
            (Some(e1), Some(e2)) => Err(CacheError::Composite(format!("{e1}, {e2}"))),
        }
    }
}
