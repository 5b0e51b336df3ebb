use thiserror::Error;

/// Errors surfaced by [`crate::RowCache`].
///
/// Mirrors the pack's convention of exposing library failures as a single
/// `std::error::Error`-implementing enum rather than panicking or returning bare codes.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Invalid initialization or resize parameters.
    #[error("invalid kernel cache configuration: {0}")]
    Config(String),

    /// `ensure` could not allocate enough slots even after evicting everything evictable.
    #[error("kernel cache full: requested {requested} rows but only {capacity} slots exist")]
    CacheFull { requested: usize, capacity: usize },

    /// A kernel evaluation failed while filling a row.
    #[error("kernel evaluation failed for row {row}: {source}")]
    Compute {
        row: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Caller passed an out-of-range row index or an invalid shrink request.
    #[error("kernel cache usage error: {0}")]
    Usage(String),
}
