use std::fmt;
use std::io;

use thiserror::Error;

/// An error returned from any of the [`FileCache`](super::FileCache) operations.
///
/// The variants correspond to error *kinds* rather than to concrete failure sources.
/// Filesystem failures that don't map onto one of the specific kinds end up as
/// [`Io`](Self::Io), keeping the rendered cause for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The arguments or the configuration were not acceptable, e.g. a zero TTL.
    #[error("invalid: {0}")]
    Invalid(String),
    /// An entry with this key is already stored.
    ///
    /// Storing is not an upsert, the existing entry has to be evicted first.
    #[error("already exists")]
    AlreadyExists,
    /// The key is not stored in the cache, or the source does not know it.
    #[error("not found")]
    NotFound,
    /// The cache has been closed and does not accept any more operations.
    #[error("conflict: cache is closed")]
    Conflict,
    /// The operation was cancelled before it could complete.
    #[error("operation cancelled")]
    Cancelled,
    /// An internal invariant was violated.
    #[error("unexpected: {0}")]
    Unexpected(String),
    /// Reading, copying, moving or removing data failed.
    #[error("io error: {0}")]
    Io(String),
    /// A collection of errors, produced when tearing down the cache.
    #[error("{}", DisplayMultiple(.0))]
    Multiple(Vec<CacheError>),
}

impl From<io::Error> for CacheError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            _ => Self::from_std_error(err),
        }
    }
}

impl CacheError {
    /// Converts any error into an [`Io`](Self::Io) error, logging it along the way.
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::Io(e.to_string())
    }

    /// Wraps an I/O error that happened while operating on `path`.
    pub(crate) fn io_at(path: &std::path::Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            _ => Self::Io(format!("{}: {err}", path.display())),
        }
    }

    /// Joins a list of errors into one.
    ///
    /// Returns `None` for an empty list and the error itself for a single one.
    pub fn join(mut errors: Vec<CacheError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }

    /// Short machine readable name of the error kind, used as a metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "invalid",
            Self::AlreadyExists => "already_exists",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Cancelled => "cancelled",
            Self::Unexpected(_) => "unexpected",
            Self::Io(_) => "io",
            Self::Multiple(_) => "multiple",
        }
    }
}

struct DisplayMultiple<'a>(&'a [CacheError]);

impl fmt::Display for DisplayMultiple<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred", self.0.len())?;
        for err in self.0 {
            write!(f, "\n  - {err}")?;
        }
        Ok(())
    }
}

/// The result of a cache operation.
pub type CacheResult<T = ()> = Result<T, CacheError>;
