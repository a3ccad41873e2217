//! Loader error types.

use std::path::PathBuf;

use crate::loader::Lifecycle;

/// Errors from code loading operations.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// The code unit or resource is absent from every repository, archive
    /// and parent. Non-fatal; eligible for negative caching.
    #[error("code unit or resource not found: {0}")]
    NotFound(String),

    /// Bytes were present but failed to materialize into a valid code
    /// unit. Fatal for that name only; never retried.
    #[error("malformed code unit {name}: {reason}")]
    Malformed {
        /// The resource name that failed.
        name: String,
        /// Why materialization failed.
        reason: String,
    },

    /// A registered transformer hook failed; materialization of this
    /// resource is aborted, the loader stays valid.
    #[error("transformer failed for {name}: {reason}")]
    TransformFailed {
        /// The resource name being transformed.
        name: String,
        /// The hook's failure reason.
        reason: String,
    },

    /// An archive file could not be opened. Aborts the whole open attempt
    /// for the archive set (all-or-nothing).
    #[error("could not open archive {path}: {reason}")]
    ArchiveOpen {
        /// The archive that failed to open.
        path: PathBuf,
        /// The underlying failure.
        reason: String,
    },

    /// An operation was invoked outside its permitted lifecycle state.
    /// Always a programming error, never retried.
    #[error("operation '{operation}' not permitted while loader is {state:?}")]
    IllegalState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The loader's state at the time.
        state: Lifecycle,
    },

    /// A sealed namespace was loaded from a code base other than the one
    /// that sealed it.
    #[error("sealing violation loading {name}: namespace '{namespace}' is sealed by {sealed_by}")]
    SealViolation {
        /// The resource name that was denied.
        name: String,
        /// The sealed namespace.
        namespace: String,
        /// The code base the namespace is sealed to.
        sealed_by: PathBuf,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for loader operations.
pub type LoaderResult<T> = Result<T, LoaderError>;
