//! Byte transformer hooks.

/// Failure inside a transformer hook. Aborts materialization of the
/// affected resource only; the loader remains valid.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransformError(pub String);

impl TransformError {
    /// Create an error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A hook applied to raw resource bytes before materialization.
///
/// Hooks run in registration order; each may replace the bytes
/// (`Ok(Some(..))`) or pass them through unchanged (`Ok(None)`).
pub trait CodeTransformer: Send + Sync {
    /// Transform the bytes for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] to abort materialization of this
    /// resource.
    fn transform(&self, name: &str, bytes: &[u8]) -> Result<Option<Vec<u8>>, TransformError>;
}
