use soundscape_core::DocumentError;
use thiserror::Error;

/// Errors from zone operations.
///
/// Operations on ids that are no longer present are not errors; they
/// return `false`/`None`.
#[derive(Debug, Error)]
pub enum ZoneError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("invalid zone geometry: {0}")]
    InvalidGeometry(String),
}
