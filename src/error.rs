use thiserror::Error;

/// Errors surfaced by the codec entry points.
///
/// Stale or duplicate packets are not errors: the codec is best-effort
/// in-window, and those are normal network events it absorbs silently.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CcatError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("allocation failed")]
    OutOfMemory,
}
