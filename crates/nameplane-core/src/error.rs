//! Error types for the nameplane registry core.

use thiserror::Error;

/// Result type alias for registry operations.
pub type NamingResult<T> = Result<T, NamingError>;

/// Errors surfaced by client-facing registry operations.
///
/// Background workers never surface these; they log and move on to the
/// next unit of work.
#[derive(Debug, Error)]
pub enum NamingError {
    /// Malformed service name, weight out of range, empty add result,
    /// instance not found on update.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation referenced a service that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Propagated from the consistency layer on put/remove.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// Registry-level invariant violation. The offending callback is
    /// aborted and prior state left in place.
    #[error("fatal: {0}")]
    Fatal(String),
}
