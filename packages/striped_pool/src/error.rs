use thiserror::Error;

/// Errors that can occur when acquiring a session from a [`StripedPool`][crate::StripedPool].
///
/// `E` is the error type of the pooled [`Session`][crate::Session].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error<E> {
    /// Every session the pool is allowed to construct already exists and none of them is idle.
    ///
    /// The pool remains usable - a later call may succeed once another thread
    /// releases a session.
    #[error("maximum pool size of {max_size} sessions reached and no idle session is available")]
    Saturated {
        /// The configured maximum number of sessions in the pool.
        max_size: usize,
    },

    /// The session could not be opened. The error from the session is passed through unchanged.
    #[error("failed to open pooled session")]
    Open(#[source] E),
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T, E> = std::result::Result<T, Error<E>>;
