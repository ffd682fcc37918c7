#![forbid(unsafe_code)]
//! Error types for the spate I/O core.
//!
//! Defines `CoreError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for the synchronous `access` return contract.

use thiserror::Error;

/// Unified error type for all spate operations.
///
/// Transient resource errors (`OutOfFrames`, `OutOfSlots`) never escape the
/// core: the request path recovers by draining completions. Permanent errors
/// surface to the client through the completion callback or the synchronous
/// return value.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Engine or cache construction failed. Fatal; raised only at startup.
    #[error("initialization failed: {0}")]
    Init(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cache search found no unpinned, non-io-pending victim.
    ///
    /// Recoverable: drain completions and retry.
    #[error("no evictable page frame available")]
    OutOfFrames,

    /// The async engine's submission budget is exhausted.
    ///
    /// Recoverable: wait for completions.
    #[error("async I/O slots exhausted")]
    OutOfSlots,

    /// Misaligned or malformed request, reported synchronously.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Backpressure unresolved beyond the configured bound. Advisory.
    #[error("request path stuck for {waited_ms} ms waiting for completions")]
    Stuck { waited_ms: u64 },
}

impl CoreError {
    /// Convert this error into a POSIX errno for the `access` contract,
    /// which reports failures as negative errno values.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Init(_) => libc::EIO,
            Self::OutOfFrames | Self::OutOfSlots => libc::EAGAIN,
            Self::BadRequest(_) => libc::EINVAL,
            Self::Stuck { .. } => libc::ETIMEDOUT,
        }
    }

    /// Whether the request path can recover from this error by draining
    /// completions and retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::OutOfFrames | Self::OutOfSlots)
    }
}

/// Result alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(CoreError::OutOfFrames.to_errno(), libc::EAGAIN);
        assert_eq!(CoreError::OutOfSlots.to_errno(), libc::EAGAIN);
        assert_eq!(
            CoreError::BadRequest("misaligned".to_owned()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(CoreError::Stuck { waited_ms: 5000 }.to_errno(), libc::ETIMEDOUT);
    }

    #[test]
    fn io_error_preserves_raw_errno() {
        let err = CoreError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.to_errno(), libc::ENOSPC);
    }

    #[test]
    fn transient_classification() {
        assert!(CoreError::OutOfFrames.is_transient());
        assert!(CoreError::OutOfSlots.is_transient());
        assert!(!CoreError::BadRequest(String::new()).is_transient());
        assert!(!CoreError::Init("queue setup".to_owned()).is_transient());
    }
}
