//! Error Types for seqdb
//!
//! All crates in the workspace share this taxonomy. The split matters for
//! callers:
//!
//! - `Corruption` is fatal for the fraction it came from: the fraction is
//!   marked unusable, other fractions keep serving.
//! - `Io` is retryable at the routing layer (across replicas); the data layer
//!   does not retry on its own.
//! - `Canceled` / `Timeout` never leave partial side effects in storage.
//! - `TooManyInflight` is a synchronous, retryable rejection of bulk ingest.
//! - A fetch miss is NOT an error: it materializes as an empty payload at the
//!   missing position in the result batch.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted data: {0}")]
    Corruption(String),

    #[error("operation canceled")]
    Canceled,

    #[error("operation timed out")]
    Timeout,

    #[error("too many inflight bulks")]
    TooManyInflight,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("fraction is already sealed")]
    Sealed,

    #[error("fraction was suicided")]
    Suicided,

    #[error("object store error: {0}")]
    ObjectStore(String),
}

impl Error {
    /// Corruption constructor used by block decoders.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// True for errors a caller may retry against another replica.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::TooManyInflight | Error::ObjectStore(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_display() {
        let err = Error::corrupted("bad magic");
        assert_eq!(err.to_string(), "corrupted data: bad magic");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::TooManyInflight.is_retryable());
        assert!(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")).is_retryable());
        assert!(!Error::Canceled.is_retryable());
        assert!(!Error::corrupted("x").is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        fn read() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
            Ok(())
        }
        assert!(matches!(read(), Err(Error::Io(_))));
    }
}
