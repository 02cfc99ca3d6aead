use thiserror::Error;

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while splitting, parsing or decoding a JPEG stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The input ended before a complete structure could be read.
    ///
    /// This is the only recoverable error: feeding more data and retrying may succeed.
    #[error("reached end of data while decoding JPEG stream")]
    BufferExhausted,
    /// The stream violates the JPEG format.
    #[error("{0}")]
    BadData(String),
    /// The stream uses a JPEG coding process this decoder does not implement (progressive,
    /// lossless, arithmetic coding).
    #[error("not implemented: {0}")]
    NotImplemented(String),
    /// The stream is valid, but describes a layout the output side cannot represent.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// The worker threads could not be started.
    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),
}

impl Error {
    pub(crate) fn bad_data(msg: impl Into<String>) -> Self {
        Self::BadData(msg.into())
    }

    /// Returns whether retrying with more input may succeed.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BufferExhausted)
    }
}

/// Returns early with an [`Error::BadData`] built from a format string.
macro_rules! bail {
    ($($args:tt)*) => {
        return Err($crate::error::Error::BadData(format!($($args)*)))
    };
}

pub(crate) use bail;
