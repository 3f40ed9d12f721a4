use std::{error::Error, fmt, sync::Arc};
use thiserror::Error;

/// Every failure a stream operation can report.
///
/// Errors are `Clone` because a stream stores the first error it sees and hands
/// the same value back to every later read, write, `closed` or `ready` call.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("Stream operation was canceled")]
    Canceled,
    #[error("Stream was aborted{}", .0.as_ref().map(|r| format!(": {}", r)).unwrap_or_default())]
    Aborted(Option<String>),
    #[error("Stream is closing")]
    Closing,
    #[error("Stream is closed")]
    Closed,
    #[error("Stream task was dropped")]
    TaskDropped,
    /// A reader or writer is already attached.
    #[error("Stream is locked to a reader or writer")]
    Locked,
    /// The handle was released; only calls issued before the release still settle.
    #[error("Reader or writer lock has been released")]
    Released,
    /// Misuse of the stream protocol, e.g. enqueue after close.
    #[error("TypeError: {0}")]
    Type(String),
    /// A size, byte count or high-water mark outside its valid range.
    #[error("RangeError: {0}")]
    Range(String),
    #[error("{0}")]
    Other(#[source] Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }

    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        StreamError::Type(message.into())
    }

    pub(crate) fn range_error(message: impl Into<String>) -> Self {
        StreamError::Range(message.into())
    }

    /// Turns the error into the reason string carried by abort/cancel calls.
    pub(crate) fn into_reason(self) -> Option<String> {
        match self {
            StreamError::Aborted(reason) => reason,
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug)]
struct SimpleError(String);

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for SimpleError {}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(Arc::new(SimpleError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(Arc::new(SimpleError(s)))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

/// Macro for users to add direct `From` implementations for their error types.
/// This allows using `?` directly without `.map_err(StreamError::other)`.
///
/// # Example
/// ```rust,ignore
/// use stream_engine::{StreamError, impl_stream_error_from};
///
/// impl_stream_error_from!(
///     serde_json::Error,
///     your_custom::Error,
/// );
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::streams::error::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::streams::error::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}
