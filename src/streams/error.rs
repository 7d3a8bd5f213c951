use std::{error::Error, fmt, sync::Arc};
use thiserror::Error;

pub type StreamResult<T> = Result<T, StreamError>;

/// Coarse classification of a [`StreamError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The caller broke the stream contract (write after end, push after EOF, ...).
    ProtocolMisuse,
    /// A fill, commit, finalize or destroy primitive reported a failure.
    TransportFailure,
    /// The operation was attempted on a destroyed stream.
    Destroyed,
    /// The stream was torn down by an abort signal.
    Cancellation,
}

#[derive(Error, Debug, Clone)]
pub enum StreamError {
    /// A chunk was pushed after the end-of-data marker.
    #[error("stream.push() after EOF")]
    PushAfterEof,

    /// A chunk was put back after `end` was already emitted.
    #[error("stream.unshift() after end event")]
    UnshiftAfterEnd,

    /// `write` was called after `end`.
    #[error("write after end")]
    WriteAfterEnd,

    /// The operation cannot run because the stream already finished.
    #[error("cannot call {0} after a stream was finished")]
    AlreadyFinished(&'static str),

    /// The operation cannot run because the stream was destroyed.
    #[error("cannot call {0} after a stream was destroyed")]
    Destroyed(&'static str),

    /// Pull and flowing consumption were mixed on one readable.
    #[error("cannot call {0} once the readable selected the other consumption mode")]
    ModeConflict(&'static str),

    #[error("{name} must be <= {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        max: usize,
        value: usize,
    },

    #[error("the operation was aborted{}", abort_suffix(.0))]
    Aborted(Option<String>),

    /// The peer closed before ending or finishing.
    #[error("premature close")]
    PrematureClose,

    /// The stream driver was dropped before answering.
    #[error("stream task was dropped")]
    TaskDropped,

    /// Failure reported by a transport primitive.
    #[error("{0}")]
    Other(#[source] Arc<dyn Error + Send + Sync>),
}

fn abort_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|reason| format!(": {reason}"))
        .unwrap_or_default()
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

    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::PushAfterEof
            | StreamError::UnshiftAfterEnd
            | StreamError::WriteAfterEnd
            | StreamError::AlreadyFinished(_)
            | StreamError::ModeConflict(_)
            | StreamError::OutOfRange { .. } => ErrorKind::ProtocolMisuse,
            StreamError::Destroyed(_) => ErrorKind::Destroyed,
            StreamError::Aborted(_) => ErrorKind::Cancellation,
            StreamError::PrematureClose | StreamError::TaskDropped | StreamError::Other(_) => {
                ErrorKind::TransportFailure
            }
        }
    }
}

#[derive(Debug)]
struct SimpleError(String);

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
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
/// This allows using `?` inside transport primitives without `.map_err(StreamError::other)`.
///
/// # Example
/// ```rust
/// use pipestream::impl_stream_error_from;
///
/// #[derive(Debug)]
/// struct DiskFull;
///
/// impl std::fmt::Display for DiskFull {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "disk full")
///     }
/// }
///
/// impl std::error::Error for DiskFull {}
///
/// impl_stream_error_from!(DiskFull);
///
/// fn commit() -> Result<(), pipestream::StreamError> {
///     Err(DiskFull)?
/// }
///
/// assert_eq!(commit().unwrap_err().to_string(), "disk full");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_conversions_work() {
        let from_str: StreamError = "boom".into();
        assert_eq!(from_str.to_string(), "boom");

        let from_string: StreamError = String::from("bang").into();
        assert_eq!(from_string.to_string(), "bang");

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let from_io: StreamError = io.into();
        assert!(from_io.source().is_some());
        assert_eq!(from_io.kind(), ErrorKind::TransportFailure);

        let boxed: Box<dyn Error + Send + Sync> = "boxed".into();
        let from_boxed: StreamError = boxed.into();
        assert_eq!(from_boxed.to_string(), "boxed");
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(StreamError::PushAfterEof.kind(), ErrorKind::ProtocolMisuse);
        assert_eq!(StreamError::WriteAfterEnd.kind(), ErrorKind::ProtocolMisuse);
        assert_eq!(
            StreamError::AlreadyFinished("end").kind(),
            ErrorKind::ProtocolMisuse
        );
        assert_eq!(StreamError::Destroyed("write").kind(), ErrorKind::Destroyed);
        assert_eq!(StreamError::Aborted(None).kind(), ErrorKind::Cancellation);
        assert_eq!(StreamError::other(fmt::Error).kind(), ErrorKind::TransportFailure);
    }

    #[test]
    fn messages_name_the_operation() {
        assert_eq!(
            StreamError::Destroyed("write").to_string(),
            "cannot call write after a stream was destroyed"
        );
        assert_eq!(
            StreamError::Aborted(Some("user".into())).to_string(),
            "the operation was aborted: user"
        );
        assert_eq!(
            StreamError::OutOfRange {
                name: "size",
                max: 4,
                value: 5
            }
            .to_string(),
            "size must be <= 4, got 5"
        );
    }
}
