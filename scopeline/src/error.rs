use crate::task::TaskState;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Result type returned by task bodies and by every suspension point.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every way a task, a scope or a runtime call can end without a value.
///
/// `Cancelled` is the cooperative cancellation signal. It is not a failure:
/// handlers that catch everything should test [`Error::is_cancelled`] and
/// re-raise it, otherwise the task swallows its own cancellation.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("task was cancelled")]
    Cancelled,

    #[error("task failed: {0}")]
    Failed(Arc<anyhow::Error>),

    #[error("task panicked: {0}")]
    Panic(Arc<str>),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid task state transition from {from} to {to}")]
    InvalidStateTransition { from: TaskState, to: TaskState },

    #[error("virtual time never went idle: {steps} steps, clock at {now_ms}ms")]
    DeadlockOrDivergence { steps: usize, now_ms: u64 },
}

impl Error {
    /// Wraps an application error as a task failure.
    pub fn failed<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Error::from(err.into())
    }

    /// Builds a task failure from a plain message.
    pub fn msg<M>(msg: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Error::Failed(Arc::new(anyhow::Error::msg(msg)))
    }

    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Error::IllegalState(msg.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send + 'static>) -> Self {
        let msg: Arc<str> = if let Some(s) = payload.downcast_ref::<&'static str>() {
            Arc::from(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Arc::from(s.as_str())
        } else {
            Arc::from("Box<dyn Any>")
        };

        Error::Panic(msg)
    }

    /// True for the cooperative cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True for errors that fail a task and cascade under `Policy::FailFast`.
    pub fn is_failure(&self) -> bool {
        matches!(self, Error::Failed(_) | Error::Panic(_) | Error::Timeout(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Error::Panic(_))
    }
}

// A cancellation that was wrapped with `anyhow` context on its way up is still
// a cancellation.
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        let cancelled = err
            .chain()
            .any(|cause| matches!(cause.downcast_ref::<Error>(), Some(Error::Cancelled)));

        if cancelled {
            Error::Cancelled
        } else {
            match err.downcast::<Error>() {
                Ok(inner) => inner,
                Err(err) => Error::Failed(Arc::new(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: Send, Sync, Clone, std::error::Error);

    #[rstest]
    #[case::cancelled(Error::Cancelled, false, true)]
    #[case::failed(Error::msg("boom"), true, false)]
    #[case::panic(Error::Panic(Arc::from("oops")), true, false)]
    #[case::timeout(Error::Timeout(Duration::from_millis(5)), true, false)]
    #[case::illegal(Error::illegal_state("dead scope"), false, false)]
    fn test_error_classification(
        #[case] err: Error,
        #[case] is_failure: bool,
        #[case] is_cancelled: bool,
    ) {
        assert_eq!(err.is_failure(), is_failure);
        assert_eq!(err.is_cancelled(), is_cancelled);
    }

    #[test]
    fn test_cancellation_survives_anyhow_context() {
        let wrapped: anyhow::Result<()> = Err(Error::Cancelled).context("while fetching");
        let err = Error::from(wrapped.unwrap_err());
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_anyhow_roundtrip_keeps_variant() {
        let err = Error::from(anyhow::Error::new(Error::Timeout(Duration::from_secs(1))));
        assert!(err.is_timeout());

        let err = Error::from(anyhow!("plain failure"));
        assert!(matches!(&err, Error::Failed(cause) if cause.to_string() == "plain failure"));
    }

    #[test]
    fn test_panic_payloads() {
        let err = Error::from_panic(Box::new("static str"));
        assert!(matches!(&err, Error::Panic(msg) if &**msg == "static str"));

        let err = Error::from_panic(Box::new(String::from("owned")));
        assert!(matches!(&err, Error::Panic(msg) if &**msg == "owned"));

        let err = Error::from_panic(Box::new(42_u8));
        assert!(err.is_panic());
    }
}
