//! Error types shared across the pool, balancers and retry executor.

use std::{error::Error as StdError, fmt, sync::Arc};
use thiserror::Error;

/// The error channel of every [`Endpoint`](crate::endpoint::Endpoint).
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// A clonable error, used where one failure has to be observed by many parties
/// (discovery events fanned out to listeners, retry history).
pub type SharedError = Arc<dyn StdError + Send + Sync>;

/// Errors produced by the pool machinery itself.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// The current snapshot is empty.
    #[error("no endpoints available")]
    NoEndpoints,
    /// The execution scope's deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    /// The execution scope was cancelled by its owner.
    #[error("context canceled")]
    Canceled,
    /// The discovery source reported an error and the invalidation grace period ran out.
    #[error("service discovery error: {0}")]
    Discovery(SharedError),
}

impl PoolError {
    /// Wraps an arbitrary error as a discovery failure.
    pub fn discovery<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        PoolError::Discovery(Arc::new(err))
    }
}

/// Returned by a retrying endpoint once its budget is spent without a success.
///
/// `final_error` is the error surfaced to the caller (possibly replaced by the
/// continuation callback); `attempts` holds every raw per-attempt error in order.
#[derive(Debug, Clone)]
pub struct RetryError {
    pub final_error: SharedError,
    pub attempts: Vec<SharedError>,
}

impl fmt::Display for RetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.final_error)?;
        if self.attempts.len() > 1 {
            let previous: Vec<String> =
                self.attempts[..self.attempts.len() - 1].iter().map(|e| e.to_string()).collect();
            write!(f, " (previously: {})", previous.join("; "))?;
        }
        Ok(())
    }
}

impl StdError for RetryError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.final_error.as_ref())
    }
}

/// Plain-message error, handy for factories and discovery sources that only have text.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct Message(pub String);

impl Message {
    pub fn new(msg: impl Into<String>) -> Self {
        Message(msg.into())
    }
}
