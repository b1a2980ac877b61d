//! Tagged timeout races.
//!
//! A timed-out call is not cancelled underneath: the wrapped future is
//! dropped and any side effect it already started (a running subprocess)
//! finishes on its own with the result discarded.

use std::future::Future;
use std::time::Duration;

/// Outcome of one bounded attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    Ok(T),
    TimedOut,
    Failed(String),
}

impl<T> Attempt<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            Attempt::Ok(value) => Some(value),
            Attempt::TimedOut | Attempt::Failed(_) => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Attempt::TimedOut)
    }
}

/// Races `future` against a timer.
pub async fn with_timeout<T, F>(limit: Duration, future: F) -> Attempt<T>
where
    F: Future<Output = Result<T, String>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(Ok(value)) => Attempt::Ok(value),
        Ok(Err(reason)) => Attempt::Failed(reason),
        Err(_) => Attempt::TimedOut,
    }
}

/// Races an infallible future against a timer.
pub async fn race<T, F>(limit: Duration, future: F) -> Attempt<T>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(value) => Attempt::Ok(value),
        Err(_) => Attempt::TimedOut,
    }
}
