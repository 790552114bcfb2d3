// Failover completion and retry policy
// A submission resolves exactly once; transient failures are re-run by the policy

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::warn;

use super::request::Response;
use crate::error::{ConsistencyError, Result};

/// Completion handle of one commit or read submission
#[derive(Debug)]
pub struct FailoverClosure {
    tx: oneshot::Sender<Result<Response>>,
    retries_left: u32,
}

impl FailoverClosure {
    pub fn new(retries: u32) -> (Self, ResponseFuture) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx,
                retries_left: retries,
            },
            ResponseFuture { rx },
        )
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    /// Resolve the caller's future; consuming `self` makes this happen at most once
    pub fn resolve(self, result: Result<Response>) {
        // The caller may have stopped waiting
        let _ = self.tx.send(result);
    }
}

/// Future side of a `FailoverClosure`
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Response>>,
}

impl Future for ResponseFuture {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(result) => result,
            Err(_) => Err(ConsistencyError::Shutdown),
        })
    }
}

/// Bounded re-invocation of a fallible async operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Retry every error instead of only transient ones
    pub retry_all: bool,
}

impl RetryPolicy {
    /// Policy for commits and reads: one attempt plus `retries` failovers
    pub fn failover(retries: u32) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
            backoff: Duration::ZERO,
            retry_all: false,
        }
    }

    /// Policy for membership changes
    pub fn membership(attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: attempts.max(1),
            backoff,
            retry_all: true,
        }
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out.
    /// `op` receives the number of retries still available after this attempt.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let retries_left = max_attempts - attempt;
            match op(retries_left).await {
                Ok(value) => return Ok(value),
                Err(e) if retries_left > 0 && (self.retry_all || e.is_retryable()) => {
                    warn!(
                        attempt,
                        max_attempts,
                        "{} failed, retrying: {}",
                        what,
                        e
                    );
                    if !self.backoff.is_zero() {
                        tokio::time::sleep(self.backoff).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
