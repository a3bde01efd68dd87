// This file is part of stratumdb.
//
// Copyright (C) 2025 Matheus Cardoso <varvedb@matheus.sbs>
//
// This Source Code Form is subject to the terms of the Mozilla Public License
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at http://mozilla.org/MPL/2.0/.

//! Retry-with-deadline for idempotent backend calls (§9 "retry-with-deadline").
//!
//! An explicit loop with an outer cancellation signal and an inner per-attempt timeout, rather
//! than nested scoped tasks, so caller cancellation and attempt-deadline expiry stay
//! distinguishable (§5 "cancellation").

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::constants::{RETRY_LONG_TIMEOUT, RETRY_MAX_ATTEMPTS, RETRY_SHORT_TIMEOUT};
use crate::error::{Error, Result};

/// A cooperative cancellation signal shared between a caller and the operations it starts.
/// Cheap to clone; all clones observe the same cancellation.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called, immediately if it already has.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Retries `attempt` up to `RETRY_MAX_ATTEMPTS` times, treating `Error::is_retryable` failures
/// and per-attempt timeouts as retryable. The first attempt uses `RETRY_SHORT_TIMEOUT` when
/// `expect_short` is set (listing, metadata, small reads); every other attempt, and every
/// attempt when `expect_short` is false, uses `RETRY_LONG_TIMEOUT`. `cancel` firing at any point
/// aborts immediately with `Error::Cancelled`, distinct from an internal timeout.
pub async fn with_retry<T, F, Fut>(
    cancel: &CancelToken,
    expect_short: bool,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err: Option<Error> = None;

    for attempt_no in 0..RETRY_MAX_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let deadline = if expect_short && attempt_no == 0 {
            RETRY_SHORT_TIMEOUT
        } else {
            RETRY_LONG_TIMEOUT
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = tokio::time::timeout(deadline, attempt()) => res,
        };

        match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_retryable() => last_err = Some(e),
            Ok(Err(e)) => return Err(e),
            Err(_elapsed) => last_err = Some(Error::Timeout(deadline)),
        }
    }

    Err(Error::BackendUnavailable {
        attempts: RETRY_MAX_ATTEMPTS,
        source: Box::new(last_err.unwrap_or(Error::Timeout(RETRY_LONG_TIMEOUT))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn succeeds_without_retry() {
        let cancel = CancelToken::new();
        let result = with_retry(&cancel, true, || async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let cancel = CancelToken::new();
        let calls = AtomicU32::new(0);
        let result = with_retry(&cancel, true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "transient",
                    )))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        let cancel = CancelToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&cancel, true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::ReadOnly) }
        })
        .await;
        assert!(matches!(result, Err(Error::ReadOnly)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_wins_over_retry() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result: Result<()> = with_retry(&cancel, true, || async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn exhausting_attempts_surfaces_backend_unavailable() {
        let cancel = CancelToken::new();
        let result: Result<()> = with_retry(&cancel, true, || async {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "down",
            )))
        })
        .await;
        assert!(matches!(result, Err(Error::BackendUnavailable { attempts, .. }) if attempts == RETRY_MAX_ATTEMPTS));
    }
}
