// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded retries of a fallible async operation.

use crate::attempts::Attempts;
use crate::backoff::Backoff;
use futures::future::BoxFuture;
use std::fmt::Display;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    #[error("cancelled")]
    Cancelled,
}

/// Drives an operation until it succeeds, the attempt budget runs out or the
/// backoff is cancelled. The backoff is reset after a success.
pub struct Retryer<'a> {
    backoff: &'a mut Backoff,
    max_attempts: Attempts,
}

impl<'a> Retryer<'a> {
    pub fn new(backoff: &'a mut Backoff, max_attempts: Attempts) -> Self {
        Self {
            backoff,
            max_attempts,
        }
    }

    pub fn unbounded(backoff: &'a mut Backoff) -> Self {
        Self::new(backoff, Attempts::Unlimited)
    }

    /// Runs `op` against `target`, retrying on error.
    ///
    /// `target` is handed to each invocation so the operation may borrow it
    /// mutably, e.g. `retryer.run(&mut client, |c| c.connect(timeout))`.
    pub async fn run<S, T, E, F>(&mut self, target: &mut S, mut op: F) -> Result<T, RetryError<E>>
    where
        S: ?Sized,
        E: Display,
        F: for<'s> FnMut(&'s mut S) -> BoxFuture<'s, Result<T, E>>,
    {
        let mut attempts = 0u32;
        loop {
            if self.backoff.is_cancelled() {
                return Err(RetryError::Cancelled);
            }
            attempts = attempts.saturating_add(1);
            match op(target).await {
                Ok(value) => {
                    self.backoff.reset();
                    return Ok(value);
                }
                Err(err) => {
                    if !self.max_attempts.allows(attempts) {
                        return Err(RetryError::Exhausted {
                            attempts,
                            last_error: err,
                        });
                    }
                    debug!(attempts, "attempt failed, retrying: {err}");
                    if !self.backoff.wait().await {
                        return Err(RetryError::Cancelled);
                    }
                }
            }
        }
    }
}
