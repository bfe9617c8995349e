// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry delays.
//!
//! A [`Backoff`] sleeps for `init`, `2·init`, `4·init`, … capped at `max`. The
//! equal-jitter strategy keeps the same growth curve but sleeps for half the
//! nominal delay plus a uniformly random share of the other half, which spreads
//! reconnects of many agents restarting at once.
//!
//! Every wait races the cancellation token and returns `false` as soon as it
//! fires.

use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Exponential,
    EqualJitter,
}

/// Backoff parameters shared by every worker of a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSettings {
    pub init: Duration,
    pub max: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(1),
            max: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

#[derive(Debug)]
pub struct Backoff {
    cancel: CancellationToken,
    init: Duration,
    max: Duration,
    duration: Duration,
    strategy: BackoffStrategy,
}

impl Backoff {
    pub fn new(cancel: CancellationToken, settings: BackoffSettings) -> Self {
        Self {
            cancel,
            init: settings.init,
            max: settings.max,
            duration: settings.init,
            strategy: settings.strategy,
        }
    }

    pub fn exponential(cancel: CancellationToken, init: Duration, max: Duration) -> Self {
        Self::new(
            cancel,
            BackoffSettings {
                init,
                max,
                strategy: BackoffStrategy::Exponential,
            },
        )
    }

    pub fn equal_jitter(cancel: CancellationToken, init: Duration, max: Duration) -> Self {
        Self::new(
            cancel,
            BackoffSettings {
                init,
                max,
                strategy: BackoffStrategy::EqualJitter,
            },
        )
    }

    /// Sleeps for the current delay. Returns `false` without waiting out the
    /// delay if cancellation fires first.
    pub async fn wait(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let delay = self.next_delay();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    /// Resets on success (`None`), waits on error.
    pub async fn wait_on_error<E>(&mut self, err: Option<&E>) -> bool {
        match err {
            None => {
                self.reset();
                true
            }
            Some(_) => self.wait().await,
        }
    }

    pub fn reset(&mut self) {
        self.duration = self.init;
    }

    /// Nominal delay the next [`Backoff::wait`] starts from.
    pub fn current(&self) -> Duration {
        self.duration
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // Growth is applied before sleeping: the first wait uses `init`.
    fn next_delay(&mut self) -> Duration {
        let nominal = self.duration;
        self.duration = nominal.saturating_mul(2).min(self.max);
        match self.strategy {
            BackoffStrategy::Exponential => nominal,
            BackoffStrategy::EqualJitter => equal_jitter(nominal),
        }
    }
}

fn equal_jitter(nominal: Duration) -> Duration {
    let half = nominal / 2;
    let spread = u64::try_from(half.as_nanos()).unwrap_or(u64::MAX);
    half + Duration::from_nanos(fastrand::u64(0..=spread))
}
