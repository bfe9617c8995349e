// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery counters.
//!
//! Each mode reports into an injected [`DispatchMetrics`] sink rather than a
//! process-wide counter, so independent modes (and tests) never share state.
//! A dropped batch counts as one dropped message, regardless of its size.

use std::sync::atomic::{AtomicU64, Ordering};

pub trait DispatchMetrics: Send + Sync {
    /// One publish request was given up on after exhausting its attempts.
    fn inc_dropped(&self);

    /// `events` events were acknowledged by a sink.
    fn add_published(&self, _events: usize) {}
}

#[derive(Debug, Default)]
pub struct AtomicMetrics {
    dropped: AtomicU64,
    published: AtomicU64,
}

impl AtomicMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl DispatchMetrics for AtomicMetrics {
    fn inc_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn add_published(&self, events: usize) {
        self.published
            .fetch_add(u64::try_from(events).unwrap_or(u64::MAX), Ordering::Relaxed);
    }
}
