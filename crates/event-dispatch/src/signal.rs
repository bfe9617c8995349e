// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery acknowledgement handed back to producers.
//!
//! Every publish request carries a [`Signaler`]. The core resolves it exactly
//! once, as [`Outcome::Completed`] or [`Outcome::Failed`]; inputs use it to decide
//! when a read position can be checkpointed.
//!
//! Resolution consumes the signaler, so a second resolution does not compile. A
//! signaler dropped without being resolved reports
//! [`DeliveryError::Abandoned`], which keeps producers from waiting forever on
//! an ack that can no longer arrive.

use crate::error::DeliveryError;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(DeliveryError),
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

type Callback = Box<dyn FnOnce(Outcome) + Send>;

enum Resolver {
    Channel(oneshot::Sender<Outcome>),
    Callback(Callback),
    Split(Arc<SplitState>),
    Noop,
}

impl Resolver {
    fn resolve(self, outcome: Outcome) {
        match self {
            // The receiver may be gone if the producer stopped caring.
            Resolver::Channel(tx) => {
                let _ = tx.send(outcome);
            }
            Resolver::Callback(callback) => callback(outcome),
            Resolver::Split(state) => state.resolve_part(outcome),
            Resolver::Noop => {}
        }
    }
}

/// One-shot completion notifier owned by the producer side.
pub struct Signaler {
    resolver: Option<Resolver>,
}

impl Signaler {
    /// Creates a signaler together with the receiver the producer awaits.
    pub fn channel() -> (Self, SignalReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                resolver: Some(Resolver::Channel(tx)),
            },
            SignalReceiver { rx },
        )
    }

    /// Creates a signaler that invokes `callback` with the outcome. The callback
    /// runs on whichever task resolves the signaler.
    pub fn from_fn<F>(callback: F) -> Self
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        Self {
            resolver: Some(Resolver::Callback(Box::new(callback))),
        }
    }

    /// A signaler for fire-and-forget publishing.
    pub fn noop() -> Self {
        Self {
            resolver: Some(Resolver::Noop),
        }
    }

    pub fn completed(mut self) {
        self.resolve(Outcome::Completed);
    }

    pub fn failed(mut self, reason: DeliveryError) {
        self.resolve(Outcome::Failed(reason));
    }

    /// Splits this signaler into `parts` children.
    ///
    /// The parent completes once every child completed, or fails with the first
    /// child failure. With zero parts the parent completes immediately.
    pub fn split(mut self, parts: usize) -> Vec<Signaler> {
        if parts == 0 {
            self.resolve(Outcome::Completed);
            return Vec::new();
        }
        let state = Arc::new(SplitState {
            remaining: AtomicUsize::new(parts),
            parent: Mutex::new(self.resolver.take().map(|resolver| Signaler {
                resolver: Some(resolver),
            })),
        });
        (0..parts)
            .map(|_| Signaler {
                resolver: Some(Resolver::Split(Arc::clone(&state))),
            })
            .collect()
    }

    fn resolve(&mut self, outcome: Outcome) {
        if let Some(resolver) = self.resolver.take() {
            resolver.resolve(outcome);
        }
    }
}

impl Drop for Signaler {
    fn drop(&mut self) {
        self.resolve(Outcome::Failed(DeliveryError::Abandoned));
    }
}

impl fmt::Debug for Signaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.resolver {
            Some(Resolver::Channel(_)) => "channel",
            Some(Resolver::Callback(_)) => "callback",
            Some(Resolver::Split(_)) => "split",
            Some(Resolver::Noop) => "noop",
            None => "resolved",
        };
        f.debug_struct("Signaler").field("kind", &kind).finish()
    }
}

struct SplitState {
    remaining: AtomicUsize,
    parent: Mutex<Option<Signaler>>,
}

impl SplitState {
    fn take_parent(&self) -> Option<Signaler> {
        match self.parent.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn resolve_part(&self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => {
                if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Some(parent) = self.take_parent() {
                        parent.completed();
                    }
                }
            }
            Outcome::Failed(reason) => {
                if let Some(parent) = self.take_parent() {
                    parent.failed(reason);
                }
            }
        }
    }
}

/// Producer-side handle awaiting the outcome of a [`Signaler::channel`].
#[derive(Debug)]
pub struct SignalReceiver {
    rx: oneshot::Receiver<Outcome>,
}

impl SignalReceiver {
    pub async fn outcome(self) -> Outcome {
        self.rx
            .await
            .unwrap_or(Outcome::Failed(DeliveryError::Abandoned))
    }

    /// Returns the outcome if it has already been resolved.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        self.rx.try_recv().ok()
    }
}
