// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transport boundary.
//!
//! A client is one connection (or connectable endpoint) to a remote sink. The
//! dispatch core only connects, closes and publishes through these traits; wire
//! encoding is entirely up to the implementation. A client is owned by exactly
//! one worker or mode at a time, hence `&mut self` everywhere.

use crate::error::{ClientError, PublishError};
use crate::event::{Event, Payload};
use async_trait::async_trait;
use std::time::Duration;

/// Events the sink has not accepted yet after a batch publish.
pub type BatchResult = Result<Vec<Event>, PublishError>;

/// Completion callback of an asynchronous batch publish.
pub type BatchCallback = Box<dyn FnOnce(BatchResult) + Send>;

/// Completion callback of an asynchronous single-event publish.
pub type EventCallback = Box<dyn FnOnce(Result<(), ClientError>) + Send>;

#[async_trait]
pub trait ProtocolClient: Send {
    async fn connect(&mut self, timeout: Duration) -> Result<(), ClientError>;

    async fn close(&mut self) -> Result<(), ClientError>;

    /// Publishes a batch and returns the events that were not accepted.
    ///
    /// `Ok` with a non-empty remainder means the sink made progress and the
    /// caller should resubmit the rest. On error, the unsent events travel in
    /// the [`PublishError`]; [`ClientError::TemporaryBulk`] signals that the
    /// connection itself is still healthy.
    async fn publish_events(&mut self, events: Vec<Event>) -> BatchResult;

    async fn publish_event(&mut self, event: &Event) -> Result<(), ClientError>;
}

#[async_trait]
impl<C: ProtocolClient + ?Sized> ProtocolClient for Box<C> {
    async fn connect(&mut self, timeout: Duration) -> Result<(), ClientError> {
        (**self).connect(timeout).await
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        (**self).close().await
    }

    async fn publish_events(&mut self, events: Vec<Event>) -> BatchResult {
        (**self).publish_events(events).await
    }

    async fn publish_event(&mut self, event: &Event) -> Result<(), ClientError> {
        (**self).publish_event(event).await
    }
}

/// A client whose publish calls return once the payload is handed off; the
/// outcome arrives later through the callback.
///
/// The callback must be invoked exactly once, from any thread, including when
/// the client is closed with publishes still in flight.
#[async_trait]
pub trait AsyncProtocolClient: Send {
    async fn connect(&mut self, timeout: Duration) -> Result<(), ClientError>;

    async fn close(&mut self) -> Result<(), ClientError>;

    async fn async_publish_events(&mut self, events: Vec<Event>, callback: BatchCallback);

    async fn async_publish_event(&mut self, event: Event, callback: EventCallback);
}

#[async_trait]
impl<C: AsyncProtocolClient + ?Sized> AsyncProtocolClient for Box<C> {
    async fn connect(&mut self, timeout: Duration) -> Result<(), ClientError> {
        (**self).connect(timeout).await
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        (**self).close().await
    }

    async fn async_publish_events(&mut self, events: Vec<Event>, callback: BatchCallback) {
        (**self).async_publish_events(events, callback).await
    }

    async fn async_publish_event(&mut self, event: Event, callback: EventCallback) {
        (**self).async_publish_event(event, callback).await
    }
}

/// A failed send attempt and how many events the sink accepted before failing.
#[derive(Debug)]
pub(crate) struct SendFailure {
    pub(crate) error: ClientError,
    pub(crate) accepted: usize,
}

impl SendFailure {
    pub(crate) fn made_progress(&self) -> bool {
        self.accepted > 0
    }
}

/// Publishes `payload` until the sink has accepted all of it or fails.
///
/// Batches are resubmitted as long as the client keeps returning a shrinking
/// remainder; on failure `payload` is left holding the unsent events. Returns
/// the number of events accepted.
pub(crate) async fn send_payload<C>(client: &mut C, payload: &mut Payload) -> Result<usize, SendFailure>
where
    C: ProtocolClient + ?Sized,
{
    match payload {
        Payload::Single(event) => client
            .publish_event(event)
            .await
            .map(|()| 1)
            .map_err(|error| SendFailure { error, accepted: 0 }),
        Payload::Batch(events) => {
            let mut accepted = 0;
            while !events.is_empty() {
                let before = events.len();
                match client.publish_events(std::mem::take(events)).await {
                    Ok(rest) if rest.len() < before => {
                        accepted += before - rest.len();
                        *events = rest;
                    }
                    // No progress without an error is treated as a temporary failure.
                    Ok(rest) => {
                        *events = rest;
                        return Err(SendFailure {
                            error: ClientError::TemporaryBulk,
                            accepted,
                        });
                    }
                    Err(PublishError { error, unsent }) => {
                        accepted += before.saturating_sub(unsent.len());
                        *events = unsent;
                        return Err(SendFailure { error, accepted });
                    }
                }
            }
            Ok(accepted)
        }
    }
}
