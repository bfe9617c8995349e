// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Load balancer workers.
//!
//! A worker owns one client. It connects (retrying without limit), then takes
//! messages from the shared queue until shutdown. Failed messages go back to
//! the retry queue where any worker may pick them up; a non-temporary failure
//! also makes the worker drop its connection and reconnect after a backoff.

use super::queue::{DispatchQueue, EventsMessage, Rejected};
use crate::backoff::Backoff;
use crate::client::{send_payload, AsyncProtocolClient, BatchCallback, EventCallback, ProtocolClient};
use crate::error::{ClientError, DeliveryError, PublishError};
use crate::event::{Event, Payload};
use crate::metrics::DispatchMetrics;
use crate::mode::ModeSettings;
use crate::retry::Retryer;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// State shared by the load balancer, its workers and in-flight callbacks.
pub(crate) struct Dispatcher {
    pub(crate) queue: DispatchQueue,
    pub(crate) settings: ModeSettings,
    pub(crate) metrics: Arc<dyn DispatchMetrics>,
    pub(crate) cancel: CancellationToken,
    runtime: Handle,
}

impl Dispatcher {
    pub(crate) fn new(
        workers: usize,
        settings: ModeSettings,
        metrics: Arc<dyn DispatchMetrics>,
        runtime: Handle,
    ) -> Self {
        let cancel = CancellationToken::new();
        Self {
            queue: DispatchQueue::new(workers, settings.timeout, cancel.clone()),
            settings,
            metrics,
            cancel,
            runtime,
        }
    }

    fn new_backoff(&self) -> Backoff {
        Backoff::new(self.cancel.clone(), self.settings.backoff)
    }

    pub(crate) fn drop_message(&self, msg: EventsMessage, reason: impl Display) {
        let attempts = msg.attempts_made();
        warn!(
            attempts,
            events = msg.payload.len(),
            "dropping events: {reason}"
        );
        self.metrics.inc_dropped();
        msg.signaler.failed(DeliveryError::AttemptsExhausted {
            attempts,
            last_error: reason.to_string(),
        });
    }

    /// Resolves a message the queue refused.
    pub(crate) fn settle(&self, rejected: Rejected) {
        match rejected {
            Rejected::Shutdown(msg) => msg.signaler.failed(DeliveryError::Shutdown),
            Rejected::TimedOut(msg) => {
                let reason = format!(
                    "no worker accepted the request within {:?} per attempt",
                    self.settings.timeout
                );
                self.drop_message(msg, reason);
            }
        }
    }

    async fn requeue(&self, msg: EventsMessage) {
        if let Err(rejected) = self.queue.push_retry(msg).await {
            self.settle(rejected);
        }
    }
}

/// Requeue from a context that cannot await. Falls back to a spawned push when
/// the retry queue is full.
fn requeue_detached(dispatcher: &Arc<Dispatcher>, msg: EventsMessage) {
    match dispatcher.queue.try_push_retry(msg) {
        Ok(()) => {}
        Err(Rejected::TimedOut(msg)) => {
            let pending = Arc::clone(dispatcher);
            dispatcher.runtime.spawn(async move { pending.requeue(msg).await });
        }
        Err(rejected) => dispatcher.settle(rejected),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureAction {
    /// Keep sending the remainder on the same connection.
    Resend,
    Requeue,
    Drop,
}

/// Charges one attempt to `msg` and decides what happens next.
///
/// A temporary failure after the sink accepted part of the payload restores
/// the full budget, so a slow but working sink never causes drops.
pub(crate) fn on_failure(msg: &mut EventsMessage, error: &ClientError, progress: bool) -> FailureAction {
    msg.attempts_left.consume();
    if error.is_temporary() && progress {
        msg.reset_attempts();
        return FailureAction::Resend;
    }
    if msg.attempts_left.is_exhausted() {
        FailureAction::Drop
    } else {
        FailureAction::Requeue
    }
}

pub(crate) enum WorkerClient {
    Sync(Box<dyn ProtocolClient>),
    Async(Box<dyn AsyncProtocolClient>),
}

pub(crate) async fn run(dispatcher: Arc<Dispatcher>, client: WorkerClient, id: usize) {
    debug!(worker = id, "worker started");
    match client {
        WorkerClient::Sync(client) => run_sync(&dispatcher, client, id).await,
        WorkerClient::Async(client) => run_async(&dispatcher, client, id).await,
    }
    debug!(worker = id, "worker stopped");
}

enum Sent {
    Delivered,
    Failed { reconnect: bool },
    Cancelled,
}

async fn run_sync(dispatcher: &Dispatcher, mut client: Box<dyn ProtocolClient>, id: usize) {
    let mut backoff = dispatcher.new_backoff();
    let timeout = dispatcher.settings.timeout;

    'connect: loop {
        let connected = Retryer::unbounded(&mut backoff)
            .run(&mut client, |c| c.connect(timeout))
            .await;
        if connected.is_err() {
            break;
        }
        debug!(worker = id, "connected");

        loop {
            let Some(msg) = dispatcher.queue.receive().await else {
                break 'connect;
            };
            match send_sync(dispatcher, client.as_mut(), msg).await {
                Sent::Delivered => backoff.reset(),
                Sent::Cancelled => break 'connect,
                Sent::Failed { reconnect } => {
                    if reconnect {
                        close_client(client.close().await, id);
                    }
                    if !backoff.wait().await {
                        return;
                    }
                    if reconnect {
                        continue 'connect;
                    }
                }
            }
        }
    }
    close_client(client.close().await, id);
}

async fn send_sync(
    dispatcher: &Dispatcher,
    client: &mut dyn ProtocolClient,
    mut msg: EventsMessage,
) -> Sent {
    loop {
        let sent = tokio::select! {
            biased;
            _ = dispatcher.cancel.cancelled() => None,
            result = send_payload(&mut *client, &mut msg.payload) => Some(result),
        };
        let failure = match sent {
            None => {
                msg.signaler.failed(DeliveryError::Shutdown);
                return Sent::Cancelled;
            }
            Some(Ok(published)) => {
                dispatcher.metrics.add_published(published);
                msg.signaler.completed();
                return Sent::Delivered;
            }
            Some(Err(failure)) => failure,
        };

        dispatcher.metrics.add_published(failure.accepted);
        match on_failure(&mut msg, &failure.error, failure.made_progress()) {
            FailureAction::Resend => {
                debug!(remaining = msg.payload.len(), "partial send, resending remainder");
                continue;
            }
            FailureAction::Requeue => {
                debug!(attempts_left = %msg.attempts_left, "publish failed, requeueing: {}", failure.error);
                dispatcher.requeue(msg).await;
            }
            FailureAction::Drop => dispatcher.drop_message(msg, &failure.error),
        }
        return Sent::Failed {
            reconnect: !failure.error.is_temporary(),
        };
    }
}

enum Handoff {
    Event(Event),
    Batch(Vec<Event>),
}

async fn run_async(dispatcher: &Arc<Dispatcher>, mut client: Box<dyn AsyncProtocolClient>, id: usize) {
    let mut backoff = dispatcher.new_backoff();
    let timeout = dispatcher.settings.timeout;
    // Set by callbacks when the connection reported a non-temporary failure.
    let broken = Arc::new(AtomicBool::new(false));
    // Received while the connection was broken; sent once reconnected.
    let mut pending: Option<EventsMessage> = None;

    'connect: loop {
        let connected = Retryer::unbounded(&mut backoff)
            .run(&mut client, |c| c.connect(timeout))
            .await;
        if connected.is_err() {
            break;
        }
        broken.store(false, Ordering::SeqCst);
        debug!(worker = id, "connected");

        loop {
            let mut msg = match pending.take() {
                Some(msg) => msg,
                None => match dispatcher.queue.receive().await {
                    Some(msg) => msg,
                    None => break 'connect,
                },
            };
            // A callback may have failed the connection while this worker
            // was waiting for work.
            if broken.swap(false, Ordering::SeqCst) {
                debug!(worker = id, "connection failed, reconnecting before next send");
                pending = Some(msg);
                close_client(client.close().await, id);
                if !backoff.wait().await {
                    break 'connect;
                }
                continue 'connect;
            }

            let handoff = match &mut msg.payload {
                Payload::Single(event) => Handoff::Event(event.clone()),
                Payload::Batch(events) => Handoff::Batch(std::mem::take(events)),
            };
            let publish = match handoff {
                Handoff::Event(event) => {
                    let callback = event_callback(Arc::clone(dispatcher), msg, Arc::clone(&broken));
                    client.async_publish_event(event, callback)
                }
                Handoff::Batch(events) => {
                    let callback =
                        batch_callback(Arc::clone(dispatcher), msg, events.len(), Arc::clone(&broken));
                    client.async_publish_events(events, callback)
                }
            };
            // A callback dropped here resolves its signal as abandoned.
            tokio::select! {
                biased;
                _ = dispatcher.cancel.cancelled() => break 'connect,
                _ = publish => {}
            }
        }
    }
    if let Some(msg) = pending {
        msg.signaler.failed(DeliveryError::Shutdown);
    }
    close_client(client.close().await, id);
}

fn event_callback(dispatcher: Arc<Dispatcher>, msg: EventsMessage, broken: Arc<AtomicBool>) -> EventCallback {
    Box::new(move |result| match result {
        Ok(()) => {
            dispatcher.metrics.add_published(1);
            msg.signaler.completed();
        }
        Err(error) => async_failure(&dispatcher, msg, error, false, &broken),
    })
}

fn batch_callback(
    dispatcher: Arc<Dispatcher>,
    mut msg: EventsMessage,
    total: usize,
    broken: Arc<AtomicBool>,
) -> BatchCallback {
    Box::new(move |result| {
        let (rest, error) = match result {
            Ok(rest) => (rest, None),
            Err(PublishError { error, unsent }) => (unsent, Some(error)),
        };
        let accepted = total.saturating_sub(rest.len());
        dispatcher.metrics.add_published(accepted);
        let done = rest.is_empty();
        msg.payload = Payload::Batch(rest);

        match error {
            None if done => msg.signaler.completed(),
            None => async_failure(&dispatcher, msg, ClientError::TemporaryBulk, accepted > 0, &broken),
            Some(error) => async_failure(&dispatcher, msg, error, accepted > 0, &broken),
        }
    })
}

// The connection cannot be reused from a callback, so a remainder that would
// be resent in place is requeued instead.
fn async_failure(
    dispatcher: &Arc<Dispatcher>,
    mut msg: EventsMessage,
    error: ClientError,
    progress: bool,
    broken: &AtomicBool,
) {
    if !error.is_temporary() {
        broken.store(true, Ordering::SeqCst);
    }
    match on_failure(&mut msg, &error, progress) {
        FailureAction::Resend | FailureAction::Requeue => {
            debug!(attempts_left = %msg.attempts_left, "async publish failed, requeueing: {error}");
            requeue_detached(dispatcher, msg);
        }
        FailureAction::Drop => dispatcher.drop_message(msg, &error),
    }
}

fn close_client(result: Result<(), ClientError>, id: usize) {
    if let Err(err) = result {
        debug!(worker = id, "error closing connection: {err}");
    }
}
