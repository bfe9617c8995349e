// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared work and retry queues.
//!
//! New requests enter the work queue; failed ones are pushed to the retry queue,
//! which workers always drain first. Each worker receives from both through
//! [`DispatchQueue::receive`].

use crate::attempts::Attempts;
use crate::error::DeliveryError;
use crate::event::Payload;
use crate::signal::Signaler;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// New requests wait here until a worker is free.
const WORK_QUEUE_CAPACITY: usize = 1;

/// A publish request travelling between publishers and workers.
#[derive(Debug)]
pub(crate) struct EventsMessage {
    pub(crate) signaler: Signaler,
    pub(crate) max_attempts: Attempts,
    pub(crate) attempts_left: Attempts,
    pub(crate) payload: Payload,
}

impl EventsMessage {
    pub(crate) fn new(signaler: Signaler, max_attempts: Attempts, payload: Payload) -> Self {
        Self {
            signaler,
            max_attempts,
            attempts_left: max_attempts,
            payload,
        }
    }

    /// Restores the full budget after the sink made progress.
    pub(crate) fn reset_attempts(&mut self) {
        self.attempts_left = self.max_attempts;
    }

    /// Sends charged to the message so far. Zero when it was dropped before
    /// reaching a worker.
    pub(crate) fn attempts_made(&self) -> u32 {
        match (self.max_attempts, self.attempts_left) {
            (Attempts::Limited(max), Attempts::Limited(left)) => max.saturating_sub(left),
            _ => 0,
        }
    }
}

/// Why a message could not be enqueued. The message is handed back so the
/// caller can resolve its signal.
#[derive(Debug)]
pub(crate) enum Rejected {
    Shutdown(EventsMessage),
    /// No slot freed up within the message's remaining attempt budget, each
    /// try bounded by the push timeout.
    TimedOut(EventsMessage),
}

pub(crate) struct DispatchQueue {
    work_tx: mpsc::Sender<EventsMessage>,
    work_rx: Mutex<mpsc::Receiver<EventsMessage>>,
    retries_tx: mpsc::Sender<EventsMessage>,
    retries_rx: Mutex<mpsc::Receiver<EventsMessage>>,
    push_timeout: Duration,
    cancel: CancellationToken,
}

impl DispatchQueue {
    /// The retry queue holds two messages per worker, enough for every worker
    /// to requeue while the others are still receiving.
    pub(crate) fn new(workers: usize, push_timeout: Duration, cancel: CancellationToken) -> Self {
        let (work_tx, work_rx) = mpsc::channel(WORK_QUEUE_CAPACITY);
        let (retries_tx, retries_rx) = mpsc::channel(workers.max(1) * 2);
        Self {
            work_tx,
            work_rx: Mutex::new(work_rx),
            retries_tx,
            retries_rx: Mutex::new(retries_rx),
            push_timeout,
            cancel,
        }
    }

    pub(crate) async fn push_work(&self, msg: EventsMessage) -> Result<(), Rejected> {
        self.push(&self.work_tx, msg).await
    }

    pub(crate) async fn push_retry(&self, msg: EventsMessage) -> Result<(), Rejected> {
        self.push(&self.retries_tx, msg).await
    }

    /// Non-blocking retry push for callers that cannot await, such as
    /// completion callbacks of asynchronous clients.
    pub(crate) fn try_push_retry(&self, msg: EventsMessage) -> Result<(), Rejected> {
        if self.cancel.is_cancelled() {
            return Err(Rejected::Shutdown(msg));
        }
        self.retries_tx.try_send(msg).map_err(|err| match err {
            mpsc::error::TrySendError::Full(msg) => Rejected::TimedOut(msg),
            mpsc::error::TrySendError::Closed(msg) => Rejected::Shutdown(msg),
        })
    }

    // Guaranteed messages block until a slot frees up or shutdown. Others give
    // up after one push timeout per remaining attempt; those timeouts are
    // counted on a copy and never consume the message's own budget.
    async fn push(
        &self,
        tx: &mpsc::Sender<EventsMessage>,
        msg: EventsMessage,
    ) -> Result<(), Rejected> {
        let mut tries = msg.attempts_left;
        loop {
            if tries.is_exhausted() {
                return Err(Rejected::TimedOut(msg));
            }
            let reserved = if tries.is_unlimited() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    permit = tx.reserve() => Some(Ok(permit)),
                }
            } else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    permit = timeout(self.push_timeout, tx.reserve()) => Some(permit),
                }
            };
            match reserved {
                None | Some(Ok(Err(_))) => return Err(Rejected::Shutdown(msg)),
                Some(Ok(Ok(permit))) => {
                    permit.send(msg);
                    return Ok(());
                }
                Some(Err(_elapsed)) => {
                    tries.consume();
                    debug!(tries_left = %tries, "queue full, retrying push");
                }
            }
        }
    }

    /// Waits for the next message, preferring retries. Returns `None` once
    /// the queue is shut down.
    pub(crate) async fn receive(&self) -> Option<EventsMessage> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            msg = self.next() => msg,
        }
    }

    async fn next(&self) -> Option<EventsMessage> {
        let mut retries = self.retries_rx.lock().await;
        if let Ok(msg) = retries.try_recv() {
            return Some(msg);
        }
        let mut work = self.work_rx.lock().await;
        tokio::select! {
            biased;
            msg = retries.recv() => msg,
            msg = work.recv() => msg,
        }
    }

    /// Fails every queued message with [`DeliveryError::Shutdown`]. Returns
    /// how many were drained.
    pub(crate) async fn drain(&self) -> usize {
        let mut drained = 0;
        for rx in [&self.retries_rx, &self.work_rx] {
            let mut rx = rx.lock().await;
            while let Ok(msg) = rx.try_recv() {
                msg.signaler.failed(DeliveryError::Shutdown);
                drained += 1;
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::signal::Outcome;

    fn message(attempts: Attempts) -> (EventsMessage, crate::signal::SignalReceiver) {
        let (signaler, receiver) = Signaler::channel();
        (
            EventsMessage::new(signaler, attempts, Payload::Single(Event::default())),
            receiver,
        )
    }

    fn queue(cancel: &CancellationToken) -> DispatchQueue {
        DispatchQueue::new(1, Duration::from_millis(50), cancel.clone())
    }

    #[test]
    fn test_attempts_made() {
        let (mut msg, _rx) = message(Attempts::Limited(3));
        assert_eq!(msg.attempts_made(), 0);
        msg.attempts_left.consume();
        msg.attempts_left.consume();
        assert_eq!(msg.attempts_made(), 2);
        msg.reset_attempts();
        assert_eq!(msg.attempts_left, Attempts::Limited(3));
    }

    #[tokio::test]
    async fn test_retries_are_received_first() {
        let cancel = CancellationToken::new();
        let queue = queue(&cancel);
        let (work, _work_rx) = message(Attempts::Limited(1));
        let (retry, _retry_rx) = message(Attempts::Limited(7));

        queue.push_work(work).await.unwrap();
        queue.push_retry(retry).await.unwrap();

        let first = queue.receive().await.unwrap();
        assert_eq!(first.max_attempts, Attempts::Limited(7));
        let second = queue.receive().await.unwrap();
        assert_eq!(second.max_attempts, Attempts::Limited(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_gives_up_after_budget_of_timeouts() {
        let cancel = CancellationToken::new();
        let queue = queue(&cancel);
        let (filler, _filler_rx) = message(Attempts::Limited(1));
        queue.push_work(filler).await.unwrap();

        let (msg, _rx) = message(Attempts::Limited(3));
        let start = tokio::time::Instant::now();
        match queue.push_work(msg).await {
            Err(Rejected::TimedOut(msg)) => assert_eq!(msg.attempts_left, Attempts::Limited(3)),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guaranteed_push_waits_for_free_slot() {
        let cancel = CancellationToken::new();
        let queue = std::sync::Arc::new(queue(&cancel));
        let (filler, _filler_rx) = message(Attempts::Limited(1));
        queue.push_work(filler).await.unwrap();

        let pusher = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move {
                let (msg, _rx) = message(Attempts::Unlimited);
                queue.push_work(msg).await.is_ok()
            })
        };
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(!pusher.is_finished());

        assert!(queue.receive().await.is_some());
        assert!(pusher.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_rejects_pushes_and_stops_receive() {
        let cancel = CancellationToken::new();
        let queue = queue(&cancel);
        cancel.cancel();

        let (msg, _rx) = message(Attempts::Unlimited);
        assert!(matches!(queue.push_retry(msg).await, Err(Rejected::Shutdown(_))));
        let (msg, _rx) = message(Attempts::Unlimited);
        assert!(matches!(queue.try_push_retry(msg), Err(Rejected::Shutdown(_))));
        assert!(queue.receive().await.is_none());
    }

    #[tokio::test]
    async fn test_drain_fails_queued_messages() {
        let cancel = CancellationToken::new();
        let queue = queue(&cancel);
        let (work, work_rx) = message(Attempts::Limited(1));
        let (retry, retry_rx) = message(Attempts::Limited(1));
        queue.push_work(work).await.unwrap();
        queue.try_push_retry(retry).unwrap();

        assert_eq!(queue.drain().await, 2);
        assert_eq!(
            work_rx.outcome().await,
            Outcome::Failed(DeliveryError::Shutdown)
        );
        assert_eq!(
            retry_rx.outcome().await,
            Outcome::Failed(DeliveryError::Shutdown)
        );
    }
}
