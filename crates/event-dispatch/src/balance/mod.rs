// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Load balancing mode.
//!
//! Publishers enqueue requests and return; one worker per client competes for
//! them. Retried requests are preferred over new ones, and any worker may pick
//! up a request another worker failed on.

mod queue;
mod worker;

use crate::client::{AsyncProtocolClient, ProtocolClient};
use crate::error::{DeliveryError, ModeError};
use crate::event::{Event, Payload};
use crate::metrics::DispatchMetrics;
use crate::mode::{ConnectionMode, ModeSettings, PublishOptions};
use crate::signal::Signaler;
use async_trait::async_trait;
use queue::EventsMessage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use worker::{Dispatcher, WorkerClient};

/// Decrements the live worker count when a worker task ends, however it ends.
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct LoadBalancerMode {
    dispatcher: Arc<Dispatcher>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    live_workers: Arc<AtomicUsize>,
}

impl LoadBalancerMode {
    /// Starts one worker per client on the current tokio runtime.
    pub fn new(
        clients: Vec<Box<dyn ProtocolClient>>,
        settings: ModeSettings,
        metrics: Arc<dyn DispatchMetrics>,
    ) -> Result<Self, ModeError> {
        let clients = clients.into_iter().map(WorkerClient::Sync).collect();
        Self::start(clients, settings, metrics)
    }

    pub fn new_async(
        clients: Vec<Box<dyn AsyncProtocolClient>>,
        settings: ModeSettings,
        metrics: Arc<dyn DispatchMetrics>,
    ) -> Result<Self, ModeError> {
        let clients = clients.into_iter().map(WorkerClient::Async).collect();
        Self::start(clients, settings, metrics)
    }

    fn start(
        clients: Vec<WorkerClient>,
        settings: ModeSettings,
        metrics: Arc<dyn DispatchMetrics>,
    ) -> Result<Self, ModeError> {
        if clients.is_empty() {
            return Err(ModeError::NoClients);
        }
        settings.validate()?;
        let runtime = Handle::try_current().map_err(|err| {
            ModeError::InvalidConfig(format!("load balancing requires a tokio runtime: {err}"))
        })?;

        let dispatcher = Arc::new(Dispatcher::new(
            clients.len(),
            settings,
            metrics,
            runtime.clone(),
        ));
        let live_workers = Arc::new(AtomicUsize::new(0));
        let workers = clients
            .into_iter()
            .enumerate()
            .map(|(id, client)| {
                live_workers.fetch_add(1, Ordering::SeqCst);
                let guard = LiveGuard(Arc::clone(&live_workers));
                let dispatcher = Arc::clone(&dispatcher);
                runtime.spawn(async move {
                    let _guard = guard;
                    worker::run(dispatcher, client, id).await;
                })
            })
            .collect::<Vec<_>>();
        debug!(workers = workers.len(), "load balancer started");

        Ok(Self {
            dispatcher,
            workers: Mutex::new(workers),
            live_workers,
        })
    }

    /// Number of worker tasks still running.
    pub fn active_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    async fn publish(&self, signaler: Signaler, opts: PublishOptions, payload: Payload) {
        if payload.is_empty() {
            signaler.completed();
            return;
        }
        let dispatcher = &self.dispatcher;
        if dispatcher.cancel.is_cancelled() {
            signaler.failed(DeliveryError::Shutdown);
            return;
        }
        let max_attempts = opts.attempts(dispatcher.settings.max_attempts);
        let msg = EventsMessage::new(signaler, max_attempts, payload);
        if let Err(rejected) = dispatcher.queue.push_work(msg).await {
            dispatcher.settle(rejected);
        }
    }
}

#[async_trait]
impl ConnectionMode for LoadBalancerMode {
    fn name(&self) -> &'static str {
        "load_balance"
    }

    async fn publish_event(
        &self,
        signaler: Signaler,
        opts: PublishOptions,
        event: Event,
    ) -> Result<(), ModeError> {
        self.publish(signaler, opts, Payload::Single(event)).await;
        Ok(())
    }

    async fn publish_events(
        &self,
        signaler: Signaler,
        opts: PublishOptions,
        events: Vec<Event>,
    ) -> Result<(), ModeError> {
        self.publish(signaler, opts, Payload::Batch(events)).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), ModeError> {
        self.dispatcher.cancel.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(err) = worker.await {
                error!("load balancer worker failed: {err}");
            }
        }
        let drained = self.dispatcher.queue.drain().await;
        if drained > 0 {
            debug!(drained, "failed queued requests on shutdown");
        }
        Ok(())
    }
}

impl Drop for LoadBalancerMode {
    fn drop(&mut self) {
        self.dispatcher.cancel.cancel();
    }
}
