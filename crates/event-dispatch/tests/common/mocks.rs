// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scripted mock clients

use async_trait::async_trait;
use event_dispatch::client::{
    AsyncProtocolClient, BatchCallback, BatchResult, EventCallback, ProtocolClient,
};
use event_dispatch::{ClientError, Event, PublishError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a mock answers one publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Accept,
    /// Accept the first `n` events and reject the rest as a temporary failure.
    AcceptSome(usize),
    /// Accept the first `n` events and fail the rest with the given error.
    AcceptSomeThenFail(usize, ClientError),
    Fail(ClientError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Always,
    Never,
    /// Only the very first connect succeeds.
    Once,
}

/// Counters shared between a mock and the test that owns it.
#[derive(Debug, Default)]
pub struct ClientStats {
    connects: AtomicUsize,
    closes: AtomicUsize,
    publish_calls: AtomicUsize,
    delivered: Mutex<Vec<Event>>,
}

#[allow(dead_code)]
impl ClientStats {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<Event> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

pub struct MockClient {
    stats: Arc<ClientStats>,
    script: VecDeque<Step>,
    fallback: Step,
    connect: ConnectBehavior,
    connected: bool,
    disconnect_on_failure: bool,
    delay: Option<Duration>,
}

#[allow(dead_code)]
impl MockClient {
    pub fn healthy() -> Self {
        Self {
            stats: Arc::new(ClientStats::default()),
            script: VecDeque::new(),
            fallback: Step::Accept,
            connect: ConnectBehavior::Always,
            connected: false,
            disconnect_on_failure: false,
            delay: None,
        }
    }

    /// Every publish fails with `error`.
    pub fn failing(error: ClientError) -> Self {
        Self {
            fallback: Step::Fail(error),
            ..Self::healthy()
        }
    }

    /// Answers with `steps` in order, then with `fallback` forever.
    pub fn scripted(steps: Vec<Step>, fallback: Step) -> Self {
        Self {
            script: steps.into(),
            fallback,
            ..Self::healthy()
        }
    }

    pub fn with_connect(mut self, connect: ConnectBehavior) -> Self {
        self.connect = connect;
        self
    }

    /// A non-temporary publish failure leaves the mock disconnected until the
    /// next successful connect.
    pub fn disconnect_on_failure(mut self) -> Self {
        self.disconnect_on_failure = true;
        self
    }

    /// Every publish call takes `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn stats(&self) -> Arc<ClientStats> {
        Arc::clone(&self.stats)
    }

    fn next_step(&mut self) -> Step {
        self.script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn deliver(&self, events: &[Event]) {
        self.stats.delivered.lock().unwrap().extend_from_slice(events);
    }

    async fn begin_publish(&mut self) -> Option<Step> {
        self.stats.publish_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let step = self.connected.then(|| self.next_step());
        if let Some(Step::Fail(error) | Step::AcceptSomeThenFail(_, error)) = &step {
            if self.disconnect_on_failure && !error.is_temporary() {
                self.connected = false;
            }
        }
        step
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    async fn connect(&mut self, _timeout: Duration) -> Result<(), ClientError> {
        let attempt = self.stats.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let ok = match self.connect {
            ConnectBehavior::Always => true,
            ConnectBehavior::Never => false,
            ConnectBehavior::Once => attempt == 1,
        };
        if !ok {
            return Err(ClientError::Connect("connection refused".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        self.connected = false;
        Ok(())
    }

    async fn publish_events(&mut self, mut events: Vec<Event>) -> BatchResult {
        let Some(step) = self.begin_publish().await else {
            return Err(PublishError::new(ClientError::NotConnected, events));
        };
        match step {
            Step::Accept => {
                self.deliver(&events);
                Ok(Vec::new())
            }
            Step::AcceptSome(n) => {
                let rest = events.split_off(n.min(events.len()));
                self.deliver(&events);
                if rest.is_empty() {
                    Ok(rest)
                } else {
                    Err(PublishError::new(ClientError::TemporaryBulk, rest))
                }
            }
            Step::AcceptSomeThenFail(n, error) => {
                let rest = events.split_off(n.min(events.len()));
                self.deliver(&events);
                Err(PublishError::new(error, rest))
            }
            Step::Fail(error) => Err(PublishError::new(error, events)),
        }
    }

    async fn publish_event(&mut self, event: &Event) -> Result<(), ClientError> {
        let Some(step) = self.begin_publish().await else {
            return Err(ClientError::NotConnected);
        };
        match step {
            Step::Accept | Step::AcceptSome(1..) => {
                self.deliver(std::slice::from_ref(event));
                Ok(())
            }
            Step::AcceptSome(_) => Err(ClientError::TemporaryBulk),
            Step::AcceptSomeThenFail(1.., _) => {
                self.deliver(std::slice::from_ref(event));
                Ok(())
            }
            Step::AcceptSomeThenFail(_, error) | Step::Fail(error) => Err(error),
        }
    }
}

/// [`MockClient`] behind the asynchronous interface. Callbacks fire from a
/// spawned task, after the publish call has returned.
pub struct AsyncMockClient {
    inner: MockClient,
}

#[allow(dead_code)]
impl AsyncMockClient {
    pub fn new(inner: MockClient) -> Self {
        Self { inner }
    }

    pub fn stats(&self) -> Arc<ClientStats> {
        self.inner.stats()
    }
}

#[async_trait]
impl AsyncProtocolClient for AsyncMockClient {
    async fn connect(&mut self, timeout: Duration) -> Result<(), ClientError> {
        ProtocolClient::connect(&mut self.inner, timeout).await
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        ProtocolClient::close(&mut self.inner).await
    }

    async fn async_publish_events(&mut self, events: Vec<Event>, callback: BatchCallback) {
        let result = ProtocolClient::publish_events(&mut self.inner, events).await;
        tokio::spawn(async move { callback(result) });
    }

    async fn async_publish_event(&mut self, event: Event, callback: EventCallback) {
        let result = ProtocolClient::publish_event(&mut self.inner, &event).await;
        tokio::spawn(async move { callback(result) });
    }
}
