// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single connection mode.
//!
//! One client (possibly a [`FailoverClient`]) serves every publisher. A publish
//! call holds the connection until its payload is delivered or dropped, so
//! concurrent publishers are serialized and each one experiences backpressure
//! directly.

use crate::attempts::Attempts;
use crate::backoff::Backoff;
use crate::client::{send_payload, ProtocolClient};
use crate::error::{ClientError, DeliveryError, ModeError};
use crate::event::{Event, Payload};
use crate::failover::FailoverClient;
use crate::metrics::DispatchMetrics;
use crate::mode::{ConnectionMode, ModeSettings, PublishOptions};
use crate::signal::Signaler;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Connection {
    client: Box<dyn ProtocolClient>,
    connected: bool,
    backoff: Backoff,
}

enum Attempt {
    Delivered(usize),
    Failed { error: ClientError, accepted: usize },
    Cancelled,
}

impl Connection {
    async fn attempt(
        &mut self,
        payload: &mut Payload,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Attempt {
        if !self.connected {
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.client.connect(timeout) => Some(result),
            };
            match connected {
                None => return Attempt::Cancelled,
                Some(Err(error)) => {
                    warn!("failed to connect: {error}");
                    return Attempt::Failed { error, accepted: 0 };
                }
                Some(Ok(())) => {
                    debug!("connection established");
                    self.connected = true;
                }
            }
        }

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = send_payload(&mut self.client, payload) => Some(result),
        };
        match sent {
            None => Attempt::Cancelled,
            Some(Ok(published)) => Attempt::Delivered(published),
            Some(Err(failure)) => {
                if !failure.error.is_temporary() {
                    self.close().await;
                }
                Attempt::Failed {
                    error: failure.error,
                    accepted: failure.accepted,
                }
            }
        }
    }

    async fn close(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        if let Err(err) = self.client.close().await {
            debug!("error closing connection: {err}");
        }
    }
}

pub struct SingleConnectionMode {
    name: &'static str,
    conn: Mutex<Connection>,
    max_attempts: Attempts,
    timeout: Duration,
    cancel: CancellationToken,
    metrics: Arc<dyn DispatchMetrics>,
}

impl SingleConnectionMode {
    pub fn new(
        client: Box<dyn ProtocolClient>,
        settings: ModeSettings,
        metrics: Arc<dyn DispatchMetrics>,
    ) -> Result<Self, ModeError> {
        Self::build("single", client, settings, metrics)
    }

    /// A single connection that switches members of `clients` on failure.
    pub fn failover(
        clients: FailoverClient,
        settings: ModeSettings,
        metrics: Arc<dyn DispatchMetrics>,
    ) -> Result<Self, ModeError> {
        Self::build("failover", Box::new(clients), settings, metrics)
    }

    fn build(
        name: &'static str,
        client: Box<dyn ProtocolClient>,
        settings: ModeSettings,
        metrics: Arc<dyn DispatchMetrics>,
    ) -> Result<Self, ModeError> {
        settings.validate()?;
        let cancel = CancellationToken::new();
        Ok(Self {
            name,
            conn: Mutex::new(Connection {
                client,
                connected: false,
                backoff: Backoff::new(cancel.clone(), settings.backoff),
            }),
            max_attempts: settings.max_attempts,
            timeout: settings.timeout,
            cancel,
            metrics,
        })
    }

    async fn publish(&self, signaler: Signaler, opts: PublishOptions, mut payload: Payload) {
        if payload.is_empty() {
            signaler.completed();
            return;
        }
        let max_attempts = opts.attempts(self.max_attempts);

        let conn = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            conn = self.conn.lock() => Some(conn),
        };
        let Some(mut conn) = conn else {
            signaler.failed(DeliveryError::Shutdown);
            return;
        };

        // Attempts since the sink last accepted anything.
        let mut fails = 0u32;
        loop {
            match conn.attempt(&mut payload, &self.cancel, self.timeout).await {
                Attempt::Delivered(published) => {
                    conn.backoff.reset();
                    self.metrics.add_published(published);
                    signaler.completed();
                    return;
                }
                Attempt::Cancelled => {
                    signaler.failed(DeliveryError::Shutdown);
                    return;
                }
                Attempt::Failed { error, accepted } => {
                    self.metrics.add_published(accepted);
                    if error.is_temporary() && accepted > 0 {
                        fails = 0;
                    } else {
                        fails = fails.saturating_add(1);
                    }
                    if !max_attempts.allows(fails) {
                        warn!(
                            attempts = fails,
                            events = payload.len(),
                            "dropping events after {fails} failed attempts: {error}"
                        );
                        self.metrics.inc_dropped();
                        signaler.failed(DeliveryError::AttemptsExhausted {
                            attempts: fails,
                            last_error: error.to_string(),
                        });
                        return;
                    }
                    debug!(attempts = fails, "publish failed, retrying: {error}");
                    if !conn.backoff.wait().await {
                        signaler.failed(DeliveryError::Shutdown);
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ConnectionMode for SingleConnectionMode {
    fn name(&self) -> &'static str {
        self.name
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
        self.cancel.cancel();
        self.conn.lock().await.close().await;
        Ok(())
    }
}
