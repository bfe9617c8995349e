// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection mode facade.
//!
//! [`new_connection_mode`] looks at the configured clients and picks one of:
//!
//! - a single connection, when there is exactly one synchronous client
//! - a single connection over a [`FailoverClient`], when there are several
//!   synchronous clients and load balancing is off
//! - a load balancer with one worker per client, when load balancing is on or
//!   the clients are asynchronous
//! - a load balancer with a single worker over an [`AsyncFailoverClient`], for
//!   several asynchronous clients without load balancing

use crate::attempts::Attempts;
use crate::backoff::BackoffSettings;
use crate::balance::LoadBalancerMode;
use crate::client::{AsyncProtocolClient, ProtocolClient};
use crate::error::{ClientError, ModeError};
use crate::event::Event;
use crate::failover::{AsyncFailoverClient, FailoverClient};
use crate::metrics::DispatchMetrics;
use crate::signal::Signaler;
use crate::single::SingleConnectionMode;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A strategy for delivering events through one or more clients.
///
/// Publish calls return once the request has been accepted (single mode:
/// once it has been delivered or dropped). The outcome always reaches the
/// caller through the [`Signaler`], exactly once.
#[async_trait]
pub trait ConnectionMode: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish_event(
        &self,
        signaler: Signaler,
        opts: PublishOptions,
        event: Event,
    ) -> Result<(), ModeError>;

    async fn publish_events(
        &self,
        signaler: Signaler,
        opts: PublishOptions,
        events: Vec<Event>,
    ) -> Result<(), ModeError>;

    /// Stops all workers and closes every client. Pending requests are failed.
    async fn close(&self) -> Result<(), ModeError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Retry without limit, ignoring the configured attempt budget.
    pub guaranteed: bool,
}

impl PublishOptions {
    pub fn guaranteed() -> Self {
        Self { guaranteed: true }
    }

    /// The attempt budget a request published with these options gets.
    pub fn attempts(&self, configured: Attempts) -> Attempts {
        if self.guaranteed {
            Attempts::Unlimited
        } else {
            configured
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeSettings {
    pub max_attempts: Attempts,
    /// Bounds connects and waits for a free worker.
    pub timeout: Duration,
    pub backoff: BackoffSettings,
    pub load_balance: bool,
}

impl Default for ModeSettings {
    fn default() -> Self {
        Self {
            max_attempts: Attempts::Limited(4),
            timeout: Duration::from_secs(30),
            backoff: BackoffSettings::default(),
            load_balance: false,
        }
    }
}

impl ModeSettings {
    pub fn validate(&self) -> Result<(), ModeError> {
        if self.max_attempts.is_exhausted() {
            return Err(ModeError::InvalidConfig(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ModeError::InvalidConfig(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if self.backoff.init.is_zero() {
            return Err(ModeError::InvalidConfig(
                "initial backoff must be greater than zero".to_string(),
            ));
        }
        if self.backoff.max < self.backoff.init {
            return Err(ModeError::InvalidConfig(format!(
                "max backoff {:?} is below initial backoff {:?}",
                self.backoff.max, self.backoff.init
            )));
        }
        Ok(())
    }
}

/// The clients a mode is built from. All members share one kind.
pub enum ClientSet {
    Sync(Vec<Box<dyn ProtocolClient>>),
    Async(Vec<Box<dyn AsyncProtocolClient>>),
}

impl ClientSet {
    pub fn len(&self) -> usize {
        match self {
            ClientSet::Sync(clients) => clients.len(),
            ClientSet::Async(clients) => clients.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Picks and builds the connection mode for `clients`.
///
/// The load balancer spawns its workers on the current tokio runtime.
pub fn new_connection_mode(
    clients: ClientSet,
    settings: ModeSettings,
    metrics: Arc<dyn DispatchMetrics>,
) -> Result<Box<dyn ConnectionMode>, ModeError> {
    if clients.is_empty() {
        return Err(ModeError::NoClients);
    }
    settings.validate()?;

    let mode: Box<dyn ConnectionMode> = match clients {
        ClientSet::Sync(mut clients) if clients.len() == 1 => {
            let client = clients.pop().ok_or(ModeError::NoClients)?;
            Box::new(SingleConnectionMode::new(client, settings, metrics)?)
        }
        ClientSet::Sync(clients) if settings.load_balance => {
            Box::new(LoadBalancerMode::new(clients, settings, metrics)?)
        }
        ClientSet::Sync(clients) => {
            let failover = FailoverClient::new(clients).ok_or(ModeError::NoClients)?;
            Box::new(SingleConnectionMode::failover(failover, settings, metrics)?)
        }
        ClientSet::Async(clients) if clients.len() > 1 && !settings.load_balance => {
            let failover = AsyncFailoverClient::new(clients).ok_or(ModeError::NoClients)?;
            let clients: Vec<Box<dyn AsyncProtocolClient>> = vec![Box::new(failover)];
            Box::new(LoadBalancerMode::new_async(clients, settings, metrics)?)
        }
        ClientSet::Async(clients) => {
            Box::new(LoadBalancerMode::new_async(clients, settings, metrics)?)
        }
    };
    debug!(mode = mode.name(), "connection mode selected");
    Ok(mode)
}

/// Creates `workers` clients per host, in host order.
///
/// Each host gets its own set of connections so that a load balancer runs
/// `hosts × workers` workers.
pub fn make_clients<C, F>(hosts: &[String], workers: usize, mut new_client: F) -> Result<Vec<C>, ModeError>
where
    F: FnMut(&str) -> Result<C, ClientError>,
{
    if hosts.is_empty() {
        return Err(ModeError::NoClients);
    }
    let workers = workers.max(1);
    let mut clients = Vec::with_capacity(hosts.len() * workers);
    for host in hosts {
        for _ in 0..workers {
            let client = new_client(host).map_err(|err| ModeError::ClientCreation {
                host: host.clone(),
                reason: err.to_string(),
            })?;
            clients.push(client);
        }
    }
    Ok(clients)
}
