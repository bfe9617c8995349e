// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Failover between several clients.
//!
//! A failover client presents N clients as one: exactly one member is active,
//! and every (re)connect after a failure switches to another member. With two
//! clients the switch simply alternates; with more, the next member is drawn
//! at random among all but the current one.

use crate::client::{
    AsyncProtocolClient, BatchCallback, BatchResult, EventCallback, ProtocolClient,
};
use crate::error::{ClientError, PublishError};
use crate::event::Event;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Picks the member to connect next.
#[derive(Debug, Clone, Copy)]
struct Selector {
    len: usize,
    active: Option<usize>,
}

impl Selector {
    fn new(len: usize) -> Self {
        Self { len, active: None }
    }

    fn advance(&mut self) -> usize {
        let next = match (self.len, self.active) {
            (1, _) => 0,
            (2, Some(active)) => 1 - active,
            (2, None) => 0,
            (len, None) => fastrand::usize(0..len),
            (len, Some(active)) => loop {
                let candidate = fastrand::usize(0..len);
                if candidate != active {
                    break candidate;
                }
            },
        };
        self.active = Some(next);
        next
    }
}

pub struct FailoverClient {
    clients: Vec<Box<dyn ProtocolClient>>,
    selector: Selector,
    connected: bool,
}

impl FailoverClient {
    /// Returns `None` when `clients` is empty.
    pub fn new(clients: Vec<Box<dyn ProtocolClient>>) -> Option<Self> {
        if clients.is_empty() {
            return None;
        }
        Some(Self {
            selector: Selector::new(clients.len()),
            clients,
            connected: false,
        })
    }

    pub fn active_index(&self) -> Option<usize> {
        self.selector.active
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn active_client(&mut self) -> Option<&mut Box<dyn ProtocolClient>> {
        if !self.connected {
            return None;
        }
        let index = self.selector.active?;
        self.clients.get_mut(index)
    }
}

#[async_trait]
impl ProtocolClient for FailoverClient {
    async fn connect(&mut self, timeout: Duration) -> Result<(), ClientError> {
        if self.connected {
            return Ok(());
        }
        let next = self.selector.advance();
        debug!(client = next, "failover: connecting");
        let client = self.clients.get_mut(next).ok_or(ClientError::NotConnected)?;
        client.connect(timeout).await?;
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        match self.selector.active.and_then(|i| self.clients.get_mut(i)) {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }

    async fn publish_events(&mut self, events: Vec<Event>) -> BatchResult {
        match self.active_client() {
            Some(client) => client.publish_events(events).await,
            None => Err(PublishError::new(ClientError::NotConnected, events)),
        }
    }

    async fn publish_event(&mut self, event: &Event) -> Result<(), ClientError> {
        match self.active_client() {
            Some(client) => client.publish_event(event).await,
            None => Err(ClientError::NotConnected),
        }
    }
}

/// [`FailoverClient`] over asynchronous clients.
pub struct AsyncFailoverClient {
    clients: Vec<Box<dyn AsyncProtocolClient>>,
    selector: Selector,
    connected: bool,
}

impl AsyncFailoverClient {
    pub fn new(clients: Vec<Box<dyn AsyncProtocolClient>>) -> Option<Self> {
        if clients.is_empty() {
            return None;
        }
        Some(Self {
            selector: Selector::new(clients.len()),
            clients,
            connected: false,
        })
    }

    pub fn active_index(&self) -> Option<usize> {
        self.selector.active
    }

    fn active_client(&mut self) -> Option<&mut Box<dyn AsyncProtocolClient>> {
        if !self.connected {
            return None;
        }
        let index = self.selector.active?;
        self.clients.get_mut(index)
    }
}

#[async_trait]
impl AsyncProtocolClient for AsyncFailoverClient {
    async fn connect(&mut self, timeout: Duration) -> Result<(), ClientError> {
        if self.connected {
            return Ok(());
        }
        let next = self.selector.advance();
        debug!(client = next, "failover: connecting");
        let client = self.clients.get_mut(next).ok_or(ClientError::NotConnected)?;
        client.connect(timeout).await?;
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        match self.selector.active.and_then(|i| self.clients.get_mut(i)) {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }

    async fn async_publish_events(&mut self, events: Vec<Event>, callback: BatchCallback) {
        match self.active_client() {
            Some(client) => client.async_publish_events(events, callback).await,
            None => callback(Err(PublishError::new(ClientError::NotConnected, events))),
        }
    }

    async fn async_publish_event(&mut self, event: Event, callback: EventCallback) {
        match self.active_client() {
            Some(client) => client.async_publish_event(event, callback).await,
            None => callback(Err(ClientError::NotConnected)),
        }
    }
}
