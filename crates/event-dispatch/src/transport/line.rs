// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Newline-delimited JSON over TCP.
//!
//! Every event is written as one JSON object followed by `\n`. Events are
//! written one at a time, so a failing write reports exactly the events from
//! the failed one onwards as unsent.

use crate::client::{BatchResult, ProtocolClient};
use crate::error::{ClientError, PublishError};
use crate::event::Event;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

pub struct LineClient {
    addr: String,
    stream: Option<TcpStream>,
}

impl LineClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn write_line(stream: &mut TcpStream, event: &Event) -> Result<(), ClientError> {
        let mut line =
            serde_json::to_vec(event).map_err(|err| ClientError::Publish(err.to_string()))?;
        line.push(b'\n');
        stream.write_all(&line).await?;
        Ok(())
    }
}

#[async_trait]
impl ProtocolClient for LineClient {
    async fn connect(&mut self, timeout: Duration) -> Result<(), ClientError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
            .map_err(|err| ClientError::Connect(format!("{}: {err}", self.addr)))?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "line client connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    async fn publish_events(&mut self, events: Vec<Event>) -> BatchResult {
        let Some(stream) = self.stream.as_mut() else {
            return Err(PublishError::new(ClientError::NotConnected, events));
        };
        let mut failed = None;
        for (sent, event) in events.iter().enumerate() {
            if let Err(error) = Self::write_line(stream, event).await {
                failed = Some((sent, error));
                break;
            }
        }
        match failed {
            None => Ok(Vec::new()),
            Some((sent, error)) => {
                // A write error leaves the stream in an unknown state.
                self.stream = None;
                let mut events = events;
                Err(PublishError::new(error, events.split_off(sent)))
            }
        }
    }

    async fn publish_event(&mut self, event: &Event) -> Result<(), ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        let result = Self::write_line(stream, event).await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }
}
