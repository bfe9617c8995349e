// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::event::Event;
use std::time::Duration;

/// Errors reported by a transport client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The sink rejected part or all of a batch but is expected to accept it
    /// shortly. Retried without reconnecting.
    #[error("temporary bulk send failure")]
    TemporaryBulk,

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("client is not connected")]
    NotConnected,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl ClientError {
    pub fn is_temporary(&self) -> bool {
        matches!(self, ClientError::TemporaryBulk)
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}

/// A failed batch publish: the cause plus the events the sink did not accept.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error} ({} events unsent)", unsent.len())]
pub struct PublishError {
    pub error: ClientError,
    pub unsent: Vec<Event>,
}

impl PublishError {
    pub fn new(error: ClientError, unsent: Vec<Event>) -> Self {
        Self { error, unsent }
    }
}

/// Reason carried by a failed [`crate::signal::Outcome`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("dropped after {attempts} attempts: {last_error}")]
    AttemptsExhausted { attempts: u32, last_error: String },

    #[error("output is shutting down")]
    Shutdown,

    #[error("signaler dropped before delivery was resolved")]
    Abandoned,
}

/// Errors surfaced synchronously by mode construction and publish calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModeError {
    #[error("no clients configured")]
    NoClients,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to create client for {host}: {reason}")]
    ClientCreation { host: String, reason: String },
}
