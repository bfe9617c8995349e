// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Event Dispatch
//!
//! Output dispatch core for a log/event shipping agent: takes events produced by
//! inputs and delivers them to one or more remote sinks with retry, backoff and
//! exactly-once acknowledgement back to the producer.
//!
//! ## Architecture
//!
//! - [`backoff`] and [`retry`]: delay strategies and a bounded retry driver
//! - [`client`]: the transport boundary ([`client::ProtocolClient`], [`client::AsyncProtocolClient`])
//! - [`failover`]: a client wrapper that keeps exactly one member active
//! - [`single`]: one connection, publishers block until delivered or dropped
//! - [`balance`]: shared work/retry queue consumed by one worker per client
//! - [`mode`]: the facade selecting a strategy from the configured clients
//! - [`signal`]: one-shot delivery outcome handed back to the producer
//!
//! ```text
//!   producers ──publish──> ConnectionMode ──> Single ──> (Failover)Client ──> sink
//!                                        └──> LoadBalancer ──> worker N ──> Client ──> sink
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod attempts;
pub mod backoff;
pub mod balance;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod failover;
pub mod metrics;
pub mod mode;
pub mod retry;
pub mod signal;
pub mod single;
pub mod transport;

pub use attempts::Attempts;
pub use error::{ClientError, DeliveryError, ModeError, PublishError};
pub use event::Event;
pub use mode::{new_connection_mode, ClientSet, ConnectionMode, ModeSettings, PublishOptions};
pub use signal::{Outcome, SignalReceiver, Signaler};
