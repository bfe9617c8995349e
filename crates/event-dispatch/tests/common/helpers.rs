// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use super::mocks::{AsyncMockClient, MockClient};
use event_dispatch::backoff::{BackoffSettings, BackoffStrategy};
use event_dispatch::client::{AsyncProtocolClient, ProtocolClient};
use event_dispatch::{Attempts, ClientSet, Event, ModeSettings, Outcome, SignalReceiver};
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

/// Settings with short backoffs so retries finish quickly.
#[allow(dead_code)]
pub fn fast_settings(max_attempts: Attempts, load_balance: bool) -> ModeSettings {
    ModeSettings {
        max_attempts,
        timeout: Duration::from_secs(1),
        backoff: BackoffSettings {
            init: Duration::from_millis(5),
            max: Duration::from_millis(50),
            strategy: BackoffStrategy::Exponential,
        },
        load_balance,
    }
}

/// `n` distinguishable events.
#[allow(dead_code)]
pub fn events(n: usize) -> Vec<Event> {
    (0..n)
        .map(|i| Event::from_value(json!({"message": format!("event {i}"), "seq": i})).unwrap())
        .collect()
}

#[allow(dead_code)]
pub fn sync_set(clients: Vec<MockClient>) -> ClientSet {
    ClientSet::Sync(
        clients
            .into_iter()
            .map(|client| Box::new(client) as Box<dyn ProtocolClient>)
            .collect(),
    )
}

#[allow(dead_code)]
pub fn async_set(clients: Vec<AsyncMockClient>) -> ClientSet {
    ClientSet::Async(
        clients
            .into_iter()
            .map(|client| Box::new(client) as Box<dyn AsyncProtocolClient>)
            .collect(),
    )
}

/// Awaits every outcome, failing the test if any takes longer than `limit`.
#[allow(dead_code)]
pub async fn outcomes(receivers: Vec<SignalReceiver>, limit: Duration) -> Vec<Outcome> {
    let mut outcomes = Vec::with_capacity(receivers.len());
    for receiver in receivers {
        let outcome = timeout(limit, receiver.outcome())
            .await
            .expect("signal was not resolved in time");
        outcomes.push(outcome);
    }
    outcomes
}
