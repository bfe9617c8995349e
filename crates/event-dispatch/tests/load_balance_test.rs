// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::helpers::{async_set, events, fast_settings, outcomes};
use common::mocks::{AsyncMockClient, ConnectBehavior, MockClient, Step};
use event_dispatch::balance::LoadBalancerMode;
use event_dispatch::client::ProtocolClient;
use event_dispatch::metrics::AtomicMetrics;
use event_dispatch::{
    new_connection_mode, Attempts, ClientError, ConnectionMode, DeliveryError, Outcome,
    PublishOptions, Signaler,
};
use std::sync::Arc;
use std::time::Duration;

const LIMIT: Duration = Duration::from_secs(30);

fn load_balancer(clients: Vec<MockClient>, max_attempts: Attempts) -> (LoadBalancerMode, Arc<AtomicMetrics>) {
    let metrics = Arc::new(AtomicMetrics::new());
    let clients = clients
        .into_iter()
        .map(|client| Box::new(client) as Box<dyn ProtocolClient>)
        .collect();
    let mode = LoadBalancerMode::new(clients, fast_settings(max_attempts, true), metrics.clone())
        .expect("load balancer should start");
    (mode, metrics)
}

#[tokio::test(start_paused = true)]
async fn test_non_temporary_failures_exhaust_budget() {
    let client = MockClient::failing(ClientError::Publish("broken pipe".to_string()));
    let stats = client.stats();
    let (mode, metrics) = load_balancer(vec![client], Attempts::Limited(3));

    let (signaler, receiver) = Signaler::channel();
    mode.publish_events(signaler, PublishOptions::default(), events(4))
        .await
        .unwrap();

    let outcome = outcomes(vec![receiver], LIMIT).await.remove(0);
    assert_eq!(
        outcome,
        Outcome::Failed(DeliveryError::AttemptsExhausted {
            attempts: 3,
            last_error: "publish failed: broken pipe".to_string(),
        })
    );
    assert_eq!(stats.publish_calls(), 3);
    assert_eq!(metrics.dropped(), 1);
    mode.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_partial_progress_is_never_dropped() {
    let client = MockClient::scripted(Vec::new(), Step::AcceptSome(1));
    let stats = client.stats();
    let (mode, metrics) = load_balancer(vec![client], Attempts::Limited(3));
    let batch = events(10);

    let (signaler, receiver) = Signaler::channel();
    mode.publish_events(signaler, PublishOptions::default(), batch.clone())
        .await
        .unwrap();

    assert_eq!(outcomes(vec![receiver], LIMIT).await, vec![Outcome::Completed]);
    assert!(stats.publish_calls() >= 10);
    assert_eq!(stats.delivered(), batch);
    assert_eq!(stats.connects(), 1);
    assert_eq!(metrics.dropped(), 0);
    assert_eq!(metrics.published(), 10);
    mode.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_requests_move_to_healthy_client() {
    let healthy = MockClient::healthy();
    let flaky = MockClient::failing(ClientError::Publish("connection reset".to_string()))
        .with_connect(ConnectBehavior::Once);
    let healthy_stats = healthy.stats();
    let flaky_stats = flaky.stats();
    let (mode, metrics) = load_balancer(vec![flaky, healthy], Attempts::Limited(3));

    let mut receivers = Vec::new();
    for event in events(10) {
        let (signaler, receiver) = Signaler::channel();
        mode.publish_event(signaler, PublishOptions::default(), event)
            .await
            .unwrap();
        receivers.push(receiver);
    }

    let outcomes = outcomes(receivers, LIMIT).await;
    assert!(outcomes.iter().all(Outcome::is_completed), "{outcomes:?}");
    assert_eq!(healthy_stats.delivered_count(), 10);
    assert_eq!(flaky_stats.delivered_count(), 0);
    assert_eq!(metrics.dropped(), 0);
    mode.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_guaranteed_publish_outlasts_budget() {
    let failures = vec![Step::Fail(ClientError::Publish("unavailable".to_string())); 6];
    let client = MockClient::scripted(failures, Step::Accept);
    let stats = client.stats();
    let (mode, metrics) = load_balancer(vec![client], Attempts::Limited(1));

    let (signaler, receiver) = Signaler::channel();
    mode.publish_events(signaler, PublishOptions::guaranteed(), events(2))
        .await
        .unwrap();

    assert_eq!(outcomes(vec![receiver], LIMIT).await, vec![Outcome::Completed]);
    assert_eq!(stats.publish_calls(), 7);
    assert_eq!(metrics.dropped(), 0);
    mode.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_async_clients_deliver_everything() {
    let clients = vec![
        AsyncMockClient::new(MockClient::healthy()),
        AsyncMockClient::new(MockClient::scripted(Vec::new(), Step::AcceptSome(3))),
    ];
    let stats: Vec<_> = clients.iter().map(AsyncMockClient::stats).collect();
    let metrics = Arc::new(AtomicMetrics::new());
    let mode = new_connection_mode(
        async_set(clients),
        fast_settings(Attempts::Limited(2), true),
        metrics.clone(),
    )
    .unwrap();
    assert_eq!(mode.name(), "load_balance");

    let mut receivers = Vec::new();
    for _ in 0..5 {
        let (signaler, receiver) = Signaler::channel();
        mode.publish_events(signaler, PublishOptions::default(), events(10))
            .await
            .unwrap();
        receivers.push(receiver);
    }

    let outcomes = outcomes(receivers, LIMIT).await;
    assert!(outcomes.iter().all(Outcome::is_completed), "{outcomes:?}");
    let delivered: usize = stats.iter().map(|s| s.delivered_count()).sum();
    assert_eq!(delivered, 50);
    assert_eq!(metrics.published(), 50);
    assert_eq!(metrics.dropped(), 0);
    mode.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_async_failover_switches_member() {
    let unreachable = MockClient::healthy().with_connect(ConnectBehavior::Never);
    let clients = vec![
        AsyncMockClient::new(unreachable),
        AsyncMockClient::new(MockClient::healthy()),
    ];
    let stats: Vec<_> = clients.iter().map(AsyncMockClient::stats).collect();
    let mode = new_connection_mode(
        async_set(clients),
        fast_settings(Attempts::Limited(3), false),
        Arc::new(AtomicMetrics::new()),
    )
    .unwrap();

    let (signaler, receiver) = Signaler::channel();
    mode.publish_event(signaler, PublishOptions::default(), events(1).remove(0))
        .await
        .unwrap();

    assert_eq!(outcomes(vec![receiver], LIMIT).await, vec![Outcome::Completed]);
    assert_eq!(stats[0].connects(), 1);
    assert_eq!(stats[1].delivered_count(), 1);
    mode.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_async_worker_reconnects_before_retrying() {
    let reset = Step::Fail(ClientError::Publish("reset".to_string()));
    let client = AsyncMockClient::new(
        MockClient::scripted(vec![reset], Step::Accept).disconnect_on_failure(),
    );
    let stats = client.stats();
    let metrics = Arc::new(AtomicMetrics::new());
    let mode = new_connection_mode(
        async_set(vec![client]),
        fast_settings(Attempts::Limited(2), true),
        metrics.clone(),
    )
    .unwrap();
    let batch = events(2);

    let (signaler, receiver) = Signaler::channel();
    mode.publish_events(signaler, PublishOptions::default(), batch.clone())
        .await
        .unwrap();

    assert_eq!(outcomes(vec![receiver], LIMIT).await, vec![Outcome::Completed]);
    assert_eq!(stats.connects(), 2);
    assert_eq!(stats.publish_calls(), 2);
    assert_eq!(stats.delivered(), batch);
    assert_eq!(metrics.dropped(), 0);
    mode.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_async_failures_exhaust_budget() {
    let client = AsyncMockClient::new(MockClient::failing(ClientError::Publish(
        "rejected".to_string(),
    )));
    let stats = client.stats();
    let metrics = Arc::new(AtomicMetrics::new());
    let mode = new_connection_mode(
        async_set(vec![client]),
        fast_settings(Attempts::Limited(2), true),
        metrics.clone(),
    )
    .unwrap();

    let (signaler, receiver) = Signaler::channel();
    mode.publish_events(signaler, PublishOptions::default(), events(3))
        .await
        .unwrap();

    let outcome = outcomes(vec![receiver], LIMIT).await.remove(0);
    assert!(
        matches!(
            outcome,
            Outcome::Failed(DeliveryError::AttemptsExhausted { attempts: 2, .. })
        ),
        "{outcome:?}"
    );
    assert_eq!(stats.publish_calls(), 2);
    assert_eq!(metrics.dropped(), 1);
    mode.close().await.unwrap();
}
