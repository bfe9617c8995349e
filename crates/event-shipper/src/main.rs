// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};
use tokio::io::{stdin, AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use event_dispatch::{
    client::ProtocolClient,
    config::OutputConfig,
    metrics::AtomicMetrics,
    mode::make_clients,
    new_connection_mode,
    transport::LineClient,
    ClientSet, ConnectionMode, Event, Outcome, PublishOptions, Signaler,
};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct ShipStats {
    acked: usize,
    failed: usize,
    skipped: usize,
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var("SHIPPER_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match OutputConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading output configuration: {e}");
            return;
        }
    };

    let clients = match make_clients(&config.hosts, config.worker, |host| {
        Ok(Box::new(LineClient::new(host)) as Box<dyn ProtocolClient>)
    }) {
        Ok(clients) => clients,
        Err(e) => {
            error!("Error creating clients: {e}");
            return;
        }
    };

    let metrics = Arc::new(AtomicMetrics::new());
    let mode: Arc<dyn ConnectionMode> = match new_connection_mode(
        ClientSet::Sync(clients),
        config.mode_settings(),
        metrics.clone(),
    ) {
        Ok(mode) => Arc::from(mode),
        Err(e) => {
            error!("Error creating connection mode: {e}");
            return;
        }
    };
    info!(
        mode = mode.name(),
        hosts = config.hosts.len(),
        workers_per_host = config.worker,
        max_attempts = %config.max_attempts(),
        "event shipper started"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => error!("Unable to listen for shutdown signal: {e}"),
            }
        }
    });

    tokio::select! {
        biased;
        _ = shutdown.cancelled() => info!("Interrupted, closing output"),
        result = ship(mode.as_ref(), config.bulk_max_size) => match result {
            Ok(stats) => info!(
                acked = stats.acked,
                failed = stats.failed,
                skipped = stats.skipped,
                "Input exhausted"
            ),
            Err(e) => error!("Error reading events from stdin: {e}"),
        },
    }

    if let Err(e) = mode.close().await {
        error!("Error closing output: {e}");
    }
    info!(
        published = metrics.published(),
        dropped = metrics.dropped(),
        "event shipper stopped"
    );
}

/// Reads newline-delimited JSON events from stdin and publishes them in
/// batches, waiting for each batch to be acknowledged before reading on.
async fn ship(mode: &dyn ConnectionMode, bulk_max_size: usize) -> std::io::Result<ShipStats> {
    let mut stats = ShipStats::default();
    let mut lines = BufReader::new(stdin()).lines();
    let mut batch = Vec::with_capacity(bulk_max_size);

    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            None => continue,
            Some(Ok(event)) => batch.push(event),
            Some(Err(e)) => {
                warn!("Skipping malformed event: {e}");
                stats.skipped += 1;
            }
        }
        if batch.len() >= bulk_max_size {
            publish_batch(mode, std::mem::take(&mut batch), &mut stats).await;
        }
    }
    if !batch.is_empty() {
        publish_batch(mode, batch, &mut stats).await;
    }
    Ok(stats)
}

async fn publish_batch(mode: &dyn ConnectionMode, batch: Vec<Event>, stats: &mut ShipStats) {
    let size = batch.len();
    let (signaler, receiver) = Signaler::channel();
    if let Err(e) = mode
        .publish_events(signaler, PublishOptions::default(), batch)
        .await
    {
        error!("Error publishing batch of {size} events: {e}");
        stats.failed += size;
        return;
    }
    match receiver.outcome().await {
        Outcome::Completed => {
            debug!(events = size, "Batch acknowledged");
            stats.acked += size;
        }
        Outcome::Failed(reason) => {
            warn!(events = size, "Batch not delivered: {reason}");
            stats.failed += size;
        }
    }
}

/// `None` for blank lines.
fn parse_line(line: &str) -> Option<Result<Event, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_str::<Event>(line))
}
