// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Telecom parental-control enforcement pipeline: consumes session
//! lifecycle events, resolves the subscriber's current policy, and
//! reactively installs, migrates, and tears down firewall rules on a
//! remote enforcement device.

pub mod clock;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod executor;
pub mod index;
pub mod model;
pub mod policy;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::EnforcerConfig;
use crate::consumer::{ConsumerConfig, DeadLetterSink, EventConsumer, EventSource};
use crate::dispatcher::Dispatcher;
use crate::executor::{CounterStore, Executor, HistoryStore, HttpRuleFacade, MappingStore};
use crate::index::SessionIndex;
use crate::policy::{PolicyResolver, PolicyStore};

/// Everything the composition root needs that is not constructed from
/// `config` alone: the externally-owned store backends. Kept as trait
/// objects so callers can plug in whatever durable table their
/// deployment uses; the in-memory implementations exist for local runs
/// and the test harness.
pub struct Stores {
    pub policy: Arc<dyn PolicyStore>,
    pub mapping: Arc<dyn MappingStore>,
    pub history: Arc<dyn HistoryStore>,
    pub counter: Arc<dyn CounterStore>,
}

/// Run the pipeline until `shutdown` fires, then drain in-flight work for
/// up to `shutdownGrace` before returning.
///
/// The event source and dead-letter sink are constructed by the caller
/// (they depend on the transport in use — NATS in production, in-memory
/// for tests) and handed in already connected, mirroring how `stores` are
/// externally owned.
///
/// Mirrors the teacher composition root: build the shared state, spawn
/// the background workers, serve the foreground loop, and let
/// `CancellationToken` fan out the shutdown signal.
pub async fn run(
    config: EnforcerConfig,
    stores: Stores,
    source: Arc<dyn EventSource>,
    dead_letter: Arc<dyn DeadLetterSink>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    config.validate().map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;

    let index = Arc::new(SessionIndex::new(config.index_shards, config.session_ttl()));
    let resolver = Arc::new(PolicyResolver::new(Arc::clone(&stores.policy), config.policy_cache_ttl()));
    let dispatcher = Arc::new(Dispatcher::new(config.dispatch_queue_cap, config.facade_max_retries));

    let facade = Arc::new(HttpRuleFacade::new(config.facade_url.clone(), config.facade_timeout()));
    facade.health().await.map_err(|e| anyhow::anyhow!("rule facade unreachable at startup: {e}"))?;

    let executor = Arc::new(Executor::new(
        Arc::clone(&facade),
        Arc::clone(&stores.mapping),
        Arc::clone(&stores.history),
        Arc::clone(&stores.counter),
        config.facade_max_inflight,
    ));

    let workers = dispatcher.spawn_workers(executor, config.dispatch_workers, shutdown.clone());

    let sweep = executor::spawn_reconciliation_sweep(
        facade,
        Arc::new(Arc::clone(&stores.mapping)),
        config.reconcile_interval(),
        config.verify_staleness(),
        config.reconcile_batch_size,
        shutdown.clone(),
    );

    let consumer = EventConsumer::new(
        source,
        Arc::clone(&index),
        resolver,
        Arc::clone(&dispatcher),
        dead_letter,
        ConsumerConfig {
            poll_timeout: std::time::Duration::from_secs(1),
            dispatch_backpressure_timeout: config.dispatch_backpressure_timeout(),
            retry_delay: std::time::Duration::from_millis(500),
        },
    );

    tracing::info!(workers = config.dispatch_workers, "enforcement pipeline started");
    consumer.run(shutdown.clone()).await;

    tracing::info!(grace = ?config.shutdown_grace(), "draining in-flight enforcement tasks");
    let drain = futures_util::future::join_all(workers);
    let _ = tokio::time::timeout(config.shutdown_grace(), drain).await;
    sweep.abort();

    Ok(())
}
