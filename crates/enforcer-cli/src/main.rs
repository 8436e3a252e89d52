// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use enforcer_core::config::{EnforcerConfig, EventSecurity};
use enforcer_core::consumer::{NatsDeadLetterSink, NatsEventSource, NatsSourceConfig};
use enforcer_core::executor::{InMemoryCounterStore, InMemoryHistoryStore, InMemoryMappingStore};
use enforcer_core::policy::InMemoryPolicyStore;
use enforcer_core::Stores;

#[tokio::main]
async fn main() {
    let config = EnforcerConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = config.validate() {
        error!("configuration error: {e}");
        std::process::exit(2);
    }

    // The store backends are externally owned; the in-memory
    // implementations here are the local-run/demo default until a
    // deployment wires in its own durable tables.
    let stores = Stores {
        policy: Arc::new(InMemoryPolicyStore::new()),
        mapping: Arc::new(InMemoryMappingStore::new()),
        history: Arc::new(InMemoryHistoryStore::new()),
        counter: Arc::new(InMemoryCounterStore::new()),
    };

    let shutdown = CancellationToken::new();

    let source_config = NatsSourceConfig {
        url: config.event_source_addr.clone(),
        token: config.event_source_token.clone(),
        subject: config.event_source_topic.clone(),
        dead_letter_subject: format!("{}.dead-letter", config.event_source_topic),
    };
    if config.event_security != EventSecurity::Plaintext {
        tracing::info!(security = ?config.event_security, "connecting to event source with authentication");
    }

    let source = match NatsEventSource::connect(&source_config, shutdown.clone()).await {
        Ok(source) => source,
        Err(e) => {
            error!("event source unreachable at startup: {e:#}");
            std::process::exit(1);
        }
    };

    let dead_letter_opts = match &config.event_source_token {
        Some(token) => async_nats::ConnectOptions::with_token(token.clone()),
        None => async_nats::ConnectOptions::new(),
    };
    let dead_letter_client = match dead_letter_opts.connect(&config.event_source_addr).await {
        Ok(client) => client,
        Err(e) => {
            error!("dead-letter sink unreachable at startup: {e}");
            std::process::exit(1);
        }
    };
    let dead_letter = Arc::new(NatsDeadLetterSink::new(dead_letter_client, source_config.dead_letter_subject));

    let shutdown_on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown_on_signal.cancel();
        }
    });

    if let Err(e) = enforcer_core::run(config, stores, source, dead_letter, shutdown).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
