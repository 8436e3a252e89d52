// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end harness for the enforcement pipeline.
//!
//! Drives the real composition root (`enforcer_core::run`) against a
//! real HTTP rule facade bound to a loopback port and an in-memory event
//! source, then asserts on the resulting history/mapping/counter state.
//! There is no separate compiled binary to spawn here — the pipeline's
//! only externally observable surface is the facade it calls, so that is
//! what gets a genuine server; the composition root itself runs in
//! process exactly as `enforcer-cli`'s `main` would drive it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use enforcer_core::config::EnforcerConfig;
use enforcer_core::consumer::{InMemoryDeadLetterSink, InMemoryEventSource};
use enforcer_core::executor::{InMemoryCounterStore, InMemoryHistoryStore, InMemoryMappingStore};
use enforcer_core::model::{AppRule, Policy, PolicyStatus, PortRule, Protocol};
use enforcer_core::policy::InMemoryPolicyStore;
use enforcer_core::Stores;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FacadeState {
    next_id: AtomicU64,
    rules: Mutex<HashMap<String, String>>,
    block_failures_remaining: Mutex<u32>,
    block_calls: Mutex<u32>,
    update_calls: Mutex<u32>,
    delete_calls: Mutex<u32>,
}

/// A real, loopback-bound HTTP server implementing the rule-facade wire
/// contract, with hooks to script failure injection for the retry scenario.
pub struct FakeFacade {
    pub base_url: String,
    state: Arc<FacadeState>,
}

impl FakeFacade {
    pub async fn start() -> Self {
        let state = Arc::new(FacadeState::default());

        let app = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route("/api/v1/rules/block", post(create_block))
            .route("/api/v1/rules/{id}", put(update_block).delete(delete_block).get(verify_rule))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake facade");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve fake facade");
        });

        Self { base_url: format!("http://{addr}"), state }
    }

    /// The next `count` calls to `createBlock` fail with 503 before the
    /// facade starts succeeding (S4: transient failure then recovery).
    pub fn fail_next_block_calls(&self, count: u32) {
        *self.state.block_failures_remaining.lock().expect("lock") = count;
    }

    pub fn block_call_count(&self) -> u32 {
        *self.state.block_calls.lock().expect("lock")
    }

    pub fn update_call_count(&self) -> u32 {
        *self.state.update_calls.lock().expect("lock")
    }

    pub fn delete_call_count(&self) -> u32 {
        *self.state.delete_calls.lock().expect("lock")
    }

    pub fn rule_count(&self) -> usize {
        self.state.rules.lock().expect("lock").len()
    }
}

async fn create_block(State(state): State<Arc<FacadeState>>, Json(body): Json<serde_json::Value>) -> impl IntoResponse {
    *state.block_calls.lock().expect("lock") += 1;

    {
        let mut remaining = state.block_failures_remaining.lock().expect("lock");
        if *remaining > 0 {
            *remaining -= 1;
            return (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({"error": "facade overloaded"}))).into_response();
        }
    }

    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    let rule_id = format!("rule-{id}");
    let source_ip = body.get("sourceIP").and_then(|v| v.as_str()).unwrap_or_default().to_owned();
    state.rules.lock().expect("lock").insert(rule_id.clone(), source_ip);

    (StatusCode::CREATED, Json(serde_json::json!({"ruleId": rule_id, "ruleName": format!("block-{rule_id}")}))).into_response()
}

async fn update_block(
    State(state): State<Arc<FacadeState>>,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    *state.update_calls.lock().expect("lock") += 1;
    let mut rules = state.rules.lock().expect("lock");
    if !rules.contains_key(&id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let source_ip = body.get("newSourceIP").and_then(|v| v.as_str()).unwrap_or_default().to_owned();
    rules.insert(id.clone(), source_ip);
    (StatusCode::OK, Json(serde_json::json!({"ruleId": id}))).into_response()
}

async fn delete_block(State(state): State<Arc<FacadeState>>, AxumPath(id): AxumPath<String>) -> impl IntoResponse {
    *state.delete_calls.lock().expect("lock") += 1;
    state.rules.lock().expect("lock").remove(&id);
    StatusCode::NO_CONTENT
}

async fn verify_rule(State(state): State<Arc<FacadeState>>, AxumPath(id): AxumPath<String>) -> impl IntoResponse {
    if state.rules.lock().expect("lock").contains_key(&id) {
        (StatusCode::OK, Json(serde_json::json!({"status": "active"}))).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// A running instance of the real composition root, wired against a
/// [`FakeFacade`] and an in-memory event source/dead-letter sink.
pub struct Harness {
    pub facade: FakeFacade,
    pub source: Arc<InMemoryEventSource>,
    pub dead_letter: Arc<InMemoryDeadLetterSink>,
    pub policy_store: InMemoryPolicyStore,
    pub history_store: Arc<InMemoryHistoryStore>,
    pub mapping_store: Arc<InMemoryMappingStore>,
    pub counter_store: Arc<InMemoryCounterStore>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    pub async fn start(facade_max_retries: u32) -> Self {
        let facade = FakeFacade::start().await;
        let source = Arc::new(InMemoryEventSource::new());
        let dead_letter = Arc::new(InMemoryDeadLetterSink::new());
        let policy_store = InMemoryPolicyStore::new();
        let history_store = Arc::new(InMemoryHistoryStore::new());
        let mapping_store = Arc::new(InMemoryMappingStore::new());
        let counter_store = Arc::new(InMemoryCounterStore::new());

        let stores = Stores {
            policy: Arc::new(policy_store.clone()),
            mapping: Arc::clone(&mapping_store) as Arc<dyn enforcer_core::executor::MappingStore>,
            history: Arc::clone(&history_store) as Arc<dyn enforcer_core::executor::HistoryStore>,
            counter: Arc::clone(&counter_store) as Arc<dyn enforcer_core::executor::CounterStore>,
        };

        let config = EnforcerConfig {
            event_source_addr: "memory://test".to_owned(),
            event_source_topic: "session-events".to_owned(),
            consumer_group: "test".to_owned(),
            event_security: enforcer_core::config::EventSecurity::Plaintext,
            event_source_token: None,
            facade_url: facade.base_url.clone(),
            facade_timeout_secs: 5,
            facade_max_retries,
            facade_max_inflight: 8,
            index_shards: 4,
            session_ttl_secs: 3600,
            dispatch_workers: 2,
            dispatch_queue_cap: 1_000,
            dispatch_backpressure_timeout_secs: 2,
            policy_cache_ttl_secs: 30,
            reconcile_interval_secs: 3_600,
            verify_staleness_secs: 3_600,
            reconcile_batch_size: 200,
            shutdown_grace_secs: 2,
            log_level: "warn".to_owned(),
        };

        let shutdown = CancellationToken::new();

        let run_source = Arc::clone(&source) as Arc<dyn enforcer_core::consumer::EventSource>;
        let run_dead_letter = Arc::clone(&dead_letter) as Arc<dyn enforcer_core::consumer::DeadLetterSink>;
        let run_shutdown = shutdown.clone();
        let task = tokio::spawn(enforcer_core::run(config, stores, run_source, run_dead_letter, run_shutdown));

        Self { facade, source, dead_letter, policy_store, history_store, mapping_store, counter_store, shutdown, task }
    }

    pub fn put_policy(&self, phone_id: &str, app_names: &[&str]) -> tokio::task::JoinHandle<()> {
        let store = self.policy_store.clone();
        let policy = Policy {
            policy_id: "p1".to_owned(),
            subscriber_phone_id: phone_id.to_owned(),
            blocked_apps: app_names
                .iter()
                .map(|name| AppRule { app_name: (*name).to_owned(), ports: vec![PortRule { protocol: Protocol::Tcp, port: 443 }] })
                .collect(),
            time_windows: Vec::new(),
            status: PolicyStatus::Active,
        };
        tokio::spawn(async move { store.put(policy).await })
    }

    pub fn publish(&self, payload: Vec<u8>) {
        self.source.publish(payload);
    }

    /// Poll `check` until it returns `true` or `timeout` elapses, panicking
    /// on timeout with `what` in the message.
    pub async fn wait_until<F, Fut>(&self, what: &str, timeout: Duration, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check().await {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for: {what}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Cancel the pipeline and wait for it to drain.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

pub fn session_start_payload(phone_id: &str, subscriber_id: &str, session_id: &str, private_ip: &str, public_ip: &str) -> Vec<u8> {
    serde_json::json!({
        "eventType": "SESSION_START",
        "timestamp": "2026-07-27T10:00:00Z",
        "sessionId": session_id,
        "subscriberId": subscriber_id,
        "phoneId": phone_id,
        "privateIP": private_ip,
        "publicIP": public_ip,
    })
    .to_string()
    .into_bytes()
}

pub fn ip_change_payload(phone_id: &str, subscriber_id: &str, session_id: &str, old_private_ip: &str, new_private_ip: &str) -> Vec<u8> {
    serde_json::json!({
        "eventType": "IP_CHANGE",
        "timestamp": "2026-07-27T10:05:00Z",
        "sessionId": session_id,
        "subscriberId": subscriber_id,
        "phoneId": phone_id,
        "oldPrivateIP": old_private_ip,
        "newPrivateIP": new_private_ip,
        "oldPublicIP": "203.0.113.9",
        "newPublicIP": "203.0.113.9",
    })
    .to_string()
    .into_bytes()
}

pub fn session_end_payload(phone_id: &str, subscriber_id: &str, session_id: &str) -> Vec<u8> {
    serde_json::json!({
        "eventType": "SESSION_END",
        "timestamp": "2026-07-27T11:00:00Z",
        "sessionId": session_id,
        "subscriberId": subscriber_id,
        "phoneId": phone_id,
    })
    .to_string()
    .into_bytes()
}
