// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use super::memory::{InMemoryDeadLetterSink, InMemoryEventSource};
use super::*;
use crate::dispatcher::Dispatcher;
use crate::index::SessionIndex;
use crate::model::{AppRule, Policy, PolicyStatus, PortRule, Protocol};
use crate::policy::{InMemoryPolicyStore, PolicyResolver};

fn policy(phone_id: &str, app_name: &str) -> Policy {
    Policy {
        policy_id: "p1".to_owned(),
        subscriber_phone_id: phone_id.to_owned(),
        blocked_apps: vec![AppRule { app_name: app_name.to_owned(), ports: vec![PortRule { protocol: Protocol::Tcp, port: 443 }] }],
        time_windows: Vec::new(),
        status: PolicyStatus::Active,
    }
}

fn harness() -> (
    Arc<InMemoryEventSource>,
    Arc<InMemoryDeadLetterSink>,
    Arc<SessionIndex>,
    Arc<PolicyResolver<InMemoryPolicyStore>>,
    Arc<Dispatcher>,
    InMemoryPolicyStore,
) {
    let source = Arc::new(InMemoryEventSource::new());
    let dead_letter = Arc::new(InMemoryDeadLetterSink::new());
    let index = Arc::new(SessionIndex::new(4, chrono::Duration::hours(1)));
    let store = InMemoryPolicyStore::new();
    let resolver = Arc::new(PolicyResolver::new(store.clone(), Duration::from_secs(30)));
    let dispatcher = Arc::new(Dispatcher::new(10_000, 5));
    (source, dead_letter, index, resolver, dispatcher, store)
}

fn consumer(
    source: Arc<InMemoryEventSource>,
    dead_letter: Arc<InMemoryDeadLetterSink>,
    index: Arc<SessionIndex>,
    resolver: Arc<PolicyResolver<InMemoryPolicyStore>>,
    dispatcher: Arc<Dispatcher>,
) -> EventConsumer<Arc<InMemoryEventSource>, InMemoryPolicyStore, Arc<InMemoryDeadLetterSink>> {
    EventConsumer::new(source, index, resolver, dispatcher, dead_letter, ConsumerConfig::default())
}

fn session_start_payload(phone_id: &str, private_ip: &str) -> Vec<u8> {
    serde_json::json!({
        "eventType": "SESSION_START",
        "timestamp": "2026-07-27T10:00:00Z",
        "sessionId": "sess-1",
        "subscriberId": "sub-1",
        "phoneId": phone_id,
        "privateIP": private_ip,
        "publicIP": "203.0.113.9",
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn session_start_enqueues_install_when_policy_exists() {
    let (source, dead_letter, index, resolver, dispatcher, store) = harness();
    store.put(policy("+1555", "tiktok")).await;
    let consumer = consumer(source.clone(), dead_letter, index.clone(), resolver, dispatcher.clone());

    let (handle, payload) = (String::from("h1"), session_start_payload("+1555", "10.0.0.5"));
    assert!(consumer.handle_one(handle, payload).await);

    assert_eq!(dispatcher.depth().await, 1);
    assert!(index.lookup_by_phone("+1555").await.is_some());
}

#[tokio::test]
async fn session_start_with_no_policy_does_not_enqueue() {
    let (source, dead_letter, index, resolver, dispatcher, _store) = harness();
    let consumer = consumer(source.clone(), dead_letter, index, resolver, dispatcher.clone());

    let payload = session_start_payload("+1555", "10.0.0.5");
    assert!(consumer.handle_one("h1".to_owned(), payload).await);

    assert_eq!(dispatcher.depth().await, 0);
}

#[tokio::test]
async fn ip_change_enqueues_migrate_with_old_and_new_addresses() {
    let (source, dead_letter, index, resolver, dispatcher, store) = harness();
    store.put(policy("+1555", "tiktok")).await;
    let consumer = consumer(source.clone(), dead_letter, index.clone(), resolver, dispatcher.clone());

    consumer.handle_one("h1".to_owned(), session_start_payload("+1555", "10.0.0.5")).await;

    let ip_change = serde_json::json!({
        "eventType": "IP_CHANGE",
        "timestamp": "2026-07-27T10:05:00Z",
        "sessionId": "sess-1",
        "subscriberId": "sub-1",
        "phoneId": "+1555",
        "oldPrivateIP": "10.0.0.5",
        "newPrivateIP": "10.0.0.9",
        "oldPublicIP": "203.0.113.9",
        "newPublicIP": "203.0.113.9",
    })
    .to_string()
    .into_bytes();
    assert!(consumer.handle_one("h2".to_owned(), ip_change).await);

    assert_eq!(dispatcher.depth().await, 2);
    let session = index.lookup_by_phone("+1555").await.expect("session");
    assert_eq!(session.private_address.to_string(), "10.0.0.9");
}

#[tokio::test]
async fn ip_change_with_no_active_session_falls_back_to_install() {
    let (source, dead_letter, index, resolver, dispatcher, store) = harness();
    store.put(policy("+1555", "tiktok")).await;
    let consumer = consumer(source, dead_letter, index.clone(), resolver, dispatcher.clone());

    let ip_change = serde_json::json!({
        "eventType": "IP_CHANGE",
        "timestamp": "2026-07-27T10:05:00Z",
        "sessionId": "sess-1",
        "subscriberId": "sub-1",
        "phoneId": "+1555",
        "oldPrivateIP": "10.0.0.5",
        "newPrivateIP": "10.0.0.9",
        "oldPublicIP": "203.0.113.9",
        "newPublicIP": "203.0.113.9",
    })
    .to_string()
    .into_bytes();

    // A mid-session consumer restart loses the Session Index's state; the
    // IP_CHANGE must still install against the new address rather than
    // be silently dropped.
    assert!(consumer.handle_one("h1".to_owned(), ip_change).await);
    assert_eq!(dispatcher.depth().await, 1);
    assert!(index.lookup_by_phone("+1555").await.is_none());
}

#[tokio::test]
async fn session_end_enqueues_remove() {
    let (source, dead_letter, index, resolver, dispatcher, store) = harness();
    store.put(policy("+1555", "tiktok")).await;
    let consumer = consumer(source, dead_letter, index, resolver, dispatcher.clone());

    consumer.handle_one("h1".to_owned(), session_start_payload("+1555", "10.0.0.5")).await;

    let session_end = serde_json::json!({
        "eventType": "SESSION_END",
        "timestamp": "2026-07-27T11:00:00Z",
        "sessionId": "sess-1",
        "subscriberId": "sub-1",
        "phoneId": "+1555",
    })
    .to_string()
    .into_bytes();
    assert!(consumer.handle_one("h2".to_owned(), session_end).await);

    assert_eq!(dispatcher.depth().await, 2);
}

#[tokio::test]
async fn malformed_payload_is_dead_lettered_and_committed() {
    let (source, dead_letter, index, resolver, dispatcher, _store) = harness();
    let consumer = consumer(source.clone(), dead_letter.clone(), index, resolver, dispatcher.clone());

    let bad = serde_json::json!({
        "eventType": "SESSION_START",
        "timestamp": "2026-07-27T10:00:00Z",
        "sessionId": "sess-1",
        "subscriberId": "sub-1",
        "phoneId": "",
        "privateIP": "10.0.0.5",
        "publicIP": "203.0.113.9",
    })
    .to_string()
    .into_bytes();

    assert!(!consumer.handle_one("h1".to_owned(), bad).await);
    assert_eq!(dead_letter.entries().len(), 1);
    assert_eq!(dispatcher.depth().await, 0);
}

#[tokio::test]
async fn backpressure_timeout_surfaces_as_retryable_and_is_not_committed() {
    let source = Arc::new(InMemoryEventSource::new());
    let dead_letter = Arc::new(InMemoryDeadLetterSink::new());
    let index = Arc::new(SessionIndex::new(4, chrono::Duration::hours(1)));
    let store = InMemoryPolicyStore::new();
    store.put(policy("+1555", "tiktok")).await;
    let resolver = Arc::new(PolicyResolver::new(store, Duration::from_secs(30)));
    // Queue depth 0 forces every enqueue to wait for back-pressure.
    let dispatcher = Arc::new(Dispatcher::new(0, 5));
    let mut config = ConsumerConfig::default();
    config.dispatch_backpressure_timeout = Duration::from_millis(20);
    let consumer = EventConsumer::new(source, index, resolver, dispatcher, dead_letter.clone(), config);

    let ok = consumer.handle_one("h1".to_owned(), session_start_payload("+1555", "10.0.0.5")).await;
    assert!(!ok, "back-pressure timeout must not be treated as success");
    assert!(dead_letter.entries().is_empty(), "a retryable failure is not a poison message");
}
