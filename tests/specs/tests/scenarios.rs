// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use enforcer_core::executor::MappingStore;
use enforcer_specs::{ip_change_payload, session_end_payload, session_start_payload, Harness};

#[tokio::test]
async fn s1_basic_install() {
    let harness = Harness::start(5).await;
    harness.put_policy("+15551234567", &["tiktok"]).await.expect("put policy");

    harness.publish(session_start_payload("+15551234567", "sub-1", "sess-1", "10.0.0.5", "203.0.113.9"));

    harness
        .wait_until("one mapping after install", Duration::from_secs(2), || async {
            harness.mapping_store.list("+15551234567").await.map(|m| m.len()).unwrap_or(0) == 1
        })
        .await;

    assert_eq!(harness.facade.block_call_count(), 1);
    let mappings = harness.mapping_store.list("+15551234567").await.expect("list");
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].address.to_string(), "10.0.0.5");

    let history = harness.history_store.all().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, enforcer_core::model::HistoryStatus::Success);
    assert_eq!(history[0].action, enforcer_core::model::HistoryAction::Block);

    let today = today_string();
    let counter = harness.counter_store.get("+15551234567", &today, "tiktok").await;
    assert_eq!(counter.count, 1);

    harness.stop().await;
}

#[tokio::test]
async fn s2_migration_preserves_ordering() {
    let harness = Harness::start(5).await;
    harness.put_policy("+15551234567", &["tiktok"]).await.expect("put policy");

    harness.publish(session_start_payload("+15551234567", "sub-1", "sess-1", "10.0.0.5", "203.0.113.9"));
    harness
        .wait_until("install before migrate", Duration::from_secs(2), || async {
            harness.mapping_store.list("+15551234567").await.map(|m| m.len()).unwrap_or(0) == 1
        })
        .await;

    harness.publish(ip_change_payload("+15551234567", "sub-1", "sess-1", "10.0.0.5", "10.0.0.9"));
    harness
        .wait_until("mapping address updated", Duration::from_secs(2), || async {
            let mappings = harness.mapping_store.list("+15551234567").await.unwrap_or_default();
            mappings.first().map(|m| m.address.to_string()) == Some("10.0.0.9".to_owned())
        })
        .await;

    assert_eq!(harness.facade.block_call_count(), 1, "migration must not re-create the rule");
    assert_eq!(harness.facade.update_call_count(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn s3_teardown() {
    let harness = Harness::start(5).await;
    harness.put_policy("+15551234567", &["tiktok"]).await.expect("put policy");

    harness.publish(session_start_payload("+15551234567", "sub-1", "sess-1", "10.0.0.5", "203.0.113.9"));
    harness
        .wait_until("install before teardown", Duration::from_secs(2), || async {
            harness.mapping_store.list("+15551234567").await.map(|m| m.len()).unwrap_or(0) == 1
        })
        .await;

    harness.publish(ip_change_payload("+15551234567", "sub-1", "sess-1", "10.0.0.5", "10.0.0.9"));
    harness.wait_until("migrate before teardown", Duration::from_secs(2), || async { harness.facade.update_call_count() == 1 }).await;

    harness.publish(session_end_payload("+15551234567", "sub-1", "sess-1"));
    harness.wait_until("teardown removes the mapping", Duration::from_secs(2), || async { harness.facade.delete_call_count() == 1 }).await;

    assert_eq!(harness.mapping_store.list("+15551234567").await.expect("list").len(), 0);
    let history = harness.history_store.all().await;
    let unblocks = history.iter().filter(|r| r.action == enforcer_core::model::HistoryAction::Unblock).count();
    assert_eq!(unblocks, 1);
    assert!(history
        .iter()
        .any(|r| r.action == enforcer_core::model::HistoryAction::Unblock && r.status == enforcer_core::model::HistoryStatus::Success));

    harness.stop().await;
}

#[tokio::test]
async fn s4_transient_failure_then_retry_succeeds() {
    let harness = Harness::start(5).await;
    harness.put_policy("+15551234567", &["tiktok"]).await.expect("put policy");
    harness.facade.fail_next_block_calls(2);

    harness.publish(session_start_payload("+15551234567", "sub-1", "sess-1", "10.0.0.5", "203.0.113.9"));

    // Backoff for attempts 0 and 1 is 1s and 2s: allow generous slack.
    harness
        .wait_until("eventual success after retries", Duration::from_secs(10), || async {
            harness.mapping_store.list("+15551234567").await.map(|m| m.len()).unwrap_or(0) == 1
        })
        .await;

    let history = harness.history_store.all().await;
    let failed = history.iter().filter(|r| r.status == enforcer_core::model::HistoryStatus::Failed).count();
    let succeeded = history.iter().filter(|r| r.status == enforcer_core::model::HistoryStatus::Success).count();
    assert_eq!(failed, 2);
    assert_eq!(succeeded, 1);

    let today = today_string();
    let counter = harness.counter_store.get("+15551234567", &today, "tiktok").await;
    assert_eq!(counter.count, 1, "a retried task must only increment the counter once, on its eventual success");

    harness.stop().await;
}

#[tokio::test]
async fn s5_concurrency_across_subscribers_is_bounded() {
    let harness = Harness::start(5).await;

    for i in 0..100 {
        let phone_id = format!("+1555{i:07}");
        harness.put_policy(&phone_id, &["tiktok"]).await.expect("put policy");
    }
    for i in 0..100 {
        let phone_id = format!("+1555{i:07}");
        harness.publish(session_start_payload(&phone_id, &format!("sub-{i}"), &format!("sess-{i}"), "10.0.0.5", "203.0.113.9"));
    }

    harness.wait_until("all 100 subscribers installed", Duration::from_secs(10), || async { harness.facade.block_call_count() == 100 }).await;

    assert_eq!(harness.facade.rule_count(), 100);

    harness.stop().await;
}

#[tokio::test]
async fn s6_poison_message_is_dead_lettered() {
    let harness = Harness::start(5).await;
    harness.put_policy("+15551234567", &["tiktok"]).await.expect("put policy");

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
    harness.publish(bad);

    harness.wait_until("poison message dead-lettered", Duration::from_secs(2), || async { !harness.dead_letter.entries().is_empty() }).await;
    assert_eq!(harness.dead_letter.entries().len(), 1);
    assert_eq!(harness.facade.block_call_count(), 0);

    // The pipeline keeps running after a poison message.
    harness.publish(session_start_payload("+15551234567", "sub-1", "sess-1", "10.0.0.5", "203.0.113.9"));
    harness.wait_until("pipeline continues after poison message", Duration::from_secs(2), || async { harness.facade.block_call_count() == 1 }).await;

    harness.stop().await;
}

fn today_string() -> String {
    use chrono::Datelike;
    let now = chrono::Utc::now();
    format!("{:04}-{:02}-{:02}", now.year(), now.month(), now.day())
}
