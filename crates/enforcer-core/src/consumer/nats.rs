// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! NATS-backed [`EventSource`].
//!
//! NATS core pub/sub has no broker-side visibility timeout or ack/nack —
//! unlike SQS, a delivered message is gone the instant `next()` returns it.
//! To keep the same `poll`/`commit`/`nack` contract the rest of the
//! consumer is built against, delivered messages are buffered locally and
//! `nack` re-queues them after `delay` instead of asking the broker to
//! redeliver. This means an in-flight message is lost on process crash —
//! acceptable per the design notes, since the event source is not the
//! system of record for retry state.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;

use super::{DeadLetterSink, EventHandle, EventSource};

/// Connection settings for the session-event NATS subject.
pub struct NatsSourceConfig {
    pub url: String,
    pub token: Option<String>,
    pub subject: String,
    /// Subject dead-lettered payloads are republished to.
    pub dead_letter_subject: String,
}

struct Buffered {
    handle: EventHandle,
    payload: Vec<u8>,
    visible_at: std::time::Instant,
}

/// Subscribes to `config.subject` and buffers deliveries locally so the
/// Consumer can drive it with `poll`/`commit`/`nack` like any other source.
pub struct NatsEventSource {
    client: async_nats::Client,
    buffer: Mutex<VecDeque<Buffered>>,
    next_id: Mutex<u64>,
}

impl NatsEventSource {
    pub async fn connect(config: &NatsSourceConfig, cancel: tokio_util::sync::CancellationToken) -> anyhow::Result<std::sync::Arc<Self>> {
        let opts = match &config.token {
            Some(token) => async_nats::ConnectOptions::with_token(token.clone()),
            None => async_nats::ConnectOptions::new(),
        };
        let client = opts.connect(&config.url).await?;
        let mut sub = client.subscribe(config.subject.clone()).await?;

        let source = std::sync::Arc::new(Self {
            client: client.clone(),
            buffer: Mutex::new(VecDeque::new()),
            next_id: Mutex::new(0),
        });

        let forward_target = std::sync::Arc::clone(&source);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = sub.next() => {
                        let Some(msg) = msg else { break };
                        forward_target.push(msg.payload.to_vec());
                    }
                }
            }
        });

        Ok(source)
    }

    fn push(&self, payload: Vec<u8>) {
        let mut next_id = self.next_id.lock();
        let handle = next_id.to_string();
        *next_id += 1;
        self.buffer.lock().push_back(Buffered { handle, payload, visible_at: std::time::Instant::now() });
    }
}

#[async_trait]
impl EventSource for NatsEventSource {
    async fn poll(&self, timeout: Duration) -> Option<(EventHandle, Vec<u8>)> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            {
                let mut buffer = self.buffer.lock();
                let now = std::time::Instant::now();
                let due = buffer.iter().position(|m| m.visible_at <= now).and_then(|pos| buffer.remove(pos));
                if let Some(msg) = due {
                    let handle = msg.handle.clone();
                    let payload = msg.payload.clone();
                    buffer.push_back(Buffered { handle: msg.handle, payload: msg.payload, visible_at: now + Duration::from_secs(3600) });
                    return Some((handle, payload));
                }
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn commit(&self, handle: EventHandle) {
        self.buffer.lock().retain(|m| m.handle != handle);
    }

    async fn nack(&self, handle: EventHandle, delay: Duration) {
        let mut buffer = self.buffer.lock();
        if let Some(msg) = buffer.iter_mut().find(|m| m.handle == handle) {
            msg.visible_at = std::time::Instant::now() + delay;
        }
    }
}

/// Dead-letters by republishing the payload (tagged with `reason` in a
/// header) to a fixed subject for an offline consumer to drain.
pub struct NatsDeadLetterSink {
    client: async_nats::Client,
    subject: String,
}

impl NatsDeadLetterSink {
    pub fn new(client: async_nats::Client, subject: String) -> Self {
        Self { client, subject }
    }
}

#[async_trait]
impl DeadLetterSink for NatsDeadLetterSink {
    async fn send(&self, payload: Vec<u8>, reason: String) {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("X-Dead-Letter-Reason", reason.as_str());
        if let Err(err) = self.client.publish_with_headers(self.subject.clone(), headers, payload.into()).await {
            tracing::error!(err = %err, subject = %self.subject, "failed to publish dead-lettered event");
        }
    }
}
