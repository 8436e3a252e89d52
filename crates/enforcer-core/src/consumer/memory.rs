// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process [`EventSource`]/[`DeadLetterSink`] implementations for tests
//! and local runs, emulating visibility-timeout semantics without a
//! real broker.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DeadLetterSink, EventHandle, EventSource};

struct Inflight {
    handle: EventHandle,
    payload: Vec<u8>,
    visible_at: std::time::Instant,
}

/// A FIFO of pending messages plus an in-flight set of polled-but-not-
/// yet-committed ones, each hidden until its visibility deadline.
pub struct InMemoryEventSource {
    queue: Mutex<VecDeque<Inflight>>,
    next_id: Mutex<u64>,
}

impl InMemoryEventSource {
    pub fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), next_id: Mutex::new(0) }
    }

    /// Publish a raw payload, immediately visible.
    pub fn publish(&self, payload: Vec<u8>) {
        let mut next_id = self.next_id.lock();
        let handle = next_id.to_string();
        *next_id += 1;
        self.queue.lock().push_back(Inflight { handle, payload, visible_at: std::time::Instant::now() });
    }
}

impl Default for InMemoryEventSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSource for InMemoryEventSource {
    async fn poll(&self, timeout: Duration) -> Option<(EventHandle, Vec<u8>)> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            {
                let mut queue = self.queue.lock();
                let now = std::time::Instant::now();
                // Hide until nack/commit resolves it — a long window so a
                // caller that forgets to ack never silently redelivers
                // mid-test.
                let due = queue.iter().position(|m| m.visible_at <= now).and_then(|pos| queue.remove(pos));
                if let Some(msg) = due {
                    let handle = msg.handle.clone();
                    let payload = msg.payload.clone();
                    queue.push_back(Inflight {
                        handle: msg.handle,
                        payload: msg.payload,
                        visible_at: now + Duration::from_secs(3600),
                    });
                    return Some((handle, payload));
                }
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn commit(&self, handle: EventHandle) {
        self.queue.lock().retain(|m| m.handle != handle);
    }

    async fn nack(&self, handle: EventHandle, delay: Duration) {
        let mut queue = self.queue.lock();
        if let Some(msg) = queue.iter_mut().find(|m| m.handle == handle) {
            msg.visible_at = std::time::Instant::now() + delay;
        }
    }
}

/// Collects dead-lettered payloads for test assertions.
#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    entries: Mutex<Vec<(Vec<u8>, String)>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(Vec<u8>, String)> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn send(&self, payload: Vec<u8>, reason: String) {
        self.entries.lock().push((payload, reason));
    }
}
