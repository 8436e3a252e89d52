// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event Consumer (§4.B): pulls session events, decodes the envelope,
//! routes to the Session Index and Policy Resolver, and enqueues
//! enforcement tasks on the Dispatcher — committing only once the event
//! is durably reflected in the pipeline.

pub mod memory;
pub mod nats;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::error::PipelineError;
use crate::event::{self, SessionEvent};
use crate::index::SessionIndex;
use crate::model::{EnforcementTask, EventKind, Session, SessionStatus};
use crate::policy::{PolicyResolver, PolicyStore};

pub use memory::{InMemoryDeadLetterSink, InMemoryEventSource};
pub use nats::{NatsDeadLetterSink, NatsEventSource, NatsSourceConfig};

/// Opaque handle identifying an in-flight (polled but not yet committed)
/// message, scoped to whichever [`EventSource`] produced it.
pub type EventHandle = String;

/// The contract the Consumer pulls from (§6: partitioned by `phoneId`,
/// manual commits).
///
/// Modeled after the source system's visibility-timeout queue semantics:
/// `poll` hides a message until `commit` or `nack` is called, so a
/// retryable failure simply makes the message visible again rather than
/// requiring the consumer to remember an offset itself.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Wait up to `timeout` for the next message. `None` on timeout.
    async fn poll(&self, timeout: Duration) -> Option<(EventHandle, Vec<u8>)>;
    /// Durably advance past `handle`; never redelivered.
    async fn commit(&self, handle: EventHandle);
    /// Make `handle` visible again after `delay`, for redelivery.
    async fn nack(&self, handle: EventHandle, delay: Duration);
}

/// Sink for poison messages (§4.B): malformed envelopes are routed here
/// and their offset is still committed.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, payload: Vec<u8>, reason: String);
}

// Blanket impls so a composition root can share one `Arc<NatsEventSource>`
// (the background subscriber task holds its own clone) between the
// `EventConsumer` and whatever spawned it.

#[async_trait]
impl<T: EventSource + ?Sized> EventSource for Arc<T> {
    async fn poll(&self, timeout: Duration) -> Option<(EventHandle, Vec<u8>)> {
        (**self).poll(timeout).await
    }
    async fn commit(&self, handle: EventHandle) {
        (**self).commit(handle).await
    }
    async fn nack(&self, handle: EventHandle, delay: Duration) {
        (**self).nack(handle, delay).await
    }
}

#[async_trait]
impl<T: DeadLetterSink + ?Sized> DeadLetterSink for Arc<T> {
    async fn send(&self, payload: Vec<u8>, reason: String) {
        (**self).send(payload, reason).await
    }
}

/// Tuning knobs the consumer loop needs (subset of §6's configuration table).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub poll_timeout: Duration,
    pub dispatch_backpressure_timeout: Duration,
    /// Delay before a NACKed (retryable-failure) message becomes visible again.
    pub retry_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            dispatch_backpressure_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// The Event Consumer: decode → route → commit/nack/dead-letter.
pub struct EventConsumer<S, P, D> {
    source: S,
    index: Arc<SessionIndex>,
    resolver: Arc<PolicyResolver<P>>,
    dispatcher: Arc<Dispatcher>,
    dead_letter: D,
    config: ConsumerConfig,
}

impl<S, P, D> EventConsumer<S, P, D>
where
    S: EventSource,
    P: PolicyStore,
    D: DeadLetterSink,
{
    pub fn new(
        source: S,
        index: Arc<SessionIndex>,
        resolver: Arc<PolicyResolver<P>>,
        dispatcher: Arc<Dispatcher>,
        dead_letter: D,
        config: ConsumerConfig,
    ) -> Self {
        Self { source, index, resolver, dispatcher, dead_letter, config }
    }

    /// Run until `cancel` fires. A single sequential loop, which is what
    /// preserves the producer's per-`phoneId` ordering guarantee: there is
    /// never more than one event being routed at a time.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                polled = self.source.poll(self.config.poll_timeout) => {
                    let Some((handle, payload)) = polled else { continue };
                    self.handle_one(handle, payload).await;
                }
            }
        }
    }

    /// Decode, route, and commit/nack/dead-letter a single message.
    /// Returns `true` if the event was successfully routed (for tests).
    pub async fn handle_one(&self, handle: EventHandle, payload: Vec<u8>) -> bool {
        let event = match event::decode(&payload) {
            Ok(event) => event,
            Err(_) => {
                self.dead_letter.send(payload, "malformed envelope".to_owned()).await;
                self.source.commit(handle).await;
                return false;
            }
        };

        match self.route(event).await {
            Ok(()) => {
                self.source.commit(handle).await;
                true
            }
            Err(_) => {
                self.source.nack(handle, self.config.retry_delay).await;
                false
            }
        }
    }

    async fn route(&self, event: SessionEvent) -> Result<(), PipelineError> {
        match event {
            SessionEvent::SessionStart {
                session_id,
                subscriber_id,
                phone_id,
                private_address,
                public_address,
                timestamp,
            } => {
                self.index
                    .upsert_start(Session {
                        session_id,
                        subscriber_id,
                        phone_id: phone_id.clone(),
                        private_address,
                        public_address,
                        created_at: timestamp,
                        last_seen_at: timestamp,
                        status: SessionStatus::Active,
                    })
                    .await;

                let rules = self.resolver.resolve(&phone_id, chrono::Utc::now()).await?;
                if rules.is_empty() {
                    return Ok(());
                }

                let session = self.index.lookup_by_phone(&phone_id).await;
                let subscriber_id = session.map(|s| s.subscriber_id).unwrap_or_default();
                self.enqueue(
                    &phone_id,
                    EnforcementTask {
                        subscriber_id,
                        phone_id: phone_id.clone(),
                        event_kind: EventKind::Install,
                        current_address: private_address,
                        previous_address: None,
                        policies: rules,
                        attempt: 0,
                    },
                )
                .await
            }
            SessionEvent::IpChange {
                subscriber_id,
                phone_id,
                old_private_address,
                new_private_address,
                new_public_address,
                timestamp,
                ..
            } => {
                let migrated = self.index.migrate_address(&subscriber_id, new_private_address, new_public_address, timestamp).await;

                let rules = self.resolver.resolve(&phone_id, chrono::Utc::now()).await?;
                if rules.is_empty() {
                    return Ok(());
                }

                // No ACTIVE session for this subscriber — most likely the
                // index lost its state across a restart. Treat the new
                // address as a first sighting rather than dropping the
                // event: the subscriber must still end up blocked.
                let (event_kind, previous_address) = match migrated {
                    Ok(_) => (EventKind::Migrate, Some(old_private_address)),
                    Err(_) => (EventKind::Install, None),
                };

                self.enqueue(
                    &phone_id,
                    EnforcementTask {
                        subscriber_id,
                        phone_id: phone_id.clone(),
                        event_kind,
                        current_address: new_private_address,
                        previous_address,
                        policies: rules,
                        attempt: 0,
                    },
                )
                .await
            }
            SessionEvent::SessionEnd { session_id, subscriber_id, phone_id, .. } => {
                let Ok(session) = self.index.terminate(&subscriber_id, &session_id).await else {
                    return Ok(());
                };

                self.enqueue(
                    &phone_id,
                    EnforcementTask {
                        subscriber_id,
                        phone_id: phone_id.clone(),
                        event_kind: EventKind::Remove,
                        current_address: session.private_address,
                        previous_address: None,
                        policies: Vec::new(),
                        attempt: 0,
                    },
                )
                .await
            }
        }
    }

    async fn enqueue(&self, phone_id: &str, task: EnforcementTask) -> Result<(), PipelineError> {
        match self.dispatcher.enqueue(phone_id, task, self.config.dispatch_backpressure_timeout).await {
            Ok(()) => Ok(()),
            Err(DispatchError::BackpressureTimeout) => Err(PipelineError::transient("dispatcher back-pressure")),
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
