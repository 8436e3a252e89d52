// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Index: the bidirectional `{subscriber, phone, address} -> session`
//! mapping (§4.A), sharded by `hash(subscriberId) mod N` so that unrelated
//! subscribers never contend on the same lock.
//!
//! Each shard owns the authoritative [`Session`] records for the
//! subscribers hashed to it. Two coarse, separately-locked reverse maps
//! (`phoneId -> subscriberId`, `address -> subscriberId`) support
//! read-mostly lookups without forcing every subscriber onto one lock —
//! the same "one coarse lock, never held across I/O" trade-off the
//! Dispatcher makes for its queue map (§5).

use std::collections::HashMap;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use tokio::sync::RwLock;

use crate::model::{Session, SessionStatus};

/// Why a Session Index operation could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexError {
    /// No ACTIVE session exists for the given key.
    NotFound,
}

fn shard_of(subscriber_id: &str, shard_count: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    subscriber_id.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

/// The bidirectionally-keyed, sharded session store.
pub struct SessionIndex {
    shards: Vec<RwLock<HashMap<String, Session>>>,
    phone_to_subscriber: RwLock<HashMap<String, String>>,
    address_to_subscriber: RwLock<HashMap<IpAddr, String>>,
    shard_count: usize,
    session_ttl: chrono::Duration,
}

impl SessionIndex {
    pub fn new(shard_count: usize, session_ttl: chrono::Duration) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            shards,
            phone_to_subscriber: RwLock::new(HashMap::new()),
            address_to_subscriber: RwLock::new(HashMap::new()),
            shard_count,
            session_ttl,
        }
    }

    fn shard_for(&self, subscriber_id: &str) -> &RwLock<HashMap<String, Session>> {
        &self.shards[shard_of(subscriber_id, self.shard_count)]
    }

    /// Insert or replace an ACTIVE session for its subscriber.
    ///
    /// Any prior session for the same subscriber is evicted first and its
    /// addresses freed, preserving `(subscriberId, status=ACTIVE)` cardinality ≤ 1.
    pub async fn upsert_start(&self, session: Session) -> Option<Session> {
        let subscriber_id = session.subscriber_id.clone();
        let mut shard = self.shard_for(&subscriber_id).write().await;
        let previous = shard.remove(&subscriber_id);

        if let Some(prev) = &previous {
            self.unlink_addresses(prev).await;
        }

        self.link_addresses(&session).await;
        shard.insert(subscriber_id, session);
        previous
    }

    /// Move the ACTIVE session for `subscriberId` to new addresses.
    ///
    /// Returns the addresses the session previously held, or
    /// [`IndexError::NotFound`] if there is no ACTIVE session to migrate.
    pub async fn migrate_address(
        &self,
        subscriber_id: &str,
        new_private: IpAddr,
        new_public: IpAddr,
        timestamp: i64,
    ) -> Result<(IpAddr, IpAddr), IndexError> {
        let mut shard = self.shard_for(subscriber_id).write().await;
        let session = shard.get_mut(subscriber_id).ok_or(IndexError::NotFound)?;
        if session.status != SessionStatus::Active {
            return Err(IndexError::NotFound);
        }

        let old = (session.private_address, session.public_address);

        {
            let mut addresses = self.address_to_subscriber.write().await;
            addresses.remove(&old.0);
            addresses.insert(new_private, subscriber_id.to_owned());
        }

        session.private_address = new_private;
        session.public_address = new_public;
        session.last_seen_at = timestamp;

        Ok(old)
    }

    /// Mark the session `(subscriberId, sessionId)` TERMINATED and remove
    /// all of its secondary keys.
    ///
    /// `session_id` guards against terminating a session that has already
    /// been superseded by a later SESSION_START for the same subscriber.
    pub async fn terminate(&self, subscriber_id: &str, session_id: &str) -> Result<Session, IndexError> {
        let mut shard = self.shard_for(subscriber_id).write().await;
        let matches = shard.get(subscriber_id).is_some_and(|s| s.session_id == session_id);
        if !matches {
            return Err(IndexError::NotFound);
        }
        let mut session = shard.remove(subscriber_id).ok_or(IndexError::NotFound)?;
        session.status = SessionStatus::Terminated;
        self.unlink_addresses(&session).await;
        Ok(session)
    }

    pub async fn lookup_by_subscriber(&self, subscriber_id: &str) -> Option<Session> {
        self.shard_for(subscriber_id).read().await.get(subscriber_id).cloned()
    }

    pub async fn lookup_by_phone(&self, phone_id: &str) -> Option<Session> {
        let subscriber_id = self.phone_to_subscriber.read().await.get(phone_id).cloned()?;
        self.lookup_by_subscriber(&subscriber_id).await
    }

    pub async fn lookup_by_address(&self, address: IpAddr) -> Option<Session> {
        let subscriber_id = self.address_to_subscriber.read().await.get(&address).cloned()?;
        self.lookup_by_subscriber(&subscriber_id).await
    }

    /// Evict every session whose `lastSeenAt` is older than `sessionTTL`
    /// relative to `now`, and return what was evicted for downstream cleanup.
    pub async fn sweep_expired(&self, now: i64) -> Vec<Session> {
        let cutoff = now - self.session_ttl.num_milliseconds();
        let mut evicted = Vec::new();

        for shard_lock in &self.shards {
            let mut shard = shard_lock.write().await;
            let expired_ids: Vec<String> = shard
                .iter()
                .filter(|(_, s)| s.last_seen_at < cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired_ids {
                if let Some(session) = shard.remove(&id) {
                    evicted.push(session);
                }
            }
        }

        for session in &evicted {
            self.unlink_addresses(session).await;
        }

        evicted
    }

    async fn link_addresses(&self, session: &Session) {
        self.phone_to_subscriber
            .write()
            .await
            .insert(session.phone_id.clone(), session.subscriber_id.clone());
        self.address_to_subscriber
            .write()
            .await
            .insert(session.private_address, session.subscriber_id.clone());
    }

    async fn unlink_addresses(&self, session: &Session) {
        self.phone_to_subscriber.write().await.remove(&session.phone_id);
        self.address_to_subscriber.write().await.remove(&session.private_address);
    }

    /// Count of subscribers with a currently-tracked session, across all shards.
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().await.len();
        }
        total
    }

    /// Distinct addresses currently mapped to an active session (diagnostic;
    /// used by property tests to assert the address-uniqueness invariant).
    pub async fn active_addresses(&self) -> HashSet<IpAddr> {
        self.address_to_subscriber.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
