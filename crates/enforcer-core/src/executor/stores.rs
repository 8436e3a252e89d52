// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistent-store contracts the Executor depends on (§6): mapping,
//! history, and counter, each partitioned by `phoneId`. The core only
//! consumes these CRUD contracts; the stores themselves are externally
//! owned durable tables.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::PipelineError;
use crate::model::{BlockedCounter, HistoryRecord, RuleMapping};

#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn get(&self, phone_id: &str, app_name: &str) -> Result<Option<RuleMapping>, PipelineError>;
    async fn list(&self, phone_id: &str) -> Result<Vec<RuleMapping>, PipelineError>;
    async fn put(&self, mapping: RuleMapping) -> Result<(), PipelineError>;
    async fn delete(&self, phone_id: &str, rule_id: &str) -> Result<(), PipelineError>;
    /// At most `limit` mappings with `lastVerifiedAt < cutoff`, for the
    /// reconciliation sweep.
    async fn due_for_verification(&self, cutoff: i64, limit: usize) -> Result<Vec<RuleMapping>, PipelineError>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, record: HistoryRecord) -> Result<(), PipelineError>;
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// `ADD count :1, ADD hourly.HH :1` for `(phoneId, date, appName)`.
    async fn increment(&self, phone_id: &str, date: &str, app_name: &str, hour: u8) -> Result<(), PipelineError>;
}

// Blanket impls so a composition root can hand the Executor a trait
// object (`Arc<dyn MappingStore>`) for a store backend chosen at runtime,
// without the Executor itself being generic over that choice.

#[async_trait]
impl<T: MappingStore + ?Sized> MappingStore for Arc<T> {
    async fn get(&self, phone_id: &str, app_name: &str) -> Result<Option<RuleMapping>, PipelineError> {
        (**self).get(phone_id, app_name).await
    }
    async fn list(&self, phone_id: &str) -> Result<Vec<RuleMapping>, PipelineError> {
        (**self).list(phone_id).await
    }
    async fn put(&self, mapping: RuleMapping) -> Result<(), PipelineError> {
        (**self).put(mapping).await
    }
    async fn delete(&self, phone_id: &str, rule_id: &str) -> Result<(), PipelineError> {
        (**self).delete(phone_id, rule_id).await
    }
    async fn due_for_verification(&self, cutoff: i64, limit: usize) -> Result<Vec<RuleMapping>, PipelineError> {
        (**self).due_for_verification(cutoff, limit).await
    }
}

#[async_trait]
impl<T: HistoryStore + ?Sized> HistoryStore for Arc<T> {
    async fn append(&self, record: HistoryRecord) -> Result<(), PipelineError> {
        (**self).append(record).await
    }
}

#[async_trait]
impl<T: CounterStore + ?Sized> CounterStore for Arc<T> {
    async fn increment(&self, phone_id: &str, date: &str, app_name: &str, hour: u8) -> Result<(), PipelineError> {
        (**self).increment(phone_id, date, app_name, hour).await
    }
}

/// In-process mapping store for tests and local runs, keyed by `phoneId`.
#[derive(Default)]
pub struct InMemoryMappingStore {
    by_phone: Arc<RwLock<HashMap<String, Vec<RuleMapping>>>>,
}

impl InMemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MappingStore for InMemoryMappingStore {
    async fn get(&self, phone_id: &str, app_name: &str) -> Result<Option<RuleMapping>, PipelineError> {
        let store = self.by_phone.read().await;
        Ok(store.get(phone_id).and_then(|mappings| mappings.iter().find(|m| m.app_name == app_name).cloned()))
    }

    async fn list(&self, phone_id: &str) -> Result<Vec<RuleMapping>, PipelineError> {
        Ok(self.by_phone.read().await.get(phone_id).cloned().unwrap_or_default())
    }

    async fn put(&self, mapping: RuleMapping) -> Result<(), PipelineError> {
        let mut store = self.by_phone.write().await;
        let mappings = store.entry(mapping.phone_id.clone()).or_default();
        if let Some(existing) = mappings.iter_mut().find(|m| m.app_name == mapping.app_name) {
            *existing = mapping;
        } else {
            mappings.push(mapping);
        }
        Ok(())
    }

    async fn delete(&self, phone_id: &str, rule_id: &str) -> Result<(), PipelineError> {
        let mut store = self.by_phone.write().await;
        if let Some(mappings) = store.get_mut(phone_id) {
            mappings.retain(|m| m.rule_id != rule_id);
        }
        Ok(())
    }

    async fn due_for_verification(&self, cutoff: i64, limit: usize) -> Result<Vec<RuleMapping>, PipelineError> {
        let store = self.by_phone.read().await;
        Ok(store
            .values()
            .flatten()
            .filter(|m| m.last_verified_at < cutoff)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// In-process history store for tests and local runs.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    records: Arc<RwLock<Vec<HistoryRecord>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<HistoryRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, record: HistoryRecord) -> Result<(), PipelineError> {
        self.records.write().await.push(record);
        Ok(())
    }
}

/// In-process counter store for tests and local runs, keyed by
/// `(phoneId, date, appName)`.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Arc<RwLock<HashMap<(String, String, String), BlockedCounter>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, phone_id: &str, date: &str, app_name: &str) -> BlockedCounter {
        self.counters
            .read()
            .await
            .get(&(phone_id.to_owned(), date.to_owned(), app_name.to_owned()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, phone_id: &str, date: &str, app_name: &str, hour: u8) -> Result<(), PipelineError> {
        let mut counters = self.counters.write().await;
        let key = (phone_id.to_owned(), date.to_owned(), app_name.to_owned());
        counters.entry(key).or_default().record(hour);
        Ok(())
    }
}
