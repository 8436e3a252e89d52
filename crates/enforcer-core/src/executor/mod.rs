// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Enforcement Executor (§4.E): translates a dequeued [`EnforcementTask`]
//! into rule-facade calls, persists the mapping, logs the outcome, and
//! updates block counters.

pub mod facade;
pub mod reconcile;
pub mod stores;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, Timelike};

use crate::clock::now_ms;
use crate::dispatcher::TaskHandler;
use crate::error::{ErrorKind, PipelineError};
use crate::model::{
    EnforcementTask, EventKind, HistoryAction, HistoryRecord, HistoryStatus, MappingStatus, RuleMapping,
};

pub use facade::{idempotency_key, CreatedRule, HttpRuleFacade, RuleFacade};
pub use reconcile::spawn_reconciliation_sweep;
pub use stores::{CounterStore, HistoryStore, InMemoryCounterStore, InMemoryHistoryStore, InMemoryMappingStore, MappingStore};

/// Wires a [`RuleFacade`] plus the three persistent-store contracts into
/// the three enforcement algorithms of §4.E, and exposes them to the
/// Dispatcher as a [`TaskHandler`].
pub struct Executor<F, M, H, C> {
    facade: F,
    mappings: M,
    history: H,
    counters: C,
    inflight: Arc<tokio::sync::Semaphore>,
}

impl<F, M, H, C> Executor<F, M, H, C>
where
    F: RuleFacade,
    M: MappingStore,
    H: HistoryStore,
    C: CounterStore,
{
    pub fn new(facade: F, mappings: M, history: H, counters: C, facade_max_inflight: usize) -> Self {
        Self { facade, mappings, history, counters, inflight: Arc::new(tokio::sync::Semaphore::new(facade_max_inflight.max(1))) }
    }

    pub async fn execute(&self, task: EnforcementTask) -> Result<(), PipelineError> {
        match task.event_kind {
            EventKind::Install => self.install(&task).await,
            EventKind::Migrate => self.migrate(&task).await,
            EventKind::Remove => self.remove(&task).await,
        }
    }

    /// §4.E INSTALL: for each AppRule, skip if an up-to-date mapping
    /// already exists (idempotent replay), otherwise call `createBlock`.
    async fn install(&self, task: &EnforcementTask) -> Result<(), PipelineError> {
        for rule in &task.policies {
            if let Some(existing) = self.mappings.get(&task.phone_id, &rule.app_name).await? {
                if existing.address == task.current_address && existing.status == MappingStatus::Active {
                    continue;
                }
            }

            let key = idempotency_key(&task.phone_id, &rule.app_name, EventKind::Install, task.current_address, task.attempt);
            let _permit = self.inflight.acquire().await.map_err(|_| PipelineError::fatal("facade semaphore closed"))?;
            let outcome = self.facade.create_block(task.current_address, &rule.app_name, &rule.ports, &task.phone_id, &key).await;
            drop(_permit);

            match outcome {
                Ok(created) => {
                    self.record_success(task, &rule.app_name, &rule.policy_id, created.rule_id, HistoryAction::Block).await?;
                }
                Err(err) => {
                    self.record_failure(task, &rule.app_name, None, HistoryAction::Block, &err).await?;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// §4.E MIGRATE: rewrite every existing mapping to the new address;
    /// a mapping whose rule has vanished on the facade falls back to
    /// `createBlock` rather than leaving the app unblocked.
    async fn migrate(&self, task: &EnforcementTask) -> Result<(), PipelineError> {
        let existing = self.mappings.list(&task.phone_id).await?;

        // Open question (design notes): IP_CHANGE with no existing mapping
        // for this phoneId has nothing to migrate. Fall back to a plain
        // INSTALL of the currently-resolved policies instead of silently
        // doing nothing.
        if existing.is_empty() {
            return self.install(task).await;
        }

        for mapping in existing {
            let key = idempotency_key(&task.phone_id, &mapping.app_name, EventKind::Migrate, task.current_address, task.attempt);
            let permit = self.inflight.acquire().await.map_err(|_| PipelineError::fatal("facade semaphore closed"))?;
            let outcome = self.facade.update_block(&mapping.rule_id, task.current_address, &key).await;
            drop(permit);

            match outcome {
                Ok(rule_id) => {
                    self.record_success(task, &mapping.app_name, &mapping.policy_id, rule_id, HistoryAction::Update).await?;
                }
                Err(err) if err.kind == ErrorKind::NotFound => {
                    self.record_failure(task, &mapping.app_name, Some(&mapping.rule_id), HistoryAction::Update, &err).await?;

                    let rule = task.policies.iter().find(|r| r.app_name == mapping.app_name);
                    if let Some(rule) = rule {
                        let create_key =
                            idempotency_key(&task.phone_id, &rule.app_name, EventKind::Install, task.current_address, task.attempt);
                        let permit = self.inflight.acquire().await.map_err(|_| PipelineError::fatal("facade semaphore closed"))?;
                        let created = self
                            .facade
                            .create_block(task.current_address, &rule.app_name, &rule.ports, &task.phone_id, &create_key)
                            .await;
                        drop(permit);
                        match created {
                            Ok(created) => {
                                self.record_success(task, &rule.app_name, &rule.policy_id, created.rule_id, HistoryAction::Block)
                                    .await?;
                            }
                            Err(err) => {
                                self.record_failure(task, &rule.app_name, None, HistoryAction::Block, &err).await?;
                                return Err(err);
                            }
                        }
                    }
                }
                Err(err) => {
                    self.record_failure(task, &mapping.app_name, Some(&mapping.rule_id), HistoryAction::Update, &err).await?;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// §4.E REMOVE: delete every mapping for the phone; a repeatedly
    /// failing delete is flagged as orphaned and left for the
    /// reconciliation sweep rather than retried forever inline.
    async fn remove(&self, task: &EnforcementTask) -> Result<(), PipelineError> {
        let existing = self.mappings.list(&task.phone_id).await?;
        for mapping in existing {
            let key = idempotency_key(&task.phone_id, &mapping.app_name, EventKind::Remove, task.current_address, task.attempt);
            let permit = self.inflight.acquire().await.map_err(|_| PipelineError::fatal("facade semaphore closed"))?;
            let outcome = self.facade.delete_block(&mapping.rule_id, &key).await;
            drop(permit);

            match outcome {
                Ok(()) => {
                    self.mappings.delete(&task.phone_id, &mapping.rule_id).await?;
                    self.history
                        .append(HistoryRecord {
                            phone_id: task.phone_id.clone(),
                            timestamp: now_ms(),
                            action: HistoryAction::Unblock,
                            app_name: mapping.app_name.clone(),
                            address: task.current_address,
                            rule_id: Some(mapping.rule_id.clone()),
                            status: HistoryStatus::Success,
                            error_kind: None,
                        })
                        .await?;
                }
                Err(err) if err.kind.is_retryable() || err.kind == ErrorKind::Fatal => {
                    self.record_failure(task, &mapping.app_name, Some(&mapping.rule_id), HistoryAction::Unblock, &err).await?;
                    return Err(err);
                }
                Err(err) => {
                    // Flagged orphan: left for the reconciliation sweep.
                    let mut orphan = mapping.clone();
                    orphan.status = MappingStatus::Orphan;
                    self.mappings.put(orphan).await?;
                    self.record_failure(task, &mapping.app_name, Some(&mapping.rule_id), HistoryAction::Unblock, &err).await?;
                }
            }
        }
        Ok(())
    }

    async fn record_success(
        &self,
        task: &EnforcementTask,
        app_name: &str,
        policy_id: &str,
        rule_id: String,
        action: HistoryAction,
    ) -> Result<(), PipelineError> {
        let now = now_ms();
        self.mappings
            .put(RuleMapping {
                phone_id: task.phone_id.clone(),
                rule_id: rule_id.clone(),
                address: task.current_address,
                app_name: app_name.to_owned(),
                policy_id: policy_id.to_owned(),
                status: MappingStatus::Active,
                created_at: now,
                last_verified_at: now,
            })
            .await?;

        self.history
            .append(HistoryRecord {
                phone_id: task.phone_id.clone(),
                timestamp: now,
                action,
                app_name: app_name.to_owned(),
                address: task.current_address,
                rule_id: Some(rule_id),
                status: HistoryStatus::Success,
                error_kind: None,
            })
            .await?;

        if action == HistoryAction::Block {
            let utc_now = chrono::DateTime::from_timestamp_millis(now).unwrap_or_else(chrono::Utc::now);
            let date = format!("{:04}-{:02}-{:02}", utc_now.year(), utc_now.month(), utc_now.day());
            self.counters.increment(&task.phone_id, &date, app_name, utc_now.hour() as u8).await?;
        }

        Ok(())
    }

    async fn record_failure(
        &self,
        task: &EnforcementTask,
        app_name: &str,
        rule_id: Option<&str>,
        action: HistoryAction,
        err: &PipelineError,
    ) -> Result<(), PipelineError> {
        self.history
            .append(HistoryRecord {
                phone_id: task.phone_id.clone(),
                timestamp: now_ms(),
                action,
                app_name: app_name.to_owned(),
                address: task.current_address,
                rule_id: rule_id.map(ToOwned::to_owned),
                status: HistoryStatus::Failed,
                error_kind: Some(err.kind.as_str().to_owned()),
            })
            .await
    }
}

#[async_trait]
impl<F, M, H, C> TaskHandler for Executor<F, M, H, C>
where
    F: RuleFacade,
    M: MappingStore,
    H: HistoryStore,
    C: CounterStore,
{
    async fn handle(&self, task: EnforcementTask) -> Result<(), PipelineError> {
        self.execute(task).await
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
