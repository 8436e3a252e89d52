// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reconciliation sweep (§4.E): a background task that periodically
//! re-verifies a batch of rule mappings against the facade, refreshing
//! `lastVerifiedAt` or flagging orphans for cleanup.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::clock::now_ms;
use crate::executor::facade::RuleFacade;
use crate::executor::stores::MappingStore;
use crate::model::MappingStatus;

/// Spawn the sweep loop. Picks at most `batch_size` mappings whose
/// `lastVerifiedAt` is older than `verify_staleness`, calls `verify`, and
/// either refreshes `lastVerifiedAt` or marks the mapping orphaned.
pub fn spawn_reconciliation_sweep<F, M>(
    facade: Arc<F>,
    mappings: Arc<M>,
    interval: std::time::Duration,
    verify_staleness: std::time::Duration,
    batch_size: usize,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    F: RuleFacade + 'static,
    M: MappingStore + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            run_sweep_once(facade.as_ref(), mappings.as_ref(), verify_staleness, batch_size).await;
        }
    })
}

/// One sweep pass, factored out so tests can drive it without waiting on
/// the interval timer.
pub async fn run_sweep_once<F, M>(facade: &F, mappings: &M, verify_staleness: std::time::Duration, batch_size: usize)
where
    F: RuleFacade,
    M: MappingStore,
{
    let cutoff = now_ms() - verify_staleness.as_millis() as i64;
    let due = match mappings.due_for_verification(cutoff, batch_size).await {
        Ok(due) => due,
        Err(e) => {
            tracing::warn!(err = %e, "reconciliation sweep: failed to list due mappings");
            return;
        }
    };

    for mut mapping in due {
        match facade.verify(&mapping.rule_id).await {
            Ok(true) => {
                mapping.last_verified_at = now_ms();
                if let Err(e) = mappings.put(mapping).await {
                    tracing::warn!(err = %e, "reconciliation sweep: failed to refresh mapping");
                }
            }
            Ok(false) => {
                tracing::warn!(phone_id = %mapping.phone_id, rule_id = %mapping.rule_id, "reconciliation sweep: rule missing, marking orphan");
                mapping.status = MappingStatus::Orphan;
                if let Err(e) = mappings.put(mapping).await {
                    tracing::warn!(err = %e, "reconciliation sweep: failed to mark orphan");
                }
            }
            Err(e) => {
                tracing::debug!(phone_id = %mapping.phone_id, rule_id = %mapping.rule_id, err = %e, "reconciliation sweep: verify failed, retrying next sweep");
            }
        }
    }
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
