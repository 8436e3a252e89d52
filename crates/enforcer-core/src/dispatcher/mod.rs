// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Enforcement Dispatcher (§4.D): a `phoneId -> bounded task queue` map
//! drained by a fixed pool of workers, with at-most-one-in-flight-per-
//! subscriber serialization and retry-with-backoff.
//!
//! The queue map and the "currently processing" set are mutated under a
//! single coarse [`Mutex`] — contention is acceptable because the lock is
//! never held across I/O (the same trade-off the Session Index makes for
//! its shards, just coarser since FIFO-per-subscriber requires a single
//! point of truth for "who is eligible to run next").

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, PipelineError};
use crate::model::EnforcementTask;

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

/// Why a task could not be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// Waited `dispatchBackpressureTimeout` for room in the total queue
    /// depth `Q` and it never freed up.
    BackpressureTimeout,
}

/// Consumes a dequeued [`EnforcementTask`]; implemented by the Executor.
///
/// Kept as a trait (rather than a direct dependency on the executor crate
/// module) so the dispatcher can be unit-tested against a fake handler.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: EnforcementTask) -> Result<(), PipelineError>;
}

struct QueuedTask {
    task: EnforcementTask,
    not_before_ms: i64,
}

#[derive(Default)]
struct DispatcherState {
    queues: HashMap<String, VecDeque<QueuedTask>>,
    processing: HashSet<String>,
    depth: usize,
}

/// The per-subscriber FIFO dispatcher. Cheap to clone (wraps an `Arc`
/// internally via its fields being behind locks); share it via `Arc` across
/// the worker pool and the event consumer.
pub struct Dispatcher {
    state: Mutex<DispatcherState>,
    notify: Notify,
    queue_cap: usize,
    max_retries: u32,
}

impl Dispatcher {
    pub fn new(queue_cap: usize, max_retries: u32) -> Self {
        Self { state: Mutex::new(DispatcherState::default()), notify: Notify::new(), queue_cap, max_retries }
    }

    /// Enqueue `task` for `phone_id`, waiting up to `backpressure_timeout`
    /// for room if the total queue depth `Q` is currently exhausted.
    pub async fn enqueue(
        &self,
        phone_id: &str,
        task: EnforcementTask,
        backpressure_timeout: Duration,
    ) -> Result<(), DispatchError> {
        tokio::time::timeout(backpressure_timeout, self.enqueue_blocking(phone_id, task))
            .await
            .map_err(|_| DispatchError::BackpressureTimeout)?
    }

    async fn enqueue_blocking(&self, phone_id: &str, task: EnforcementTask) -> Result<(), DispatchError> {
        loop {
            {
                let mut state = self.state.lock().await;
                if state.depth < self.queue_cap {
                    state.queues.entry(phone_id.to_owned()).or_default().push_back(QueuedTask {
                        task,
                        not_before_ms: 0,
                    });
                    state.depth += 1;
                    self.notify.notify_waiters();
                    return Ok(());
                }
            }
            self.notify.notified().await;
        }
    }

    /// Pop the next runnable task: the first subscriber that is not
    /// currently being processed, whose queue head is due (`not_before_ms
    /// <= now`), FIFO within that subscriber. Marks the subscriber as
    /// processing until [`Self::complete`] is called.
    async fn pop_ready(&self, now_ms: i64) -> Option<(String, EnforcementTask)> {
        let mut state = self.state.lock().await;
        let candidate = state
            .queues
            .iter()
            .find(|(phone_id, queue)| {
                !state.processing.contains(phone_id.as_str())
                    && queue.front().is_some_and(|q| q.not_before_ms <= now_ms)
            })
            .map(|(phone_id, _)| phone_id.clone())?;

        let queue = state.queues.get_mut(&candidate)?;
        let queued = queue.pop_front()?;
        if queue.is_empty() {
            state.queues.remove(&candidate);
        }
        state.depth -= 1;
        state.processing.insert(candidate.clone());
        Some((candidate, queued.task))
    }

    /// Release `phone_id` back to eligibility and wake any worker blocked
    /// in [`Self::run_one`], and any enqueuer waiting on back-pressure.
    async fn complete(&self, phone_id: &str) {
        self.state.lock().await.processing.remove(phone_id);
        self.notify.notify_waiters();
    }

    /// Re-enter a failed task at the back of its subscriber's queue with a
    /// `notBefore` delay. Bumps the attempt counter and drops the task (and
    /// returns `false`) once `maxRetries` is exhausted, unless `count_as_attempt`
    /// is `false` — a RateLimited failure doesn't count against `maxRetries`
    /// (§7), it just waits out the facade's `Retry-After`.
    async fn requeue_after_failure(
        &self,
        phone_id: &str,
        mut task: EnforcementTask,
        now_ms: i64,
        delay_ms: i64,
        count_as_attempt: bool,
    ) -> bool {
        if count_as_attempt {
            task.attempt += 1;
            if task.attempt > self.max_retries {
                self.complete(phone_id).await;
                return false;
            }
        }
        let mut state = self.state.lock().await;
        state.queues.entry(phone_id.to_owned()).or_default().push_back(QueuedTask {
            task,
            not_before_ms: now_ms + delay_ms,
        });
        state.depth += 1;
        state.processing.remove(phone_id);
        drop(state);
        self.notify.notify_waiters();
        true
    }

    /// Total number of tasks currently queued (not counting the one, if
    /// any, actively being processed by a worker).
    pub async fn depth(&self) -> usize {
        self.state.lock().await.depth
    }

    /// Run a single worker loop until `cancel` fires. Backs off briefly
    /// when no task is ready to avoid a busy loop.
    pub async fn run_worker(self: Arc<Self>, handler: Arc<dyn TaskHandler>, cancel: CancellationToken) {
        let mut idle_backoff = Duration::from_millis(10);
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let now_ms = crate::clock::now_ms();
            let Some((phone_id, task)) = self.pop_ready(now_ms).await else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(idle_backoff) => {}
                    _ = self.notify.notified() => {}
                }
                continue;
            };
            idle_backoff = Duration::from_millis(10);

            let attempt = task.attempt;
            match handler.handle(task.clone()).await {
                Ok(()) => {
                    self.complete(&phone_id).await;
                }
                Err(err) if err.kind.is_retryable() => {
                    let rate_limit_retry_after = match &err.kind {
                        ErrorKind::RateLimited { retry_after } => Some(*retry_after),
                        _ => None,
                    };
                    let (delay_ms, count_as_attempt) = match rate_limit_retry_after {
                        Some(retry_after) => (retry_after.map_or_else(|| backoff_ms(attempt), |d| d.as_millis() as i64), false),
                        None => (backoff_ms(attempt), true),
                    };
                    tracing::warn!(phone_id = %phone_id, attempt, err = %err, "enforcement task failed, retrying");
                    self.requeue_after_failure(&phone_id, task, now_ms, delay_ms, count_as_attempt).await;
                }
                Err(err) => {
                    tracing::error!(phone_id = %phone_id, err = %err, "enforcement task abandoned (non-retryable)");
                    self.complete(&phone_id).await;
                }
            }
        }
    }

    /// Spawn `worker_count` worker loops, returning their join handles so
    /// the caller can await them during graceful shutdown.
    pub fn spawn_workers(
        self: &Arc<Self>,
        handler: Arc<dyn TaskHandler>,
        worker_count: usize,
        cancel: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        (0..worker_count)
            .map(|_| {
                let dispatcher = Arc::clone(self);
                let handler = Arc::clone(&handler);
                let cancel = cancel.clone();
                tokio::spawn(async move { dispatcher.run_worker(handler, cancel).await })
            })
            .collect()
    }
}

/// Exponential backoff, starting at 1s and doubling up to a 60s cap, keyed
/// by the attempt number the task is about to make.
fn backoff_ms(attempt: u32) -> i64 {
    let base = 1_000i64;
    let capped_shift = attempt.min(6);
    (base << capped_shift).min(60_000)
}
