// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Datelike;
use tokio::sync::RwLock;

use crate::error::PipelineError;
use crate::model::{PolicyStatus, ResolvedRule, TimeWindow};
use crate::policy::PolicyStore;

struct CacheEntry {
    rules: Vec<ResolvedRule>,
    cached_at: Instant,
}

/// Resolves the currently-enforceable [`ResolvedRule`]s for a subscriber,
/// caching per-`phoneId` results for `cache_ttl` to absorb bursty
/// SESSION_START storms.
pub struct PolicyResolver<S> {
    store: S,
    cache: RwLock<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
}

impl<S: PolicyStore> PolicyResolver<S> {
    pub fn new(store: S, cache_ttl: Duration) -> Self {
        Self { store, cache: RwLock::new(HashMap::new()), cache_ttl }
    }

    /// Return the list of `(policyId, appName, ports)` currently enforceable
    /// for `phone_id` at `now`.
    pub async fn resolve(
        &self,
        phone_id: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<ResolvedRule>, PipelineError> {
        if let Some(entry) = self.cache.read().await.get(phone_id) {
            if entry.cached_at.elapsed() < self.cache_ttl {
                return Ok(entry.rules.clone());
            }
        }

        let policies = self.store.query(phone_id).await?;
        let mut by_app: HashMap<String, ResolvedRule> = HashMap::new();

        for policy in policies {
            if policy.status != PolicyStatus::Active {
                continue;
            }
            if !policy.time_windows.is_empty() && !policy.time_windows.iter().any(|w| window_contains(w, now)) {
                continue;
            }
            for app in policy.blocked_apps {
                // Last writer wins on (appName) conflict across policies.
                by_app.insert(
                    app.app_name.clone(),
                    ResolvedRule {
                        policy_id: policy.policy_id.clone(),
                        app_name: app.app_name,
                        ports: app.ports,
                    },
                );
            }
        }

        let rules: Vec<ResolvedRule> = by_app.into_values().collect();
        self.cache
            .write()
            .await
            .insert(phone_id.to_owned(), CacheEntry { rules: rules.clone(), cached_at: Instant::now() });
        Ok(rules)
    }

    /// Reserved hook for policy-change CDC: drops the cached entry for
    /// `phone_id` so the next `resolve` re-queries the store.
    pub async fn invalidate(&self, phone_id: &str) {
        self.cache.write().await.remove(phone_id);
    }
}

fn window_contains(window: &TimeWindow, now: chrono::DateTime<chrono::Utc>) -> bool {
    let weekday = weekday_code(now.naive_utc().weekday());
    if !window.weekdays.iter().any(|d| d.eq_ignore_ascii_case(weekday)) {
        return false;
    }

    let (Some(start), Some(end)) =
        (chrono::NaiveTime::parse_from_str(&window.start, "%H:%M").ok(), chrono::NaiveTime::parse_from_str(&window.end, "%H:%M").ok())
    else {
        return false;
    };

    let time = now.naive_utc().time();
    if start <= end {
        time >= start && time < end
    } else {
        // Window wraps past midnight, e.g. 22:00-06:00.
        time >= start || time < end
    }
}

fn weekday_code(day: chrono::Weekday) -> &'static str {
    use chrono::Weekday::*;
    match day {
        Mon => "MON",
        Tue => "TUE",
        Wed => "WED",
        Thu => "THU",
        Fri => "FRI",
        Sat => "SAT",
        Sun => "SUN",
    }
}

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod tests;
