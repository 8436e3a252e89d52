// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Configuration surface (§6), derived as a `clap::Parser` so it can be
//! parsed from environment variables or CLI flags identically.

use std::time::Duration;

/// How the event source transport authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSecurity {
    Plaintext,
    SaslSsl,
}

#[derive(Debug, Clone, clap::Parser)]
#[command(version, about = "Telecom parental-control enforcement pipeline")]
pub struct EnforcerConfig {
    /// Event source connection string (e.g. a NATS URL).
    #[arg(long, env = "EVENT_SOURCE_ADDR")]
    pub event_source_addr: String,

    /// Subject/topic the session-event envelopes are published on.
    #[arg(long, env = "EVENT_SOURCE_TOPIC")]
    pub event_source_topic: String,

    /// Consumer group identifier (informational; the core runs a single
    /// sequential consumer regardless of group membership).
    #[arg(long, env = "CONSUMER_GROUP", default_value = "enforcer")]
    pub consumer_group: String,

    #[arg(long, value_enum, env = "EVENT_SECURITY", default_value = "plaintext")]
    pub event_security: EventSecurity,

    /// Optional bearer token for the event source, required when
    /// `event_security` is not `Plaintext`.
    #[arg(long, env = "EVENT_SOURCE_TOKEN")]
    pub event_source_token: Option<String>,

    /// Base URL of the rule facade.
    #[arg(long, env = "FACADE_URL")]
    pub facade_url: String,

    /// Per-call timeout against the rule facade, in seconds.
    #[arg(long, default_value_t = 30, env = "FACADE_TIMEOUT")]
    pub facade_timeout_secs: u64,

    /// Maximum retry attempts per enforcement task before it is dropped.
    #[arg(long, default_value_t = 5, env = "FACADE_MAX_RETRIES")]
    pub facade_max_retries: u32,

    /// Global cap on in-flight facade calls.
    #[arg(long, default_value_t = 32, env = "FACADE_MAX_INFLIGHT")]
    pub facade_max_inflight: usize,

    /// Number of Session Index shards.
    #[arg(long, default_value_t = 16, env = "INDEX_SHARDS")]
    pub index_shards: usize,

    /// Session expiry, in seconds, since `lastSeenAt`.
    #[arg(long, default_value_t = 3600, env = "SESSION_TTL")]
    pub session_ttl_secs: i64,

    /// Number of dispatcher worker tasks.
    #[arg(long, default_value_t = 8, env = "DISPATCH_WORKERS")]
    pub dispatch_workers: usize,

    /// Total bounded dispatcher queue depth across all subscribers.
    #[arg(long, default_value_t = 10_000, env = "DISPATCH_QUEUE_CAP")]
    pub dispatch_queue_cap: usize,

    /// How long the consumer blocks waiting for dispatcher queue room
    /// before treating the enqueue as a retryable failure.
    #[arg(long, default_value_t = 5, env = "DISPATCH_BACKPRESSURE_TIMEOUT")]
    pub dispatch_backpressure_timeout_secs: u64,

    /// Policy Resolver cache TTL, in seconds.
    #[arg(long, default_value_t = 30, env = "POLICY_CACHE_TTL")]
    pub policy_cache_ttl_secs: u64,

    /// Reconciliation sweep interval, in seconds.
    #[arg(long, default_value_t = 300, env = "RECONCILE_INTERVAL")]
    pub reconcile_interval_secs: u64,

    /// How stale a mapping's `lastVerifiedAt` must be before the sweep
    /// re-verifies it, in seconds.
    #[arg(long, default_value_t = 900, env = "VERIFY_STALENESS")]
    pub verify_staleness_secs: u64,

    /// Maximum mappings the sweep verifies per tick.
    #[arg(long, default_value_t = 200, env = "RECONCILE_BATCH_SIZE")]
    pub reconcile_batch_size: usize,

    /// How long the pipeline waits for in-flight tasks to drain on shutdown.
    #[arg(long, default_value_t = 60, env = "SHUTDOWN_GRACE")]
    pub shutdown_grace_secs: u64,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl EnforcerConfig {
    pub fn facade_timeout(&self) -> Duration {
        Duration::from_secs(self.facade_timeout_secs)
    }

    pub fn dispatch_backpressure_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_backpressure_timeout_secs)
    }

    pub fn policy_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.policy_cache_ttl_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn verify_staleness(&self) -> Duration {
        Duration::from_secs(self.verify_staleness_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs)
    }

    /// Cross-field checks clap's per-flag validation can't express.
    /// Failures here map to exit code `2` (fatal configuration) rather
    /// than `1` (fatal startup), per §6.
    pub fn validate(&self) -> Result<(), String> {
        if self.event_security != EventSecurity::Plaintext && self.event_source_token.is_none() {
            return Err("EVENT_SOURCE_TOKEN is required when EVENT_SECURITY is not PLAINTEXT".to_owned());
        }
        if self.facade_max_inflight == 0 {
            return Err("FACADE_MAX_INFLIGHT must be at least 1".to_owned());
        }
        if self.dispatch_workers == 0 {
            return Err("DISPATCH_WORKERS must be at least 1".to_owned());
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
