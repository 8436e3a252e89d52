// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared data model: sessions, policies, enforcement tasks, rule mappings,
//! history, and counters (§3).

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Active,
    Terminated,
}

/// A subscriber's mobile data-bearer session.
///
/// Owned exclusively by the Session Index; every other component only
/// ever carries `subscriber_id` / `phone_id` as opaque keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub subscriber_id: String,
    pub phone_id: String,
    pub private_address: IpAddr,
    pub public_address: IpAddr,
    pub created_at: i64,
    pub last_seen_at: i64,
    pub status: SessionStatus,
}

/// Status of a [`Policy`] as stored externally. Only `Active` policies
/// are ever enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyStatus {
    Active,
    Inactive,
    Suspended,
}

/// A single `(protocol, port)` pair that makes up part of a blocked app rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRule {
    pub protocol: Protocol,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

/// A blocked application and the ports it occupies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRule {
    pub app_name: String,
    pub ports: Vec<PortRule>,
}

/// An optional gating window: a policy with no windows is always-on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// `HH:MM`, 24-hour, local to the policy.
    pub start: String,
    /// `HH:MM`, 24-hour, local to the policy.
    pub end: String,
    /// ISO weekday abbreviations, e.g. `MON`, `TUE`.
    pub weekdays: Vec<String>,
}

/// A parental-control policy as read from the (externally owned) policy store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: String,
    pub subscriber_phone_id: String,
    pub blocked_apps: Vec<AppRule>,
    pub time_windows: Vec<TimeWindow>,
    pub status: PolicyStatus,
}

/// The kind of enforcement action an [`EnforcementTask`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Install,
    Migrate,
    Remove,
}

/// A single `(policyId, appName, ports)` tuple resolved as currently
/// enforceable for a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRule {
    pub policy_id: String,
    pub app_name: String,
    pub ports: Vec<PortRule>,
}

/// Unit of work handed from the Dispatcher to the Executor.
#[derive(Debug, Clone)]
pub struct EnforcementTask {
    pub subscriber_id: String,
    pub phone_id: String,
    pub event_kind: EventKind,
    pub current_address: IpAddr,
    pub previous_address: Option<IpAddr>,
    pub policies: Vec<ResolvedRule>,
    /// Number of times this task has already been attempted (0 on first try).
    pub attempt: u32,
}

/// Status of an installed rule mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingStatus {
    Active,
    Orphan,
}

/// The persisted association between a rule on the facade and the
/// session/subscriber/policy it was created for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMapping {
    pub phone_id: String,
    pub rule_id: String,
    pub address: IpAddr,
    pub app_name: String,
    pub policy_id: String,
    pub status: MappingStatus,
    pub created_at: i64,
    pub last_verified_at: i64,
}

/// Outcome of a single enforcement action, for the append-only audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Block,
    Update,
    Unblock,
}

/// A single row of the append-only enforcement audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub phone_id: String,
    pub timestamp: i64,
    pub action: HistoryAction,
    pub app_name: String,
    pub address: IpAddr,
    pub rule_id: Option<String>,
    pub status: HistoryStatus,
    pub error_kind: Option<String>,
}

/// Per-`(phoneId, date, appName)` aggregate used by the parent dashboard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockedCounter {
    pub count: u64,
    /// Hour-of-day (0-23) histogram.
    pub hourly: [u64; 24],
}

impl BlockedCounter {
    pub fn record(&mut self, hour: u8) {
        self.count += 1;
        if let Some(slot) = self.hourly.get_mut(hour as usize) {
            *slot += 1;
        }
    }
}
