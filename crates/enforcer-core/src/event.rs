// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session-event envelope decoding (§6 ingress contract).
//!
//! Unknown event kinds and missing mandatory fields are rejected here,
//! at decode time, rather than propagated as "session-like dicts" further
//! down the pipeline.

use std::net::IpAddr;

use serde::Deserialize;

use crate::error::PipelineError;

/// The wire envelope exactly as it arrives from the event source.
///
/// Field presence is validated on decode; event-specific fields are
/// `Option` here only because their presence depends on `event_type`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub timestamp: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "subscriberId")]
    pub subscriber_id: String,
    #[serde(rename = "phoneId")]
    pub phone_id: String,
    #[serde(rename = "privateIP")]
    pub private_ip: Option<String>,
    #[serde(rename = "publicIP")]
    pub public_ip: Option<String>,
    #[serde(rename = "oldPrivateIP")]
    pub old_private_ip: Option<String>,
    #[serde(rename = "newPrivateIP")]
    pub new_private_ip: Option<String>,
    #[serde(rename = "oldPublicIP")]
    pub old_public_ip: Option<String>,
    #[serde(rename = "newPublicIP")]
    pub new_public_ip: Option<String>,
}

/// A decoded, type-safe session event. Replaces the envelope's stringly
/// typed fields with a closed set of variants once validated.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    SessionStart {
        session_id: String,
        subscriber_id: String,
        phone_id: String,
        private_address: IpAddr,
        public_address: IpAddr,
        timestamp: i64,
    },
    SessionEnd {
        session_id: String,
        subscriber_id: String,
        phone_id: String,
        timestamp: i64,
    },
    IpChange {
        session_id: String,
        subscriber_id: String,
        phone_id: String,
        old_private_address: IpAddr,
        new_private_address: IpAddr,
        new_public_address: IpAddr,
        timestamp: i64,
    },
}

impl SessionEvent {
    pub fn phone_id(&self) -> &str {
        match self {
            Self::SessionStart { phone_id, .. }
            | Self::SessionEnd { phone_id, .. }
            | Self::IpChange { phone_id, .. } => phone_id,
        }
    }

    pub fn subscriber_id(&self) -> &str {
        match self {
            Self::SessionStart { subscriber_id, .. }
            | Self::SessionEnd { subscriber_id, .. }
            | Self::IpChange { subscriber_id, .. } => subscriber_id,
        }
    }
}

fn parse_ip(field: &str, value: Option<&str>) -> Result<IpAddr, PipelineError> {
    let value = value.ok_or_else(|| PipelineError::malformed(format!("missing field: {field}")))?;
    value
        .parse()
        .map_err(|_| PipelineError::malformed(format!("invalid IP address in {field}: {value}")))
}

fn parse_timestamp(raw: &str) -> Result<i64, PipelineError> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| PipelineError::malformed(format!("invalid timestamp: {raw}")))
}

/// Decode and validate a raw JSON payload into a [`SessionEvent`].
///
/// Any missing mandatory field, unparseable address, or unknown
/// `eventType` yields a [`crate::error::ErrorKind::Malformed`] error —
/// callers route these to the dead-letter destination.
pub fn decode(payload: &[u8]) -> Result<SessionEvent, PipelineError> {
    let envelope: RawEnvelope = serde_json::from_slice(payload)?;

    if envelope.subscriber_id.is_empty() {
        return Err(PipelineError::malformed("missing field: subscriberId"));
    }
    if envelope.phone_id.is_empty() {
        return Err(PipelineError::malformed("missing field: phoneId"));
    }

    let timestamp = parse_timestamp(&envelope.timestamp)?;

    match envelope.event_type.as_str() {
        "SESSION_START" => Ok(SessionEvent::SessionStart {
            session_id: envelope.session_id,
            subscriber_id: envelope.subscriber_id,
            phone_id: envelope.phone_id,
            private_address: parse_ip("privateIP", envelope.private_ip.as_deref())?,
            public_address: parse_ip("publicIP", envelope.public_ip.as_deref())?,
            timestamp,
        }),
        "SESSION_END" => Ok(SessionEvent::SessionEnd {
            session_id: envelope.session_id,
            subscriber_id: envelope.subscriber_id,
            phone_id: envelope.phone_id,
            timestamp,
        }),
        "IP_CHANGE" => Ok(SessionEvent::IpChange {
            session_id: envelope.session_id,
            subscriber_id: envelope.subscriber_id,
            phone_id: envelope.phone_id,
            old_private_address: parse_ip("oldPrivateIP", envelope.old_private_ip.as_deref())?,
            new_private_address: parse_ip("newPrivateIP", envelope.new_private_ip.as_deref())?,
            new_public_address: parse_ip("newPublicIP", envelope.new_public_ip.as_deref())?,
            timestamp,
        }),
        other => Err(PipelineError::malformed(format!("unknown eventType: {other}"))),
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
