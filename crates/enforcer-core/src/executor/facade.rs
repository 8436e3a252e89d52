// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rule facade client (§4.E, §6): the HTTP JSON contract the Executor
//! drives to create, update, delete, and verify firewall block rules on
//! the remote enforcement device.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ErrorKind, PipelineError};
use crate::model::{EventKind, PortRule};

/// Result of a successful `createBlock` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedRule {
    pub rule_id: String,
    pub rule_name: String,
}

/// The facade operations the Executor drives (§4.E).
#[async_trait]
pub trait RuleFacade: Send + Sync {
    async fn create_block(
        &self,
        source_ip: IpAddr,
        app_name: &str,
        ports: &[PortRule],
        phone_id: &str,
        idempotency_key: &str,
    ) -> Result<CreatedRule, PipelineError>;

    async fn update_block(&self, rule_id: &str, new_source_ip: IpAddr, idempotency_key: &str) -> Result<String, PipelineError>;

    async fn delete_block(&self, rule_id: &str, idempotency_key: &str) -> Result<(), PipelineError>;

    /// `true` if the rule still exists on the facade.
    async fn verify(&self, rule_id: &str) -> Result<bool, PipelineError>;
}

/// Deterministic idempotency key so the facade can de-duplicate retried
/// mutations (§4.E): `sha256(phoneId | appName | eventKind | address | attempt)`.
pub fn idempotency_key(phone_id: &str, app_name: &str, event_kind: EventKind, address: IpAddr, attempt: u32) -> String {
    let kind = match event_kind {
        EventKind::Install => "INSTALL",
        EventKind::Migrate => "MIGRATE",
        EventKind::Remove => "REMOVE",
    };
    let material = format!("{phone_id}|{app_name}|{kind}|{address}|{attempt}");
    let digest = Sha256::digest(material.as_bytes());
    hex::encode(digest)
}

#[derive(Serialize)]
struct PortWire {
    protocol: &'static str,
    port: u16,
}

impl From<&PortRule> for PortWire {
    fn from(rule: &PortRule) -> Self {
        let protocol = match rule.protocol {
            crate::model::Protocol::Tcp => "TCP",
            crate::model::Protocol::Udp => "UDP",
            crate::model::Protocol::Icmp => "ICMP",
        };
        PortWire { protocol, port: rule.port }
    }
}

#[derive(Serialize)]
struct CreateBlockRequest<'a> {
    #[serde(rename = "sourceIP")]
    source_ip: String,
    #[serde(rename = "appName")]
    app_name: &'a str,
    ports: Vec<PortWire>,
    #[serde(rename = "phoneId")]
    phone_id: &'a str,
}

#[derive(Deserialize)]
struct CreateBlockResponse {
    #[serde(rename = "ruleId")]
    rule_id: String,
    #[serde(rename = "ruleName")]
    rule_name: String,
}

#[derive(Serialize)]
struct UpdateBlockRequest {
    #[serde(rename = "newSourceIP")]
    new_source_ip: String,
}

#[derive(Deserialize)]
struct UpdateBlockResponse {
    #[serde(rename = "ruleId")]
    rule_id: String,
}

#[derive(Deserialize)]
struct VerifyResponse {
    status: String,
}

/// Production [`RuleFacade`]: a thin [`reqwest::Client`] wrapper that
/// attaches `X-Idempotency-Key` and classifies every response into the
/// closed [`crate::error::ErrorKind`] taxonomy.
pub struct HttpRuleFacade {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRuleFacade {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder().timeout(timeout).build().unwrap_or_default();
        Self { base_url: base_url.into(), client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn health(&self) -> Result<(), PipelineError> {
        let resp = self.client.get(self.url("/health")).send().await?;
        if !resp.status().is_success() {
            return Err(classify_error_response(resp));
        }
        Ok(())
    }
}

/// `Retry-After` is seconds-delta in practice for this facade; an
/// HTTP-date value is treated as absent rather than parsed.
fn parse_retry_after(resp: &reqwest::Response) -> Option<Duration> {
    let value = resp.headers().get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    value.parse::<u64>().ok().map(Duration::from_secs)
}

/// Classify a non-2xx response into a [`PipelineError`], capturing
/// `Retry-After` for a 429 before the response (and its headers) is consumed.
fn classify_error_response(resp: reqwest::Response) -> PipelineError {
    let status = resp.status();
    let retry_after = parse_retry_after(&resp);
    PipelineError::new(ErrorKind::from_status(status.as_u16(), retry_after), format!("facade returned {status}"))
}

#[async_trait]
impl RuleFacade for HttpRuleFacade {
    async fn create_block(
        &self,
        source_ip: IpAddr,
        app_name: &str,
        ports: &[PortRule],
        phone_id: &str,
        idempotency_key: &str,
    ) -> Result<CreatedRule, PipelineError> {
        let body = CreateBlockRequest {
            source_ip: source_ip.to_string(),
            app_name,
            ports: ports.iter().map(PortWire::from).collect(),
            phone_id,
        };
        let resp = self
            .client
            .post(self.url("/api/v1/rules/block"))
            .header("X-Idempotency-Key", idempotency_key)
            .json(&body)
            .send()
            .await?;

        // 409 means the facade already holds a rule for this idempotency
        // key; adopt its id rather than treating the call as a failure.
        if resp.status().as_u16() == 409 {
            let parsed: CreateBlockResponse = resp.json().await?;
            return Ok(CreatedRule { rule_id: parsed.rule_id, rule_name: parsed.rule_name });
        }
        if !resp.status().is_success() {
            return Err(classify_error_response(resp));
        }

        let parsed: CreateBlockResponse = resp.json().await?;
        Ok(CreatedRule { rule_id: parsed.rule_id, rule_name: parsed.rule_name })
    }

    async fn update_block(&self, rule_id: &str, new_source_ip: IpAddr, idempotency_key: &str) -> Result<String, PipelineError> {
        let body = UpdateBlockRequest { new_source_ip: new_source_ip.to_string() };
        let resp = self
            .client
            .put(self.url(&format!("/api/v1/rules/{rule_id}")))
            .header("X-Idempotency-Key", idempotency_key)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(classify_error_response(resp));
        }
        let parsed: UpdateBlockResponse = resp.json().await?;
        Ok(parsed.rule_id)
    }

    async fn delete_block(&self, rule_id: &str, idempotency_key: &str) -> Result<(), PipelineError> {
        let resp = self
            .client
            .delete(self.url(&format!("/api/v1/rules/{rule_id}")))
            .header("X-Idempotency-Key", idempotency_key)
            .send()
            .await?;

        // Already gone is as good as deleted.
        if resp.status().as_u16() == 404 {
            return Ok(());
        }
        if !resp.status().is_success() {
            return Err(classify_error_response(resp));
        }
        Ok(())
    }

    async fn verify(&self, rule_id: &str) -> Result<bool, PipelineError> {
        let resp = self.client.get(self.url(&format!("/api/v1/rules/{rule_id}"))).send().await;
        let resp = match resp {
            Ok(r) => r,
            Err(e) => return Err(e.into()),
        };
        if resp.status().as_u16() == 404 {
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Err(classify_error_response(resp));
        }
        let parsed: VerifyResponse = resp.json().await?;
        Ok(parsed.status == "active")
    }
}

/// Blanket impl so a composition root can hand the Executor
/// `Arc<dyn RuleFacade>` without the Executor being generic over the
/// facade implementation chosen at runtime.
#[async_trait]
impl<T: RuleFacade + ?Sized> RuleFacade for std::sync::Arc<T> {
    async fn create_block(
        &self,
        source_ip: IpAddr,
        app_name: &str,
        ports: &[PortRule],
        phone_id: &str,
        idempotency_key: &str,
    ) -> Result<CreatedRule, PipelineError> {
        (**self).create_block(source_ip, app_name, ports, phone_id, idempotency_key).await
    }

    async fn update_block(&self, rule_id: &str, new_source_ip: IpAddr, idempotency_key: &str) -> Result<String, PipelineError> {
        (**self).update_block(rule_id, new_source_ip, idempotency_key).await
    }

    async fn delete_block(&self, rule_id: &str, idempotency_key: &str) -> Result<(), PipelineError> {
        (**self).delete_block(rule_id, idempotency_key).await
    }

    async fn verify(&self, rule_id: &str) -> Result<bool, PipelineError> {
        (**self).verify(rule_id).await
    }
}

#[cfg(test)]
#[path = "facade_tests.rs"]
mod tests;
