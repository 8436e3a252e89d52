// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Policy Resolver (§4.C): looks up currently-enforceable app rules for a
//! subscriber, filtering by status and time window, with a short-TTL cache
//! to absorb bursty SESSION_START storms.

mod resolver;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::PipelineError;
use crate::model::Policy;

pub use resolver::PolicyResolver;

/// CRUD contract the Resolver consumes from the externally-owned policy
/// store (§6: partitioned by `phoneId`, `query(phoneId) -> list<PolicyItem>`).
///
/// The core never writes policies; it only reads them.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn query(&self, phone_id: &str) -> Result<Vec<Policy>, PipelineError>;
}

/// A policy store backed by an in-process map, for tests and local runs.
#[derive(Default, Clone)]
pub struct InMemoryPolicyStore {
    policies: Arc<RwLock<HashMap<String, Vec<Policy>>>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, policy: Policy) {
        let mut policies = self.policies.write().await;
        policies.entry(policy.subscriber_phone_id.clone()).or_default().push(policy);
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn query(&self, phone_id: &str) -> Result<Vec<Policy>, PipelineError> {
        Ok(self.policies.read().await.get(phone_id).cloned().unwrap_or_default())
    }
}

/// Blanket impl so a composition root can hand the Resolver
/// `Arc<dyn PolicyStore>` without `PolicyResolver` being generic over the
/// store implementation chosen at runtime.
#[async_trait]
impl<T: PolicyStore + ?Sized> PolicyStore for Arc<T> {
    async fn query(&self, phone_id: &str) -> Result<Vec<Policy>, PipelineError> {
        (**self).query(phone_id).await
    }
}
