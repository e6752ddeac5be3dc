//! Client side of the subscription-plan usage authority.
//!
//! Tenant usage counters live with the plan service, never in this process.
//! The engine asks before every booking and treats the answer as final.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaResource {
    SessionsPerMonth,
}

impl QuotaResource {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaResource::SessionsPerMonth => "sessionsPerMonth",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub used: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub usage: Option<QuotaUsage>,
}

impl QuotaDecision {
    pub fn allow() -> Self {
        Self { allowed: true, reason: None, usage: None }
    }

    pub fn block(reason: impl Into<String>, usage: Option<QuotaUsage>) -> Self {
        Self { allowed: false, reason: Some(reason.into()), usage }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("plan usage service unavailable: {0}")]
pub struct PlanUnavailable(pub String);

#[async_trait]
pub trait PlanUsage: Send + Sync + 'static {
    async fn check_quota(
        &self,
        tenant_id: &str,
        resource: QuotaResource,
    ) -> Result<QuotaDecision, PlanUnavailable>;
}

/// Binding for deployments without plan enforcement.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedPlan;

#[async_trait]
impl PlanUsage for UnlimitedPlan {
    async fn check_quota(
        &self,
        _tenant_id: &str,
        _resource: QuotaResource,
    ) -> Result<QuotaDecision, PlanUnavailable> {
        Ok(QuotaDecision::allow())
    }
}
