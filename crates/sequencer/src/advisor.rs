//! Decision advisor adapters.
//!
//! The HTTP advisor posts the follow-up and the step that was just sent to a
//! decision service and expects an [`AdvisorDecision`] back:
//! `{"action": "jump", "target_stage": "<uuid>", "reason": "..."}`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use followup_core::advisor::{AdvisorDecision, DecisionAdvisor};
use followup_core::config::AdvisorConfig;
use followup_core::types::{FollowUpInstance, StepDefinition};

/// Always continues.
pub struct NoopAdvisor;

#[async_trait]
impl DecisionAdvisor for NoopAdvisor {
    async fn decide(
        &self,
        _follow_up: &FollowUpInstance,
        _step: &StepDefinition,
    ) -> Result<AdvisorDecision> {
        Ok(AdvisorDecision::proceed())
    }
}

#[derive(Serialize)]
struct DecisionRequest<'a> {
    follow_up_id: String,
    campaign_id: String,
    client_id: &'a str,
    current_stage_id: Option<String>,
    current_step_index: usize,
    last_response: Option<&'a str>,
    metadata: &'a serde_json::Map<String, serde_json::Value>,
    step: &'a StepDefinition,
}

/// JSON-over-HTTP decision service client.
pub struct HttpDecisionAdvisor {
    endpoint: String,
    client: Client,
}

impl HttpDecisionAdvisor {
    pub fn new(endpoint: impl Into<String>, timeout_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| anyhow!("Failed to create advisor HTTP client: {}", e))?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl DecisionAdvisor for HttpDecisionAdvisor {
    async fn decide(
        &self,
        follow_up: &FollowUpInstance,
        step: &StepDefinition,
    ) -> Result<AdvisorDecision> {
        let request = DecisionRequest {
            follow_up_id: follow_up.id.to_string(),
            campaign_id: follow_up.campaign_id.to_string(),
            client_id: &follow_up.client_id,
            current_stage_id: follow_up.current_stage_id.map(|s| s.to_string()),
            current_step_index: follow_up.current_step_index,
            last_response: follow_up.last_response.as_deref(),
            metadata: &follow_up.metadata,
            step,
        };

        debug!(endpoint = %self.endpoint, follow_up_id = %follow_up.id, "Requesting advisor decision");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!("Advisor request failed: {}", e);
                anyhow!("advisor request failed: {}", e)
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("advisor returned error status {}: {}", status, body));
        }

        response.json::<AdvisorDecision>().await.map_err(|e| {
            warn!("Failed to parse advisor response: {}", e);
            anyhow!("failed to parse advisor response: {}", e)
        })
    }
}

/// Builds the configured advisor, or `None` when advice is disabled.
pub fn build_advisor(config: &AdvisorConfig) -> Result<Option<Arc<dyn DecisionAdvisor>>> {
    if !config.enabled {
        return Ok(None);
    }
    match &config.endpoint {
        Some(endpoint) => {
            info!(endpoint = %endpoint, timeout_ms = config.timeout_ms, "HTTP decision advisor enabled");
            let advisor = HttpDecisionAdvisor::new(endpoint.clone(), config.timeout_ms)?;
            Ok(Some(Arc::new(advisor)))
        }
        None => {
            warn!("Advisor enabled without an endpoint, using no-op advisor");
            Ok(Some(Arc::new(NoopAdvisor)))
        }
    }
}
