//! Contract of the optional decision advisor consulted after each dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{FollowUpInstance, StageId, StepDefinition};

/// What the advisor wants the sequencer to do instead of the default move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdvisorAction {
    Continue,
    Skip { target_step: usize },
    Jump { target_stage: StageId },
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisorDecision {
    #[serde(flatten)]
    pub action: AdvisorAction,
    #[serde(default)]
    pub reason: Option<String>,
}

impl AdvisorDecision {
    pub fn proceed() -> Self {
        Self {
            action: AdvisorAction::Continue,
            reason: None,
        }
    }

    pub fn with_reason(action: AdvisorAction, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: Some(reason.into()),
        }
    }
}

/// Decides whether a follow-up should deviate from its default path after
/// `step` was sent. Errors are treated as [`AdvisorAction::Continue`].
#[async_trait]
pub trait DecisionAdvisor: Send + Sync {
    async fn decide(
        &self,
        follow_up: &FollowUpInstance,
        step: &StepDefinition,
    ) -> anyhow::Result<AdvisorDecision>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_decision_wire_format() {
        let stage = Uuid::new_v4();
        let json = format!(
            r#"{{"action":"jump","target_stage":"{}","reason":"asked for price"}}"#,
            stage
        );
        let decision: AdvisorDecision = serde_json::from_str(&json).unwrap();
        assert_eq!(decision.action, AdvisorAction::Jump { target_stage: stage });
        assert_eq!(decision.reason.as_deref(), Some("asked for price"));

        let decision: AdvisorDecision = serde_json::from_str(r#"{"action":"continue"}"#).unwrap();
        assert_eq!(decision, AdvisorDecision::proceed());

        let decision: AdvisorDecision =
            serde_json::from_str(r#"{"action":"skip","target_step":4}"#).unwrap();
        assert_eq!(decision.action, AdvisorAction::Skip { target_step: 4 });
    }
}
