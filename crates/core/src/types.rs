use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub type FollowUpId = Uuid;
pub type CampaignId = Uuid;
pub type StageId = Uuid;
pub type StepId = Uuid;
pub type MessageId = Uuid;

/// Metadata key holding the marker left by the response handler.
pub const META_PROCESSED_BY_RESPONSE: &str = "processed_by_response";
/// Metadata key set when a response arrived while stage messages were in flight.
pub const META_PENDING_RESPONSE_JUMP: &str = "pending_response_jump";
/// Metadata key that disables the decision advisor for one follow-up.
pub const META_AI_DECISIONS: &str = "ai_decisions";
/// Metadata key with the `{{variable}}` values used to render step templates.
pub const META_VARIABLES: &str = "variables";

// ─── Campaign definition ────────────────────────────────────────────────────

/// An ordered phase of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelStage {
    pub id: StageId,
    pub name: String,
    pub order: i32,
}

/// A single scheduled message within a stage, in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: StepId,
    pub stage_id: StageId,
    pub message: String,
    /// The delay expression as authored ("30m", "2 horas").
    pub delay: String,
    pub wait_time_ms: u64,
    pub template_name: Option<String>,
    pub category: Option<String>,
    pub auto_respond: bool,
}

/// A campaign with its stages and steps, both sorted for traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignDefinition {
    pub id: CampaignId,
    pub name: String,
    pub stages: Vec<FunnelStage>,
    pub steps: Vec<StepDefinition>,
}

impl CampaignDefinition {
    pub fn stage(&self, id: StageId) -> Option<&FunnelStage> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_order(&self, id: StageId) -> Option<i32> {
        self.stage(id).map(|s| s.order)
    }

    pub fn stage_name(&self, id: StageId) -> String {
        self.stage(id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Index of the first step belonging to `stage_id`.
    pub fn first_step_of_stage(&self, stage_id: StageId) -> Option<usize> {
        self.steps.iter().position(|s| s.stage_id == stage_id)
    }

    /// The first stage ordered strictly after `stage_id` that owns at least
    /// one step, together with the index of that step.
    pub fn next_stage_after(&self, stage_id: StageId) -> Option<(&FunnelStage, usize)> {
        let current_order = self.stage_order(stage_id)?;
        let mut later: Vec<&FunnelStage> = self
            .stages
            .iter()
            .filter(|s| s.order > current_order)
            .collect();
        later.sort_by_key(|s| s.order);
        later
            .into_iter()
            .find_map(|stage| self.first_step_of_stage(stage.id).map(|idx| (stage, idx)))
    }

    /// True when `candidate` is ordered after `current`. Unknown stages never
    /// count as later.
    pub fn is_later_stage(&self, candidate: StageId, current: StageId) -> bool {
        match (self.stage_order(candidate), self.stage_order(current)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        }
    }
}

// ─── Follow-up instance ─────────────────────────────────────────────────────

/// Lifecycle status of a follow-up instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpStatus {
    Active,
    Paused,
    Completed,
    Canceled,
}

impl FollowUpStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FollowUpStatus::Completed | FollowUpStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FollowUpStatus::Active => "active",
            FollowUpStatus::Paused => "paused",
            FollowUpStatus::Completed => "completed",
            FollowUpStatus::Canceled => "canceled",
        }
    }
}

/// Left in metadata after a client response re-routed the follow-up, so that
/// duplicate deliveries of the same response and stale timers can be told
/// apart from new activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMarker {
    pub fingerprint: String,
    pub stage_id: Option<StageId>,
    pub at: DateTime<Utc>,
}

/// One client's running execution of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpInstance {
    pub id: FollowUpId,
    pub campaign_id: CampaignId,
    pub client_id: String,
    pub status: FollowUpStatus,
    pub current_stage_id: Option<StageId>,
    /// Index of the next step to dispatch.
    pub current_step_index: usize,
    pub next_message_at: Option<DateTime<Utc>>,
    pub waiting_for_response: bool,
    pub last_response: Option<String>,
    pub last_response_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Bumped by the store on every successful conditional update.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FollowUpInstance {
    pub fn new(
        campaign_id: CampaignId,
        client_id: impl Into<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            client_id: client_id.into(),
            status: FollowUpStatus::Active,
            current_stage_id: None,
            current_step_index: 0,
            next_message_at: Some(now),
            waiting_for_response: false,
            last_response: None,
            last_response_at: None,
            metadata,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Variables available to step templates: everything under
    /// `metadata.variables` plus `client_id`.
    pub fn template_variables(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("client_id".to_string(), self.client_id.clone());
        if let Some(serde_json::Value::Object(map)) = self.metadata.get(META_VARIABLES) {
            for (key, value) in map {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => continue,
                    other => other.to_string(),
                };
                vars.insert(key.clone(), rendered);
            }
        }
        vars
    }

    /// The advisor is consulted unless metadata explicitly opts out.
    pub fn ai_decisions_enabled(&self) -> bool {
        self.metadata
            .get(META_AI_DECISIONS)
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }

    pub fn response_marker(&self) -> Option<ResponseMarker> {
        self.metadata
            .get(META_PROCESSED_BY_RESPONSE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set_response_marker(&mut self, marker: ResponseMarker) {
        if let Ok(value) = serde_json::to_value(marker) {
            self.metadata
                .insert(META_PROCESSED_BY_RESPONSE.to_string(), value);
        }
    }

    /// True when `message` repeats the reply recorded in the response
    /// marker. A provider event id identifies one event, so a matching id is
    /// always a redelivery. Replies without an id only match on client and
    /// text, and only while the stage is unchanged and within `window_ms` of
    /// the reply that was handled; after that the same words are a new reply.
    pub fn is_redelivery(&self, message: &InboundMessage, window_ms: u64) -> bool {
        let Some(marker) = self.response_marker() else {
            return false;
        };
        if marker.fingerprint != message.fingerprint() {
            return false;
        }
        if message.event_id.is_some() {
            return true;
        }
        let elapsed = message.received_at.signed_duration_since(marker.at);
        marker.stage_id == self.current_stage_id
            && elapsed.num_milliseconds() < i64::try_from(window_ms).unwrap_or(i64::MAX)
    }

    pub fn pending_response_jump(&self) -> bool {
        self.metadata
            .get(META_PENDING_RESPONSE_JUMP)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn set_pending_response_jump(&mut self, pending: bool) {
        if pending {
            self.metadata
                .insert(META_PENDING_RESPONSE_JUMP.to_string(), true.into());
        } else {
            self.metadata.remove(META_PENDING_RESPONSE_JUMP);
        }
    }
}

// ─── Messages ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Outbound,
    Inbound,
    System,
}

/// Delivery state of a message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Accepted for sending, not yet confirmed by the provider.
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
    /// Inbound messages from the client.
    Received,
    /// System-authored audit entries.
    Recorded,
}

impl DeliveryStatus {
    pub fn is_delivered(&self) -> bool {
        matches!(
            self,
            DeliveryStatus::Sent | DeliveryStatus::Delivered | DeliveryStatus::Read
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, DeliveryStatus::Pending)
    }

    /// Maps provider callback vocabulary onto delivery states.
    pub fn from_provider(status: &str) -> Option<Self> {
        match status.to_ascii_lowercase().as_str() {
            "queued" | "accepted" | "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            "failed" | "undelivered" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// Append-only audit record of everything said within a follow-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub follow_up_id: FollowUpId,
    pub step_id: Option<StepId>,
    pub stage_id: Option<StageId>,
    pub content: String,
    pub direction: MessageDirection,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn outbound(
        follow_up_id: FollowUpId,
        step: &StepDefinition,
        content: String,
        result: &DeliveryResult,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            follow_up_id,
            step_id: Some(step.id),
            stage_id: Some(step.stage_id),
            content,
            direction: MessageDirection::Outbound,
            status: result.status,
            provider_message_id: result.provider_message_id.clone(),
            error: result.error.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn inbound(follow_up_id: FollowUpId, stage_id: Option<StageId>, content: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            follow_up_id,
            step_id: None,
            stage_id,
            content: content.to_string(),
            direction: MessageDirection::Inbound,
            status: DeliveryStatus::Received,
            provider_message_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn system(follow_up_id: FollowUpId, stage_id: Option<StageId>, content: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            follow_up_id,
            step_id: None,
            stage_id,
            content,
            direction: MessageDirection::System,
            status: DeliveryStatus::Recorded,
            provider_message_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == MessageDirection::Outbound
    }
}

// ─── Dispatch ───────────────────────────────────────────────────────────────

/// Template metadata handed to the dispatch gateway alongside the rendered text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateMeta {
    pub campaign_id: CampaignId,
    pub follow_up_id: FollowUpId,
    pub step_id: StepId,
    pub template_name: Option<String>,
    pub category: Option<String>,
    pub auto_respond: bool,
}

impl TemplateMeta {
    pub fn for_step(follow_up: &FollowUpInstance, step: &StepDefinition) -> Self {
        Self {
            campaign_id: follow_up.campaign_id,
            follow_up_id: follow_up.id,
            step_id: step.id,
            template_name: step.template_name.clone(),
            category: step.category.clone(),
            auto_respond: step.auto_respond,
        }
    }
}

/// What the dispatch gateway reports back for one send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

impl DeliveryResult {
    pub fn sent(provider_message_id: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Sent,
            provider_message_id: Some(provider_message_id.into()),
            error: None,
        }
    }

    pub fn pending(provider_message_id: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Pending,
            provider_message_id: Some(provider_message_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            provider_message_id: None,
            error: Some(error.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == DeliveryStatus::Failed
    }
}

// ─── Inbound ────────────────────────────────────────────────────────────────

/// A normalized "client replied" event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub client_id: String,
    pub text: String,
    /// Provider event id, when the channel supplies one.
    pub event_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(client_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            text: text.into(),
            event_id: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    /// Identity used to recognize redelivered events: the provider event id
    /// when present, otherwise a digest of client and text.
    pub fn fingerprint(&self) -> String {
        if let Some(event_id) = &self.event_id {
            return format!("event:{}", event_id);
        }
        let mut hasher = Sha256::new();
        hasher.update(self.client_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.text.trim().as_bytes());
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}

// ─── Scheduling ─────────────────────────────────────────────────────────────

/// A persisted timer: the due time of the next transition of one follow-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub follow_up_id: FollowUpId,
    pub target_index: usize,
    pub due_at: DateTime<Utc>,
    pub generation: u64,
    pub armed_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn stage(order: i32, name: &str) -> FunnelStage {
        FunnelStage {
            id: Uuid::new_v4(),
            name: name.to_string(),
            order,
        }
    }

    fn step(stage: &FunnelStage, wait: u64) -> StepDefinition {
        StepDefinition {
            id: Uuid::new_v4(),
            stage_id: stage.id,
            message: "hi".to_string(),
            delay: format!("{}ms", wait),
            wait_time_ms: wait,
            template_name: None,
            category: None,
            auto_respond: false,
        }
    }

    #[test]
    fn test_next_stage_skips_empty_stages() {
        let first = stage(1, "first");
        let empty = stage(2, "empty");
        let third = stage(3, "third");
        let campaign = CampaignDefinition {
            id: Uuid::new_v4(),
            name: "c".to_string(),
            stages: vec![first.clone(), empty, third.clone()],
            steps: vec![step(&first, 0), step(&third, 0)],
        };

        let (next, idx) = campaign.next_stage_after(first.id).unwrap();
        assert_eq!(next.id, third.id);
        assert_eq!(idx, 1);
        assert!(campaign.next_stage_after(third.id).is_none());
        assert!(campaign.is_later_stage(third.id, first.id));
    }

    #[test]
    fn test_fingerprint_prefers_event_id() {
        let a = InboundMessage::new("client-1", "sim");
        let b = InboundMessage::new("client-1", " sim ");
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = InboundMessage::new("client-1", "sim").with_event_id("wamid.1");
        assert_eq!(c.fingerprint(), "event:wamid.1");
        assert_ne!(a.fingerprint(), InboundMessage::new("client-2", "sim").fingerprint());
    }

    #[test]
    fn test_template_variables_from_metadata() {
        let mut metadata = serde_json::Map::new();
        metadata.insert(
            META_VARIABLES.to_string(),
            serde_json::json!({"client_name": "Ana", "visits": 3, "gone": null}),
        );
        let follow_up = FollowUpInstance::new(Uuid::new_v4(), "5511999990000", metadata);
        let vars = follow_up.template_variables();

        assert_eq!(vars.get("client_name").unwrap(), "Ana");
        assert_eq!(vars.get("visits").unwrap(), "3");
        assert_eq!(vars.get("client_id").unwrap(), "5511999990000");
        assert!(!vars.contains_key("gone"));
    }

    #[test]
    fn test_response_marker_round_trip_and_duplicate_check() {
        let mut follow_up =
            FollowUpInstance::new(Uuid::new_v4(), "client", serde_json::Map::new());
        let stage_id = Uuid::new_v4();
        follow_up.current_stage_id = Some(stage_id);
        let redelivered = InboundMessage::new("client", "sim").with_event_id("1");
        follow_up.set_response_marker(ResponseMarker {
            fingerprint: redelivered.fingerprint(),
            stage_id: Some(stage_id),
            at: Utc::now(),
        });

        assert!(follow_up.is_redelivery(&redelivered, 10_000));
        let other = InboundMessage::new("client", "sim").with_event_id("2");
        assert!(!follow_up.is_redelivery(&other, 10_000));

        // Event ids stay duplicates after the stage moves on.
        follow_up.current_stage_id = Some(Uuid::new_v4());
        assert!(follow_up.is_redelivery(&redelivered, 10_000));
    }

    #[test]
    fn test_text_replies_repeat_only_within_window_and_stage() {
        let mut follow_up =
            FollowUpInstance::new(Uuid::new_v4(), "client", serde_json::Map::new());
        let stage_id = Uuid::new_v4();
        follow_up.current_stage_id = Some(stage_id);
        let first = InboundMessage::new("client", "ok");
        follow_up.set_response_marker(ResponseMarker {
            fingerprint: first.fingerprint(),
            stage_id: Some(stage_id),
            at: first.received_at,
        });

        let mut again = InboundMessage::new("client", " ok ");
        assert!(follow_up.is_redelivery(&again, 10_000));

        again.received_at = first.received_at + chrono::Duration::seconds(30);
        assert!(!follow_up.is_redelivery(&again, 10_000));

        again.received_at = first.received_at;
        follow_up.current_stage_id = Some(Uuid::new_v4());
        assert!(!follow_up.is_redelivery(&again, 10_000));
    }

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(
            DeliveryStatus::from_provider("Delivered"),
            Some(DeliveryStatus::Delivered)
        );
        assert_eq!(
            DeliveryStatus::from_provider("undelivered"),
            Some(DeliveryStatus::Failed)
        );
        assert_eq!(DeliveryStatus::from_provider("bogus"), None);
        assert!(DeliveryStatus::Sent.is_delivered());
        assert!(!DeliveryStatus::Pending.is_delivered());
    }
}
