//! Persistence contract of the sequencing engine.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use followup_core::error::FollowUpResult;
use followup_core::types::{
    CampaignId, DeliveryStatus, FollowUpId, FollowUpInstance, FunnelStage, MessageId,
    MessageRecord, ScheduledJob,
};

/// A campaign as stored: its stages plus the raw, not yet normalized step
/// payload. `steps` is `None` for campaigns that only have a legacy import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub id: CampaignId,
    pub name: String,
    pub stages: Vec<FunnelStage>,
    #[serde(default)]
    pub steps: Option<serde_json::Value>,
}

/// One row of the legacy flat import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyStepRecord {
    /// Stage name or numeric order as authored in the spreadsheet.
    pub stage: String,
    pub message: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub wait_time: Option<String>,
    #[serde(default)]
    pub template_name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub auto_respond: bool,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Durable state shared by the scheduler, the sequencer, the response
/// handler and the manual control surface.
///
/// `update_follow_up` is the only write path for existing follow-ups and is
/// conditional: it succeeds only when the stored version equals the version
/// carried by the instance, and bumps the version on success.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    async fn get_follow_up(&self, id: FollowUpId) -> FollowUpResult<Option<FollowUpInstance>>;

    async fn insert_follow_up(&self, follow_up: FollowUpInstance) -> FollowUpResult<()>;

    /// Returns `Ok(false)` when another writer got there first.
    async fn update_follow_up(&self, follow_up: &mut FollowUpInstance) -> FollowUpResult<bool>;

    async fn follow_ups_for_client(
        &self,
        client_id: &str,
    ) -> FollowUpResult<Vec<FollowUpInstance>>;

    async fn active_follow_ups(&self) -> FollowUpResult<Vec<FollowUpInstance>>;

    async fn get_campaign(&self, id: CampaignId) -> FollowUpResult<Option<CampaignRecord>>;

    async fn legacy_import(&self, id: CampaignId) -> FollowUpResult<Vec<LegacyStepRecord>>;

    async fn append_message(&self, record: MessageRecord) -> FollowUpResult<()>;

    /// Returns the updated record, or `None` if the id is unknown.
    async fn update_message_status(
        &self,
        id: MessageId,
        status: DeliveryStatus,
        error: Option<String>,
    ) -> FollowUpResult<Option<MessageRecord>>;

    async fn find_message_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> FollowUpResult<Option<MessageRecord>>;

    /// Messages of a follow-up in creation order.
    async fn messages_for(&self, follow_up_id: FollowUpId) -> FollowUpResult<Vec<MessageRecord>>;

    /// Stores the job, replacing any previous job of the same follow-up.
    async fn put_job(&self, job: ScheduledJob) -> FollowUpResult<()>;

    async fn remove_job(&self, follow_up_id: FollowUpId) -> FollowUpResult<()>;

    /// Removes the job only if it still carries `generation`.
    async fn remove_job_generation(
        &self,
        follow_up_id: FollowUpId,
        generation: u64,
    ) -> FollowUpResult<bool>;

    async fn pending_jobs(&self) -> FollowUpResult<Vec<ScheduledJob>>;
}
