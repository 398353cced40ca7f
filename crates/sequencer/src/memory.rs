//! In-memory `SequenceStore` backed by concurrent maps.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use followup_core::error::{FollowUpError, FollowUpResult};
use followup_core::types::{
    CampaignId, DeliveryStatus, FollowUpId, FollowUpInstance, FollowUpStatus, MessageId,
    MessageRecord, ScheduledJob,
};

use crate::store::{CampaignRecord, LegacyStepRecord, SequenceStore};

/// Process-local store. Jobs live here too, so `recover` only helps across
/// engine rebuilds that share the same store instance.
#[derive(Default)]
pub struct InMemoryStore {
    follow_ups: DashMap<FollowUpId, FollowUpInstance>,
    campaigns: DashMap<CampaignId, CampaignRecord>,
    legacy_imports: DashMap<CampaignId, Vec<LegacyStepRecord>>,
    messages: DashMap<FollowUpId, Vec<MessageRecord>>,
    /// message id -> owning follow-up
    message_index: DashMap<MessageId, FollowUpId>,
    /// provider message id -> message id
    provider_index: DashMap<String, MessageId>,
    jobs: DashMap<FollowUpId, ScheduledJob>,
    unavailable: AtomicBool,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("follow_ups", &self.follow_ups.len())
            .field("campaigns", &self.campaigns.len())
            .field("jobs", &self.jobs.len())
            .finish()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_campaign(&self, campaign: CampaignRecord) {
        tracing::info!(campaign_id = %campaign.id, name = %campaign.name, "Storing campaign");
        self.campaigns.insert(campaign.id, campaign);
    }

    pub fn insert_legacy_import(&self, campaign_id: CampaignId, rows: Vec<LegacyStepRecord>) {
        self.legacy_imports.insert(campaign_id, rows);
    }

    /// Makes every call fail with a store error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    fn check_available(&self) -> FollowUpResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FollowUpError::Store("store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SequenceStore for InMemoryStore {
    async fn get_follow_up(&self, id: FollowUpId) -> FollowUpResult<Option<FollowUpInstance>> {
        self.check_available()?;
        Ok(self.follow_ups.get(&id).map(|f| f.clone()))
    }

    async fn insert_follow_up(&self, follow_up: FollowUpInstance) -> FollowUpResult<()> {
        self.check_available()?;
        self.follow_ups.insert(follow_up.id, follow_up);
        Ok(())
    }

    async fn update_follow_up(&self, follow_up: &mut FollowUpInstance) -> FollowUpResult<bool> {
        self.check_available()?;
        let mut stored = self
            .follow_ups
            .get_mut(&follow_up.id)
            .ok_or(FollowUpError::FollowUpNotFound(follow_up.id))?;

        if stored.version != follow_up.version {
            tracing::debug!(
                follow_up_id = %follow_up.id,
                expected = follow_up.version,
                actual = stored.version,
                "Conditional update lost the race"
            );
            return Ok(false);
        }

        follow_up.version += 1;
        follow_up.updated_at = Utc::now();
        *stored = follow_up.clone();
        Ok(true)
    }

    async fn follow_ups_for_client(
        &self,
        client_id: &str,
    ) -> FollowUpResult<Vec<FollowUpInstance>> {
        self.check_available()?;
        let mut found: Vec<FollowUpInstance> = self
            .follow_ups
            .iter()
            .filter(|f| f.client_id == client_id)
            .map(|f| f.value().clone())
            .collect();
        found.sort_by_key(|f| f.created_at);
        Ok(found)
    }

    async fn active_follow_ups(&self) -> FollowUpResult<Vec<FollowUpInstance>> {
        self.check_available()?;
        Ok(self
            .follow_ups
            .iter()
            .filter(|f| f.status == FollowUpStatus::Active)
            .map(|f| f.value().clone())
            .collect())
    }

    async fn get_campaign(&self, id: CampaignId) -> FollowUpResult<Option<CampaignRecord>> {
        self.check_available()?;
        Ok(self.campaigns.get(&id).map(|c| c.clone()))
    }

    async fn legacy_import(&self, id: CampaignId) -> FollowUpResult<Vec<LegacyStepRecord>> {
        self.check_available()?;
        Ok(self
            .legacy_imports
            .get(&id)
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }

    async fn append_message(&self, record: MessageRecord) -> FollowUpResult<()> {
        self.check_available()?;
        self.message_index.insert(record.id, record.follow_up_id);
        if let Some(provider_id) = &record.provider_message_id {
            self.provider_index.insert(provider_id.clone(), record.id);
        }
        self.messages
            .entry(record.follow_up_id)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn update_message_status(
        &self,
        id: MessageId,
        status: DeliveryStatus,
        error: Option<String>,
    ) -> FollowUpResult<Option<MessageRecord>> {
        self.check_available()?;
        let Some(follow_up_id) = self.message_index.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(mut records) = self.messages.get_mut(&follow_up_id) else {
            return Ok(None);
        };
        let updated = records.iter_mut().find(|r| r.id == id).map(|record| {
            record.status = status;
            if error.is_some() {
                record.error = error;
            }
            record.updated_at = Utc::now();
            record.clone()
        });
        Ok(updated)
    }

    async fn find_message_by_provider_id(
        &self,
        provider_message_id: &str,
    ) -> FollowUpResult<Option<MessageRecord>> {
        self.check_available()?;
        let Some(message_id) = self.provider_index.get(provider_message_id).map(|e| *e.value())
        else {
            return Ok(None);
        };
        let Some(follow_up_id) = self.message_index.get(&message_id).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self
            .messages
            .get(&follow_up_id)
            .and_then(|records| records.iter().find(|r| r.id == message_id).cloned()))
    }

    async fn messages_for(&self, follow_up_id: FollowUpId) -> FollowUpResult<Vec<MessageRecord>> {
        self.check_available()?;
        Ok(self
            .messages
            .get(&follow_up_id)
            .map(|records| records.clone())
            .unwrap_or_default())
    }

    async fn put_job(&self, job: ScheduledJob) -> FollowUpResult<()> {
        self.check_available()?;
        self.jobs.insert(job.follow_up_id, job);
        Ok(())
    }

    async fn remove_job(&self, follow_up_id: FollowUpId) -> FollowUpResult<()> {
        self.check_available()?;
        self.jobs.remove(&follow_up_id);
        Ok(())
    }

    async fn remove_job_generation(
        &self,
        follow_up_id: FollowUpId,
        generation: u64,
    ) -> FollowUpResult<bool> {
        self.check_available()?;
        Ok(self
            .jobs
            .remove_if(&follow_up_id, |_, job| job.generation == generation)
            .is_some())
    }

    async fn pending_jobs(&self) -> FollowUpResult<Vec<ScheduledJob>> {
        self.check_available()?;
        let mut jobs: Vec<ScheduledJob> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by_key(|j| j.due_at);
        Ok(jobs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use followup_core::types::DeliveryResult;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_conditional_update_rejects_stale_version() {
        let store = InMemoryStore::new();
        let follow_up = FollowUpInstance::new(Uuid::new_v4(), "client", serde_json::Map::new());
        store.insert_follow_up(follow_up.clone()).await.unwrap();

        let mut first = follow_up.clone();
        let mut second = follow_up.clone();

        first.current_step_index = 1;
        assert!(store.update_follow_up(&mut first).await.unwrap());
        assert_eq!(first.version, 1);

        second.current_step_index = 5;
        assert!(!store.update_follow_up(&mut second).await.unwrap());

        let stored = store.get_follow_up(follow_up.id).await.unwrap().unwrap();
        assert_eq!(stored.current_step_index, 1);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_message_status_by_provider_id() {
        let store = InMemoryStore::new();
        let follow_up_id = Uuid::new_v4();
        let mut record =
            MessageRecord::system(follow_up_id, None, "placeholder".to_string());
        let result = DeliveryResult::pending("wamid.42");
        record.status = result.status;
        record.provider_message_id = result.provider_message_id.clone();
        store.append_message(record.clone()).await.unwrap();

        let found = store
            .find_message_by_provider_id("wamid.42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, record.id);

        let updated = store
            .update_message_status(record.id, DeliveryStatus::Delivered, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, DeliveryStatus::Delivered);
        assert!(store
            .update_message_status(Uuid::new_v4(), DeliveryStatus::Read, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_job_generation_guard() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        let now = Utc::now();
        store
            .put_job(ScheduledJob {
                follow_up_id: id,
                target_index: 1,
                due_at: now,
                generation: 7,
                armed_at: now,
            })
            .await
            .unwrap();

        assert!(!store.remove_job_generation(id, 6).await.unwrap());
        assert_eq!(store.job_count(), 1);
        assert!(store.remove_job_generation(id, 7).await.unwrap());
        assert_eq!(store.job_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let err = store.get_follow_up(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, FollowUpError::Store(_)));
        store.set_unavailable(false);
        assert!(store.get_follow_up(Uuid::new_v4()).await.unwrap().is_none());
    }
}
