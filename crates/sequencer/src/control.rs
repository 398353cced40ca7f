//! Operator-facing control surface: enrollment, pause, resume, manual
//! advance, cancel and status. Every mutating operation cancels pending
//! timers first and reports failures as typed errors.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use followup_core::config::SequencerConfig;
use followup_core::duration::due_after;
use followup_core::error::{FollowUpError, FollowUpResult};
use followup_core::event_bus::{make_event, noop_sink, EventSink, EventType};
use followup_core::types::{
    CampaignId, FollowUpId, FollowUpInstance, FollowUpStatus, MessageRecord, StageId,
};

use crate::resolver::CampaignResolver;
use crate::scheduler::Scheduler;
use crate::sequencer::{StepOutcome, StepProcessor};
use crate::store::SequenceStore;

const MUTATE_ATTEMPTS: usize = 3;

/// Point-in-time view of a follow-up for operators.
#[derive(Debug, Clone, Serialize)]
pub struct FollowUpSnapshot {
    pub follow_up: FollowUpInstance,
    pub messages: Vec<MessageRecord>,
    pub timer_armed: bool,
    pub armed_target: Option<usize>,
}

pub struct FollowUpControl {
    config: SequencerConfig,
    store: Arc<dyn SequenceStore>,
    resolver: CampaignResolver,
    scheduler: Arc<Scheduler>,
    processor: Arc<dyn StepProcessor>,
    event_sink: Arc<dyn EventSink>,
}

impl FollowUpControl {
    pub fn new(
        config: SequencerConfig,
        store: Arc<dyn SequenceStore>,
        scheduler: Arc<Scheduler>,
        processor: Arc<dyn StepProcessor>,
    ) -> Self {
        Self {
            config,
            resolver: CampaignResolver::new(store.clone()),
            store,
            scheduler,
            processor,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Starts a campaign for a client. The first step is processed right away.
    pub async fn enroll(
        &self,
        campaign_id: CampaignId,
        client_id: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> FollowUpResult<FollowUpId> {
        let campaign = self.resolver.resolve(campaign_id).await?;
        let first = campaign
            .steps
            .first()
            .ok_or(FollowUpError::EmptyCampaign(campaign_id))?;

        let mut follow_up = FollowUpInstance::new(campaign_id, client_id, metadata);
        follow_up.current_stage_id = Some(first.stage_id);
        let id = follow_up.id;
        self.store.insert_follow_up(follow_up.clone()).await?;

        info!(follow_up_id = %id, campaign_id = %campaign_id, client_id, "Follow-up enrolled");
        metrics::counter!("followup.enrolled").increment(1);
        self.emit(EventType::FollowUpEnrolled, &follow_up, Some(campaign.name.clone()));

        let outcome = self.processor.process_step(id).await;
        debug!(follow_up_id = %id, outcome = ?outcome, "Processed first step");
        Ok(id)
    }

    pub async fn pause(&self, id: FollowUpId) -> FollowUpResult<FollowUpInstance> {
        self.scheduler.cancel_all(id).await;
        let follow_up = self
            .mutate(id, |f| {
                if f.status != FollowUpStatus::Active {
                    return Err(invalid(f, "pause"));
                }
                f.status = FollowUpStatus::Paused;
                Ok(())
            })
            .await?;
        info!(follow_up_id = %id, "Follow-up paused");
        self.emit(EventType::FollowUpPaused, &follow_up, None);
        Ok(follow_up)
    }

    /// Reactivates a paused follow-up. A follow-up parked at a stage boundary
    /// stays parked; otherwise the pending step is processed if due, or its
    /// timer is re-armed.
    pub async fn resume(&self, id: FollowUpId) -> FollowUpResult<FollowUpInstance> {
        self.scheduler.cancel_all(id).await;
        let current = self.load(id).await?;
        let campaign = self.resolver.resolve(current.campaign_id).await?;

        let follow_up = self
            .mutate(id, |f| {
                if f.status != FollowUpStatus::Paused {
                    return Err(invalid(f, "resume"));
                }
                f.status = FollowUpStatus::Active;
                if !f.waiting_for_response && f.next_message_at.is_none() {
                    // Paused while a step was in flight: the next step keeps its wait.
                    let wait_ms = campaign
                        .steps
                        .get(f.current_step_index)
                        .map(|s| self.config.scaled(s.wait_time_ms))
                        .unwrap_or(0);
                    f.next_message_at = Some(due_after(Utc::now(), wait_ms));
                }
                Ok(())
            })
            .await?;
        info!(follow_up_id = %id, "Follow-up resumed");
        self.emit(EventType::FollowUpResumed, &follow_up, None);

        if follow_up.waiting_for_response {
            debug!(follow_up_id = %id, "Resumed at stage boundary, still waiting for response");
            return Ok(follow_up);
        }
        if let Some(due_at) = follow_up.next_message_at {
            let remaining = (due_at - Utc::now()).num_milliseconds();
            if remaining > self.config.due_tolerance_ms as i64 {
                self.scheduler
                    .schedule_at(id, follow_up.current_step_index, due_at)
                    .await;
            } else {
                let outcome = self.processor.process_step(id).await;
                debug!(follow_up_id = %id, outcome = ?outcome, "Processed due step on resume");
            }
        }
        Ok(follow_up)
    }

    /// Sends the step under the cursor now, crossing into its stage if the
    /// follow-up was parked at a boundary. Allowed from active and paused.
    pub async fn advance_manually(&self, id: FollowUpId) -> FollowUpResult<StepOutcome> {
        self.scheduler.cancel_all(id).await;
        let current = self.load(id).await?;
        let campaign = self.resolver.resolve(current.campaign_id).await?;

        let mut crossing: Option<(Option<StageId>, StageId)> = None;
        let follow_up = self
            .mutate(id, |f| {
                if f.status.is_terminal() {
                    return Err(invalid(f, "advance"));
                }
                crossing = None;
                if let Some(step) = campaign.steps.get(f.current_step_index) {
                    if f.current_stage_id != Some(step.stage_id) {
                        crossing = Some((f.current_stage_id, step.stage_id));
                        f.current_stage_id = Some(step.stage_id);
                    }
                }
                f.status = FollowUpStatus::Active;
                f.waiting_for_response = false;
                f.next_message_at = Some(Utc::now());
                Ok(())
            })
            .await?;

        if let Some((from, to)) = crossing {
            let from_name = from
                .map(|s| campaign.stage_name(s))
                .unwrap_or_else(|| "start".to_string());
            let to_name = campaign.stage_name(to);
            let record = MessageRecord::system(
                id,
                Some(to),
                format!(
                    "Stage changed from '{}' to '{}' (manual advance)",
                    from_name, to_name
                ),
            );
            if let Err(e) = self.store.append_message(record).await {
                tracing::warn!(follow_up_id = %id, error = %e, "Failed to record stage change");
            }
            metrics::counter!("followup.stage_transitions").increment(1);
            self.emit(
                EventType::StageAdvanced,
                &follow_up,
                Some(format!("{} -> {}", from_name, to_name)),
            );
        }

        info!(follow_up_id = %id, index = follow_up.current_step_index, "Manual advance");
        Ok(self.processor.process_step(id).await)
    }

    pub async fn cancel(&self, id: FollowUpId) -> FollowUpResult<FollowUpInstance> {
        self.scheduler.cancel_all(id).await;
        let follow_up = self
            .mutate(id, |f| {
                if f.status.is_terminal() {
                    return Err(invalid(f, "cancel"));
                }
                f.status = FollowUpStatus::Canceled;
                f.waiting_for_response = false;
                f.next_message_at = None;
                Ok(())
            })
            .await?;
        info!(follow_up_id = %id, "Follow-up canceled");
        metrics::counter!("followup.canceled").increment(1);
        self.emit(EventType::FollowUpCanceled, &follow_up, None);
        Ok(follow_up)
    }

    pub async fn status(&self, id: FollowUpId) -> FollowUpResult<FollowUpSnapshot> {
        let follow_up = self.load(id).await?;
        let messages = self.store.messages_for(id).await?;
        Ok(FollowUpSnapshot {
            timer_armed: self.scheduler.is_armed(id),
            armed_target: self.scheduler.armed_target(id),
            follow_up,
            messages,
        })
    }

    async fn load(&self, id: FollowUpId) -> FollowUpResult<FollowUpInstance> {
        self.store
            .get_follow_up(id)
            .await?
            .ok_or(FollowUpError::FollowUpNotFound(id))
    }

    /// Read-modify-write with the store's conditional update, retried on
    /// version conflicts. `apply` sees the freshest state on every attempt.
    async fn mutate<F>(&self, id: FollowUpId, mut apply: F) -> FollowUpResult<FollowUpInstance>
    where
        F: FnMut(&mut FollowUpInstance) -> FollowUpResult<()>,
    {
        for _ in 0..MUTATE_ATTEMPTS {
            let mut follow_up = self.load(id).await?;
            apply(&mut follow_up)?;
            if self.store.update_follow_up(&mut follow_up).await? {
                return Ok(follow_up);
            }
        }
        Err(FollowUpError::ConcurrentModification(id))
    }

    fn emit(&self, event_type: EventType, follow_up: &FollowUpInstance, detail: Option<String>) {
        self.event_sink.emit(make_event(
            event_type,
            follow_up.id,
            Some(follow_up.client_id.clone()),
            detail,
        ));
    }
}

fn invalid(follow_up: &FollowUpInstance, action: &'static str) -> FollowUpError {
    FollowUpError::InvalidTransition {
        id: follow_up.id,
        from: follow_up.status,
        action,
    }
}
