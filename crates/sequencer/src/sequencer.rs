//! The step state machine: dispatches the step under the cursor, decides
//! the next position and re-arms the scheduler.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use followup_core::advisor::{AdvisorAction, DecisionAdvisor};
use followup_core::config::{SequencerConfig, StagePolicy};
use followup_core::duration::due_after;
use followup_core::error::FollowUpResult;
use followup_core::event_bus::{make_event, noop_sink, EventSink, EventType};
use followup_core::gateway::DispatchGateway;
use followup_core::templates::render_template;
use followup_core::types::{
    CampaignDefinition, FollowUpId, FollowUpInstance, FollowUpStatus, MessageRecord, StageId,
    StepDefinition, TemplateMeta,
};

use crate::resolver::CampaignResolver;
use crate::scheduler::{Scheduler, TimerFire};
use crate::store::SequenceStore;
use crate::transition::{StageTransitionResolver, Transition};

const COMMIT_ATTEMPTS: usize = 3;

/// Result of one `process_step` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step at `step_index` was sent; `transition` is where the cursor went.
    Dispatched {
        step_index: usize,
        transition: Transition,
    },
    /// Not due yet; a timer was armed for the remaining time.
    Rescheduled { remaining_ms: u64 },
    /// Waiting at a stage boundary for a client response.
    Parked,
    Completed,
    Inactive(FollowUpStatus),
    /// A timer fire that no longer applies.
    Stale,
    NotFound,
    /// Another actor changed the follow-up first; nothing was armed.
    Conflict,
    Failed(String),
}

/// Narrow capability handed to components that need to re-enter the
/// sequencer (the response handler and the control surface).
#[async_trait]
pub trait StepProcessor: Send + Sync {
    async fn process_step(&self, follow_up_id: FollowUpId) -> StepOutcome;
}

/// True when no outbound message of `stage_id` is still waiting for the
/// provider. Failed sends do not hold a stage back.
pub(crate) fn stage_fully_delivered(messages: &[MessageRecord], stage_id: StageId) -> bool {
    !messages
        .iter()
        .any(|m| m.is_outbound() && m.stage_id == Some(stage_id) && m.status.is_pending())
}

pub(crate) fn has_delivered_outbound(messages: &[MessageRecord]) -> bool {
    messages
        .iter()
        .any(|m| m.is_outbound() && m.status.is_delivered())
}

pub struct Sequencer {
    config: SequencerConfig,
    store: Arc<dyn SequenceStore>,
    resolver: CampaignResolver,
    scheduler: Arc<Scheduler>,
    gateway: Arc<dyn DispatchGateway>,
    advisor: Option<Arc<dyn DecisionAdvisor>>,
    transitions: StageTransitionResolver,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("policy", &self.transitions.policy())
            .field("gateway", &self.gateway.name())
            .field("advisor", &self.advisor.is_some())
            .finish()
    }
}

impl Sequencer {
    pub fn new(
        config: SequencerConfig,
        store: Arc<dyn SequenceStore>,
        scheduler: Arc<Scheduler>,
        gateway: Arc<dyn DispatchGateway>,
    ) -> Self {
        Self {
            transitions: StageTransitionResolver::new(config.stage_policy),
            resolver: CampaignResolver::new(store.clone()),
            config,
            store,
            scheduler,
            gateway,
            advisor: None,
            event_sink: noop_sink(),
        }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn DecisionAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    /// Attach an event sink for lifecycle events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Entry point for elapsed timers. The fire is dropped unless it is still
    /// the armed timer, the follow-up is active, its cursor still sits on the
    /// targeted step and no client response re-routed it after arming.
    pub async fn handle_fire(&self, fire: TimerFire) -> StepOutcome {
        if !self.scheduler.claim(&fire) {
            metrics::counter!("followup.stale_fires").increment(1);
            debug!(
                follow_up_id = %fire.follow_up_id,
                generation = fire.generation,
                "Superseded timer fire ignored"
            );
            return StepOutcome::Stale;
        }
        self.scheduler.release_job(&fire).await;
        metrics::counter!("followup.timer_fires").increment(1);

        let follow_up = match self.store.get_follow_up(fire.follow_up_id).await {
            Ok(Some(follow_up)) => follow_up,
            Ok(None) => return StepOutcome::NotFound,
            Err(e) => {
                error!(follow_up_id = %fire.follow_up_id, error = %e, "Timer fire failed to load follow-up");
                metrics::counter!("followup.step_errors").increment(1);
                return StepOutcome::Failed(e.to_string());
            }
        };

        if let Some(reason) = stale_reason(&follow_up, &fire) {
            metrics::counter!("followup.stale_fires").increment(1);
            debug!(follow_up_id = %follow_up.id, reason, "Timer fire no longer applies");
            self.emit(EventType::StaleTimerDropped, &follow_up, Some(reason.to_string()));
            return StepOutcome::Stale;
        }

        self.emit(
            EventType::TimerFired,
            &follow_up,
            Some(format!("target_index={}", fire.target_index)),
        );
        self.process_step(fire.follow_up_id).await
    }

    async fn try_process_step(&self, id: FollowUpId) -> FollowUpResult<StepOutcome> {
        let Some(mut follow_up) = self.store.get_follow_up(id).await? else {
            warn!(follow_up_id = %id, "Follow-up not found");
            return Ok(StepOutcome::NotFound);
        };
        if follow_up.status != FollowUpStatus::Active {
            debug!(follow_up_id = %id, status = follow_up.status.as_str(), "Follow-up not active, skipping");
            return Ok(StepOutcome::Inactive(follow_up.status));
        }

        let campaign = match self.resolver.resolve(follow_up.campaign_id).await {
            Ok(campaign) => campaign,
            Err(e) if e.is_definition_error() => {
                warn!(follow_up_id = %id, error = %e, "Campaign definition unavailable, completing follow-up");
                return self
                    .complete(follow_up, "campaign definition unavailable")
                    .await;
            }
            Err(e) => return Err(e),
        };

        let index = follow_up.current_step_index;
        let Some(step) = campaign.steps.get(index).cloned() else {
            return self.complete(follow_up, "no remaining steps").await;
        };

        match follow_up.next_message_at {
            Some(due_at) => {
                let remaining = (due_at - Utc::now()).num_milliseconds();
                if remaining > self.config.due_tolerance_ms as i64 {
                    let remaining_ms = remaining as u64;
                    self.scheduler.schedule(id, index, remaining_ms).await;
                    debug!(follow_up_id = %id, index, remaining_ms, "Step not due yet, re-armed");
                    return Ok(StepOutcome::Rescheduled { remaining_ms });
                }
            }
            None if follow_up.waiting_for_response => {}
            None => {
                debug!(follow_up_id = %id, index, "Step already in flight");
                return Ok(StepOutcome::Conflict);
            }
        }

        let mut crossed_from = None;
        if let Some(current) = follow_up.current_stage_id.filter(|s| *s != step.stage_id) {
            if follow_up.waiting_for_response {
                debug!(follow_up_id = %id, index, "Parked at stage boundary");
                return Ok(StepOutcome::Parked);
            }
            if self.transitions.policy() == StagePolicy::AfterDelivery
                && campaign.is_later_stage(step.stage_id, current)
                && !self.stage_delivered(id, current).await
            {
                let recheck_ms = self.config.scaled(self.config.delivery_recheck_ms);
                self.scheduler.schedule(id, index, recheck_ms).await;
                debug!(follow_up_id = %id, index, recheck_ms, "Stage messages still pending, re-checking later");
                return Ok(StepOutcome::Rescheduled {
                    remaining_ms: recheck_ms,
                });
            }
            crossed_from = Some(current);
        }

        // Claim the step before sending so a concurrent processor or a late
        // timer cannot dispatch it a second time.
        follow_up.current_step_index = index + 1;
        follow_up.current_stage_id = Some(step.stage_id);
        follow_up.waiting_for_response = false;
        follow_up.next_message_at = None;
        if !self.store.update_follow_up(&mut follow_up).await? {
            debug!(follow_up_id = %id, index, "Lost claim on step");
            return Ok(StepOutcome::Conflict);
        }

        if let Some(from) = crossed_from {
            self.record_crossing(&follow_up, &campaign, from, step.stage_id, "step due")
                .await;
        }

        self.dispatch(&follow_up, &step).await;

        let transition = match self.consult_advisor(&follow_up, &campaign, &step).await {
            AdvisorAction::Continue => {
                let delivered = match self.transitions.policy() {
                    StagePolicy::AfterDelivery => self.stage_delivered(id, step.stage_id).await,
                    StagePolicy::AwaitResponse => true,
                };
                self.transitions
                    .resolve(&campaign, index + 1, Some(step.stage_id), delivered)
            }
            AdvisorAction::Skip { target_step } => {
                advance_to(&campaign, target_step, step.stage_id)
            }
            AdvisorAction::Jump { target_stage } => {
                match campaign.first_step_of_stage(target_stage) {
                    Some(target) => advance_to(&campaign, target, step.stage_id),
                    None => Transition::Complete,
                }
            }
            AdvisorAction::Complete => Transition::Complete,
        };

        self.apply_transition(follow_up, &campaign, index, step.stage_id, transition)
            .await
    }

    async fn apply_transition(
        &self,
        mut follow_up: FollowUpInstance,
        campaign: &CampaignDefinition,
        step_index: usize,
        step_stage: StageId,
        transition: Transition,
    ) -> FollowUpResult<StepOutcome> {
        let now = Utc::now();
        let mut arm = None;
        let mut crossing = None;

        match &transition {
            Transition::Advance {
                index,
                stage_id,
                crossed_from,
            } => {
                let wait_ms = self.config.scaled(campaign.steps[*index].wait_time_ms);
                follow_up.current_step_index = *index;
                follow_up.current_stage_id = Some(*stage_id);
                follow_up.waiting_for_response = false;
                follow_up.next_message_at = Some(due_after(now, wait_ms));
                arm = Some((*index, wait_ms));
                crossing = crossed_from.map(|from| (from, *stage_id));
            }
            Transition::Recheck { index } => {
                let wait_ms = self.config.scaled(campaign.steps[*index].wait_time_ms);
                follow_up.current_step_index = *index;
                follow_up.waiting_for_response = false;
                follow_up.next_message_at = Some(due_after(now, wait_ms));
                arm = Some((*index, wait_ms));
            }
            Transition::Park { boundary_index } => {
                follow_up.current_step_index = *boundary_index;
                follow_up.waiting_for_response = true;
                follow_up.next_message_at = None;
            }
            Transition::Complete => {
                follow_up.status = FollowUpStatus::Completed;
                follow_up.waiting_for_response = false;
                follow_up.next_message_at = None;
            }
        }

        if !self.commit(&mut follow_up, step_index + 1, step_stage).await? {
            debug!(follow_up_id = %follow_up.id, "Transition lost to a concurrent update");
            return Ok(StepOutcome::Conflict);
        }

        match &transition {
            Transition::Complete => self.after_completed(&follow_up, "campaign finished").await,
            Transition::Park { boundary_index } => {
                info!(
                    follow_up_id = %follow_up.id,
                    boundary_index,
                    "Stage finished, waiting for client response"
                );
                self.emit(EventType::StageParked, &follow_up, None);
            }
            _ => {}
        }
        if let Some((from, to)) = crossing {
            self.record_crossing(&follow_up, campaign, from, to, "advancement")
                .await;
        }
        if let Some((target, wait_ms)) = arm {
            self.scheduler.schedule(follow_up.id, target, wait_ms).await;
        }

        Ok(StepOutcome::Dispatched {
            step_index,
            transition,
        })
    }

    /// Conditional write of the post-dispatch state. If another actor wrote
    /// in between without moving the cursor (for example a response that was
    /// only recorded), its fields are merged and the write retried.
    async fn commit(
        &self,
        follow_up: &mut FollowUpInstance,
        claimed_index: usize,
        claimed_stage: StageId,
    ) -> FollowUpResult<bool> {
        for _ in 0..COMMIT_ATTEMPTS {
            if self.store.update_follow_up(follow_up).await? {
                return Ok(true);
            }
            let Some(latest) = self.store.get_follow_up(follow_up.id).await? else {
                return Ok(false);
            };
            let cursor_untouched = latest.status == FollowUpStatus::Active
                && latest.current_step_index == claimed_index
                && latest.current_stage_id == Some(claimed_stage)
                && latest.next_message_at.is_none()
                && !latest.waiting_for_response;
            if !cursor_untouched {
                return Ok(false);
            }
            follow_up.version = latest.version;
            follow_up.last_response = latest.last_response;
            follow_up.last_response_at = latest.last_response_at;
            follow_up.metadata = latest.metadata;
        }
        Ok(false)
    }

    async fn dispatch(&self, follow_up: &FollowUpInstance, step: &StepDefinition) {
        let rendered = render_template(&step.message, &follow_up.template_variables());
        let meta = TemplateMeta::for_step(follow_up, step);

        let started = Instant::now();
        let result = self
            .gateway
            .send(&follow_up.client_id, &rendered, &meta)
            .await;
        metrics::histogram!("followup.dispatch_latency_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);

        if result.is_failure() {
            warn!(
                follow_up_id = %follow_up.id,
                step_id = %step.id,
                gateway = self.gateway.name(),
                error = result.error.as_deref().unwrap_or("unknown"),
                "Dispatch failed"
            );
            metrics::counter!("followup.dispatch_failures").increment(1);
            self.emit(EventType::DispatchFailed, follow_up, result.error.clone());
        } else {
            info!(
                follow_up_id = %follow_up.id,
                step_id = %step.id,
                client_id = %follow_up.client_id,
                status = ?result.status,
                "Step dispatched"
            );
            metrics::counter!("followup.steps_dispatched").increment(1);
            self.emit(EventType::StepDispatched, follow_up, Some(step.id.to_string()));
        }

        let record = MessageRecord::outbound(follow_up.id, step, rendered, &result);
        if let Err(e) = self.store.append_message(record).await {
            warn!(follow_up_id = %follow_up.id, error = %e, "Failed to record outbound message");
        }
    }

    /// Asks the advisor for a decision. Failures, invalid targets and
    /// follow-ups that opted out all yield `Continue`.
    async fn consult_advisor(
        &self,
        follow_up: &FollowUpInstance,
        campaign: &CampaignDefinition,
        step: &StepDefinition,
    ) -> AdvisorAction {
        let Some(advisor) = &self.advisor else {
            return AdvisorAction::Continue;
        };
        if !follow_up.ai_decisions_enabled() {
            return AdvisorAction::Continue;
        }

        let decision = match advisor.decide(follow_up, step).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(follow_up_id = %follow_up.id, error = %e, "Advisor failed, continuing");
                return AdvisorAction::Continue;
            }
        };

        let valid = match &decision.action {
            AdvisorAction::Continue => return AdvisorAction::Continue,
            AdvisorAction::Skip { target_step } => *target_step < campaign.steps.len(),
            AdvisorAction::Jump { target_stage } => {
                campaign.first_step_of_stage(*target_stage).is_some()
            }
            AdvisorAction::Complete => true,
        };
        if !valid {
            warn!(
                follow_up_id = %follow_up.id,
                decision = ?decision.action,
                "Advisor target does not exist, continuing"
            );
            return AdvisorAction::Continue;
        }

        let reason = decision.reason.as_deref().unwrap_or("no reason given");
        let summary = match &decision.action {
            AdvisorAction::Skip { target_step } => format!("skip to step {}", target_step),
            AdvisorAction::Jump { target_stage } => {
                format!("jump to stage '{}'", campaign.stage_name(*target_stage))
            }
            AdvisorAction::Complete => "complete the follow-up".to_string(),
            AdvisorAction::Continue => "continue".to_string(),
        };
        info!(follow_up_id = %follow_up.id, decision = %summary, reason, "Advisor override");
        metrics::counter!("followup.advisor_overrides").increment(1);
        self.append_system(
            follow_up,
            Some(step.stage_id),
            format!("Advisor decided to {}: {}", summary, reason),
        )
        .await;
        self.emit(EventType::AdvisorOverride, follow_up, Some(summary));
        decision.action
    }

    async fn stage_delivered(&self, id: FollowUpId, stage_id: StageId) -> bool {
        match self.store.messages_for(id).await {
            Ok(messages) => stage_fully_delivered(&messages, stage_id),
            Err(e) => {
                warn!(follow_up_id = %id, error = %e, "Could not check stage deliveries");
                false
            }
        }
    }

    async fn complete(
        &self,
        mut follow_up: FollowUpInstance,
        reason: &str,
    ) -> FollowUpResult<StepOutcome> {
        follow_up.status = FollowUpStatus::Completed;
        follow_up.waiting_for_response = false;
        follow_up.next_message_at = None;
        if !self.store.update_follow_up(&mut follow_up).await? {
            return Ok(StepOutcome::Conflict);
        }
        self.after_completed(&follow_up, reason).await;
        Ok(StepOutcome::Completed)
    }

    async fn after_completed(&self, follow_up: &FollowUpInstance, reason: &str) {
        self.scheduler.cancel_all(follow_up.id).await;
        info!(follow_up_id = %follow_up.id, reason, "Follow-up completed");
        metrics::counter!("followup.completed").increment(1);
        self.emit(EventType::FollowUpCompleted, follow_up, Some(reason.to_string()));
    }

    /// Appends the system message narrating a stage change.
    pub(crate) async fn record_crossing(
        &self,
        follow_up: &FollowUpInstance,
        campaign: &CampaignDefinition,
        from: StageId,
        to: StageId,
        cause: &str,
    ) {
        let from_name = campaign.stage_name(from);
        let to_name = campaign.stage_name(to);
        info!(
            follow_up_id = %follow_up.id,
            from = %from_name,
            to = %to_name,
            cause,
            "Stage changed"
        );
        metrics::counter!("followup.stage_transitions").increment(1);
        self.append_system(
            follow_up,
            Some(to),
            format!("Stage changed from '{}' to '{}' ({})", from_name, to_name, cause),
        )
        .await;
        self.emit(
            EventType::StageAdvanced,
            follow_up,
            Some(format!("{} -> {}", from_name, to_name)),
        );
    }

    async fn append_system(
        &self,
        follow_up: &FollowUpInstance,
        stage_id: Option<StageId>,
        content: String,
    ) {
        let record = MessageRecord::system(follow_up.id, stage_id, content);
        if let Err(e) = self.store.append_message(record).await {
            warn!(follow_up_id = %follow_up.id, error = %e, "Failed to record system message");
        }
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

#[async_trait]
impl StepProcessor for Sequencer {
    async fn process_step(&self, follow_up_id: FollowUpId) -> StepOutcome {
        match self.try_process_step(follow_up_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(follow_up_id = %follow_up_id, error = %e, "process_step failed");
                metrics::counter!("followup.step_errors").increment(1);
                StepOutcome::Failed(e.to_string())
            }
        }
    }
}

fn advance_to(campaign: &CampaignDefinition, target: usize, from_stage: StageId) -> Transition {
    let stage_id = campaign.steps[target].stage_id;
    Transition::Advance {
        index: target,
        stage_id,
        crossed_from: (stage_id != from_stage).then_some(from_stage),
    }
}

fn stale_reason(follow_up: &FollowUpInstance, fire: &TimerFire) -> Option<&'static str> {
    if follow_up.status != FollowUpStatus::Active {
        return Some("follow-up not active");
    }
    if follow_up.current_step_index != fire.target_index {
        return Some("cursor moved");
    }
    if follow_up
        .response_marker()
        .map(|m| m.at > fire.armed_at)
        .unwrap_or(false)
    {
        return Some("re-routed by client response");
    }
    None
}
