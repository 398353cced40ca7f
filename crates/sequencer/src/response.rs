//! Reaction to client replies: cancels pending timers and re-routes every
//! open follow-up of the client to the next stage of its campaign.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use followup_core::error::FollowUpResult;
use followup_core::event_bus::{make_event, noop_sink, EventSink, EventType};
use followup_core::types::{
    DeliveryStatus, FollowUpId, FollowUpInstance, FollowUpStatus, InboundMessage, MessageId,
    MessageRecord, ResponseMarker, StageId,
};

use crate::resolver::CampaignResolver;
use crate::scheduler::Scheduler;
use crate::sequencer::{has_delivered_outbound, stage_fully_delivered, StepProcessor};
use crate::store::SequenceStore;

const ROUTE_ATTEMPTS: usize = 3;
const DEFAULT_DUPLICATE_WINDOW_MS: u64 = 10_000;

/// What a client response did to one follow-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Moved to the first step of the next stage and processed it.
    Jumped {
        from_stage: Option<StageId>,
        to_stage: StageId,
        step_index: usize,
    },
    /// There was no later stage.
    Completed,
    /// Nothing had been delivered yet; the reply was only recorded.
    RecordedOnly,
    /// Messages of the current stage are still in flight; the jump happens
    /// once they are delivered.
    Deferred,
    /// The same event was already handled.
    Duplicate,
    Conflict,
    Failed(String),
}

pub struct ResponseHandler {
    store: Arc<dyn SequenceStore>,
    resolver: CampaignResolver,
    scheduler: Arc<Scheduler>,
    processor: Arc<dyn StepProcessor>,
    event_sink: Arc<dyn EventSink>,
    duplicate_window_ms: u64,
}

impl ResponseHandler {
    pub fn new(
        store: Arc<dyn SequenceStore>,
        scheduler: Arc<Scheduler>,
        processor: Arc<dyn StepProcessor>,
    ) -> Self {
        Self {
            resolver: CampaignResolver::new(store.clone()),
            store,
            scheduler,
            processor,
            event_sink: noop_sink(),
            duplicate_window_ms: DEFAULT_DUPLICATE_WINDOW_MS,
        }
    }

    pub fn with_duplicate_window(mut self, window_ms: u64) -> Self {
        self.duplicate_window_ms = window_ms;
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Inbound trigger for channels that only supply client and text.
    pub async fn on_client_message(
        &self,
        client_id: &str,
        text: &str,
    ) -> Vec<(FollowUpId, ResponseOutcome)> {
        self.on_inbound(InboundMessage::new(client_id, text)).await
    }

    /// Applies a normalized inbound message to every active or paused
    /// follow-up of the client.
    pub async fn on_inbound(&self, message: InboundMessage) -> Vec<(FollowUpId, ResponseOutcome)> {
        metrics::counter!("followup.responses_received").increment(1);
        let follow_ups = match self.store.follow_ups_for_client(&message.client_id).await {
            Ok(follow_ups) => follow_ups,
            Err(e) => {
                error!(client_id = %message.client_id, error = %e, "Failed to load follow-ups for response");
                return Vec::new();
            }
        };

        let fingerprint = message.fingerprint();
        let mut outcomes = Vec::new();
        for follow_up in follow_ups
            .into_iter()
            .filter(|f| matches!(f.status, FollowUpStatus::Active | FollowUpStatus::Paused))
        {
            let id = follow_up.id;
            let outcome = match self.handle_follow_up(follow_up, &message, &fingerprint).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(follow_up_id = %id, error = %e, "Response handling failed");
                    ResponseOutcome::Failed(e.to_string())
                }
            };
            info!(follow_up_id = %id, client_id = %message.client_id, outcome = ?outcome, "Client response handled");
            outcomes.push((id, outcome));
        }

        if outcomes.is_empty() {
            debug!(client_id = %message.client_id, "No open follow-ups for client");
        }
        outcomes
    }

    async fn handle_follow_up(
        &self,
        follow_up: FollowUpInstance,
        message: &InboundMessage,
        fingerprint: &str,
    ) -> FollowUpResult<ResponseOutcome> {
        let redelivered = follow_up.is_redelivery(message, self.duplicate_window_ms);
        // A repeated provider event is the same message; repeated text
        // without an id is still something the client sent.
        if !(redelivered && message.event_id.is_some()) {
            self.record_inbound(&follow_up, message).await;
        }
        if redelivered {
            metrics::counter!("followup.duplicate_responses").increment(1);
            debug!(follow_up_id = %follow_up.id, "Response already processed");
            return Ok(ResponseOutcome::Duplicate);
        }

        self.scheduler.cancel_all(follow_up.id).await;
        self.emit(EventType::ResponseReceived, &follow_up, Some(message.text.clone()));

        let mut current = follow_up;
        for _ in 0..ROUTE_ATTEMPTS {
            match self.route(current.clone(), message, fingerprint).await? {
                ResponseOutcome::Conflict => {}
                outcome => return Ok(outcome),
            }
            match self.store.get_follow_up(current.id).await? {
                Some(latest) if !latest.status.is_terminal() => current = latest,
                _ => return Ok(ResponseOutcome::Conflict),
            }
        }
        Ok(ResponseOutcome::Conflict)
    }

    async fn record_inbound(&self, follow_up: &FollowUpInstance, message: &InboundMessage) {
        let inbound =
            MessageRecord::inbound(follow_up.id, follow_up.current_stage_id, &message.text);
        if let Err(e) = self.store.append_message(inbound).await {
            warn!(follow_up_id = %follow_up.id, error = %e, "Failed to record inbound message");
        }
    }

    async fn route(
        &self,
        mut follow_up: FollowUpInstance,
        message: &InboundMessage,
        fingerprint: &str,
    ) -> FollowUpResult<ResponseOutcome> {
        follow_up.last_response = Some(message.text.clone());
        follow_up.last_response_at = Some(message.received_at);

        let messages = self.store.messages_for(follow_up.id).await?;

        if !has_delivered_outbound(&messages) {
            follow_up.set_response_marker(marker(fingerprint, follow_up.current_stage_id));
            if !self.store.update_follow_up(&mut follow_up).await? {
                return Ok(ResponseOutcome::Conflict);
            }
            self.rearm(&follow_up).await;
            debug!(follow_up_id = %follow_up.id, "Response arrived before any delivery");
            return Ok(ResponseOutcome::RecordedOnly);
        }

        if let Some(stage) = follow_up.current_stage_id {
            if !stage_fully_delivered(&messages, stage) {
                follow_up.set_response_marker(marker(fingerprint, Some(stage)));
                follow_up.set_pending_response_jump(true);
                if !self.store.update_follow_up(&mut follow_up).await? {
                    return Ok(ResponseOutcome::Conflict);
                }
                self.rearm(&follow_up).await;
                self.emit(EventType::ResponseDeferred, &follow_up, None);
                return Ok(ResponseOutcome::Deferred);
            }
        }

        self.jump(follow_up, fingerprint).await
    }

    /// Moves the follow-up to the first step of the stage after its current
    /// one and processes that step right away. Completes the follow-up when
    /// no later stage exists.
    async fn jump(
        &self,
        mut follow_up: FollowUpInstance,
        fingerprint: &str,
    ) -> FollowUpResult<ResponseOutcome> {
        let campaign = match self.resolver.resolve(follow_up.campaign_id).await {
            Ok(campaign) => campaign,
            Err(e) if e.is_definition_error() => {
                warn!(follow_up_id = %follow_up.id, error = %e, "Campaign unavailable while routing response");
                return self.complete(follow_up, fingerprint).await;
            }
            Err(e) => return Err(e),
        };

        let from_stage = follow_up.current_stage_id.or_else(|| {
            campaign
                .steps
                .get(follow_up.current_step_index)
                .map(|s| s.stage_id)
        });
        let next = from_stage
            .and_then(|stage| campaign.next_stage_after(stage))
            .map(|(stage, index)| (stage.id, index));

        let Some((to_stage, step_index)) = next else {
            return self.complete(follow_up, fingerprint).await;
        };

        follow_up.status = FollowUpStatus::Active;
        follow_up.waiting_for_response = false;
        follow_up.current_stage_id = Some(to_stage);
        follow_up.current_step_index = step_index;
        follow_up.next_message_at = Some(Utc::now());
        follow_up.set_pending_response_jump(false);
        follow_up.set_response_marker(marker(fingerprint, Some(to_stage)));
        if !self.store.update_follow_up(&mut follow_up).await? {
            return Ok(ResponseOutcome::Conflict);
        }

        let from_name = from_stage
            .map(|s| campaign.stage_name(s))
            .unwrap_or_else(|| "start".to_string());
        let to_name = campaign.stage_name(to_stage);
        let record = MessageRecord::system(
            follow_up.id,
            Some(to_stage),
            format!(
                "Client responded; stage changed from '{}' to '{}'",
                from_name, to_name
            ),
        );
        if let Err(e) = self.store.append_message(record).await {
            warn!(follow_up_id = %follow_up.id, error = %e, "Failed to record stage change");
        }
        metrics::counter!("followup.stage_transitions").increment(1);
        metrics::counter!("followup.response_jumps").increment(1);
        self.emit(
            EventType::StageAdvanced,
            &follow_up,
            Some(format!("{} -> {}", from_name, to_name)),
        );

        let outcome = self.processor.process_step(follow_up.id).await;
        debug!(follow_up_id = %follow_up.id, outcome = ?outcome, "Processed first step of new stage");

        Ok(ResponseOutcome::Jumped {
            from_stage,
            to_stage,
            step_index,
        })
    }

    async fn complete(
        &self,
        mut follow_up: FollowUpInstance,
        fingerprint: &str,
    ) -> FollowUpResult<ResponseOutcome> {
        follow_up.status = FollowUpStatus::Completed;
        follow_up.waiting_for_response = false;
        follow_up.next_message_at = None;
        follow_up.set_pending_response_jump(false);
        follow_up.set_response_marker(marker(fingerprint, follow_up.current_stage_id));
        if !self.store.update_follow_up(&mut follow_up).await? {
            return Ok(ResponseOutcome::Conflict);
        }
        self.scheduler.cancel_all(follow_up.id).await;
        info!(follow_up_id = %follow_up.id, "Client responded on the last stage, follow-up completed");
        metrics::counter!("followup.completed").increment(1);
        self.emit(
            EventType::FollowUpCompleted,
            &follow_up,
            Some("response on last stage".to_string()),
        );
        Ok(ResponseOutcome::Completed)
    }

    /// Restores the timer canceled on arrival of a response that did not
    /// re-route the follow-up.
    async fn rearm(&self, follow_up: &FollowUpInstance) {
        if follow_up.status != FollowUpStatus::Active || follow_up.waiting_for_response {
            return;
        }
        if let Some(due_at) = follow_up.next_message_at {
            self.scheduler
                .schedule_at(follow_up.id, follow_up.current_step_index, due_at)
                .await;
        }
    }

    /// Applies a delivery status change to a message record and performs a
    /// deferred response jump once the stage has nothing left in flight.
    pub async fn on_delivery_update(
        &self,
        message_id: MessageId,
        status: DeliveryStatus,
    ) -> Option<ResponseOutcome> {
        let record = match self
            .store
            .update_message_status(message_id, status, None)
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(message_id = %message_id, "Delivery update for unknown message");
                return None;
            }
            Err(e) => {
                error!(message_id = %message_id, error = %e, "Failed to apply delivery update");
                return None;
            }
        };
        metrics::counter!("followup.delivery_updates", "status" => format!("{:?}", status))
            .increment(1);

        match self.complete_deferred_jump(record.follow_up_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(follow_up_id = %record.follow_up_id, error = %e, "Deferred response jump failed");
                Some(ResponseOutcome::Failed(e.to_string()))
            }
        }
    }

    /// Delivery receipt keyed by the provider's message id, with the
    /// provider's status vocabulary ("delivered", "read", "failed").
    pub async fn on_provider_receipt(
        &self,
        provider_message_id: &str,
        status: &str,
    ) -> Option<ResponseOutcome> {
        let Some(status) = DeliveryStatus::from_provider(status) else {
            warn!(provider_message_id, status, "Unknown provider delivery status");
            return None;
        };
        let record = match self
            .store
            .find_message_by_provider_id(provider_message_id)
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(provider_message_id, "Receipt for a message this engine did not send");
                return None;
            }
            Err(e) => {
                error!(provider_message_id, error = %e, "Failed to look up receipt");
                return None;
            }
        };
        self.on_delivery_update(record.id, status).await
    }

    async fn complete_deferred_jump(
        &self,
        follow_up_id: FollowUpId,
    ) -> FollowUpResult<Option<ResponseOutcome>> {
        let Some(follow_up) = self.store.get_follow_up(follow_up_id).await? else {
            return Ok(None);
        };
        if follow_up.status.is_terminal() || !follow_up.pending_response_jump() {
            return Ok(None);
        }
        if let Some(stage) = follow_up.current_stage_id {
            let messages = self.store.messages_for(follow_up_id).await?;
            if !stage_fully_delivered(&messages, stage) {
                return Ok(None);
            }
        }

        info!(follow_up_id = %follow_up_id, "Stage delivered, performing deferred response jump");
        self.scheduler.cancel_all(follow_up_id).await;
        let fingerprint = follow_up
            .response_marker()
            .map(|m| m.fingerprint)
            .unwrap_or_default();
        self.jump(follow_up, &fingerprint).await.map(Some)
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

fn marker(fingerprint: &str, stage_id: Option<StageId>) -> ResponseMarker {
    ResponseMarker {
        fingerprint: fingerprint.to_string(),
        stage_id,
        at: Utc::now(),
    }
}
