//! Wiring of store, scheduler, sequencer, response handler and control
//! surface into one engine, plus the timer driver loop.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use followup_core::advisor::DecisionAdvisor;
use followup_core::config::SequencerConfig;
use followup_core::error::FollowUpResult;
use followup_core::event_bus::{noop_sink, EventSink};
use followup_core::gateway::DispatchGateway;
use followup_core::types::{
    CampaignId, DeliveryStatus, FollowUpId, FollowUpInstance, FunnelStage, InboundMessage,
    MessageId,
};

use crate::control::{FollowUpControl, FollowUpSnapshot};
use crate::memory::InMemoryStore;
use crate::response::{ResponseHandler, ResponseOutcome};
use crate::scheduler::{Scheduler, TimerFire};
use crate::sequencer::{Sequencer, StepOutcome, StepProcessor};
use crate::store::{CampaignRecord, SequenceStore};

pub struct EngineBuilder {
    config: SequencerConfig,
    store: Arc<dyn SequenceStore>,
    gateway: Arc<dyn DispatchGateway>,
    advisor: Option<Arc<dyn DecisionAdvisor>>,
    event_sink: Arc<dyn EventSink>,
}

impl EngineBuilder {
    pub fn new(
        config: SequencerConfig,
        store: Arc<dyn SequenceStore>,
        gateway: Arc<dyn DispatchGateway>,
    ) -> Self {
        Self {
            config,
            store,
            gateway,
            advisor: None,
            event_sink: noop_sink(),
        }
    }

    pub fn advisor(mut self, advisor: Option<Arc<dyn DecisionAdvisor>>) -> Self {
        self.advisor = advisor;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn build(self) -> FollowUpEngine {
        let (scheduler, fire_rx) = Scheduler::new(self.store.clone());
        let scheduler = Arc::new(scheduler);

        let mut sequencer = Sequencer::new(
            self.config.clone(),
            self.store.clone(),
            scheduler.clone(),
            self.gateway.clone(),
        )
        .with_event_sink(self.event_sink.clone());
        if let Some(advisor) = self.advisor {
            sequencer = sequencer.with_advisor(advisor);
        }
        let sequencer = Arc::new(sequencer);
        let processor: Arc<dyn StepProcessor> = sequencer.clone();

        let responses =
            ResponseHandler::new(self.store.clone(), scheduler.clone(), processor.clone())
                .with_event_sink(self.event_sink.clone())
                .with_duplicate_window(self.config.duplicate_window_ms);
        let control = FollowUpControl::new(
            self.config.clone(),
            self.store.clone(),
            scheduler.clone(),
            processor,
        )
        .with_event_sink(self.event_sink);

        info!(
            policy = ?self.config.stage_policy,
            time_scale = self.config.time_scale,
            gateway = self.gateway.name(),
            "Follow-up engine built"
        );

        FollowUpEngine {
            store: self.store,
            scheduler,
            sequencer,
            responses,
            control,
            fire_rx: Mutex::new(Some(fire_rx)),
            driver: Mutex::new(None),
        }
    }
}

/// The assembled sequencing engine.
pub struct FollowUpEngine {
    store: Arc<dyn SequenceStore>,
    scheduler: Arc<Scheduler>,
    sequencer: Arc<Sequencer>,
    responses: ResponseHandler,
    control: FollowUpControl,
    fire_rx: Mutex<Option<mpsc::UnboundedReceiver<TimerFire>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FollowUpEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowUpEngine")
            .field("sequencer", &self.sequencer)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl FollowUpEngine {
    /// Spawns the driver loop that turns timer fires into sequencer calls.
    /// Each fire runs on its own task so a slow dispatch never delays other
    /// follow-ups. Returns false if the engine was already started.
    pub fn start(&self) -> bool {
        let Some(mut fire_rx) = self.fire_rx.lock().take() else {
            return false;
        };
        let sequencer = self.sequencer.clone();
        let handle = tokio::spawn(async move {
            while let Some(fire) = fire_rx.recv().await {
                let sequencer = sequencer.clone();
                tokio::spawn(async move {
                    let follow_up_id = fire.follow_up_id;
                    let outcome = sequencer.handle_fire(fire).await;
                    debug!(follow_up_id = %follow_up_id, outcome = ?outcome, "Timer fire handled");
                });
            }
            info!("Timer driver stopped");
        });
        *self.driver.lock() = Some(handle);
        info!("Timer driver started");
        true
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
            info!("Timer driver shut down");
        }
    }

    /// Re-arms timers persisted before a restart, then arms any active
    /// follow-up that has a due time but lost its job.
    pub async fn recover(&self) -> FollowUpResult<usize> {
        let mut recovered = self.scheduler.recover().await?;
        for follow_up in self.store.active_follow_ups().await? {
            if follow_up.waiting_for_response || self.scheduler.is_armed(follow_up.id) {
                continue;
            }
            let Some(due_at) = follow_up.next_message_at else {
                continue;
            };
            self.scheduler
                .schedule_at(follow_up.id, follow_up.current_step_index, due_at)
                .await;
            debug!(follow_up_id = %follow_up.id, "Armed follow-up without a persisted job");
            recovered += 1;
        }
        Ok(recovered)
    }

    pub async fn enroll(
        &self,
        campaign_id: CampaignId,
        client_id: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> FollowUpResult<FollowUpId> {
        self.control.enroll(campaign_id, client_id, metadata).await
    }

    pub async fn process_step(&self, follow_up_id: FollowUpId) -> StepOutcome {
        self.sequencer.process_step(follow_up_id).await
    }

    pub async fn pause(&self, id: FollowUpId) -> FollowUpResult<FollowUpInstance> {
        self.control.pause(id).await
    }

    pub async fn resume(&self, id: FollowUpId) -> FollowUpResult<FollowUpInstance> {
        self.control.resume(id).await
    }

    pub async fn advance_manually(&self, id: FollowUpId) -> FollowUpResult<StepOutcome> {
        self.control.advance_manually(id).await
    }

    pub async fn cancel(&self, id: FollowUpId) -> FollowUpResult<FollowUpInstance> {
        self.control.cancel(id).await
    }

    pub async fn status(&self, id: FollowUpId) -> FollowUpResult<FollowUpSnapshot> {
        self.control.status(id).await
    }

    pub async fn on_client_message(
        &self,
        client_id: &str,
        text: &str,
    ) -> Vec<(FollowUpId, ResponseOutcome)> {
        self.responses.on_client_message(client_id, text).await
    }

    pub async fn on_inbound(&self, message: InboundMessage) -> Vec<(FollowUpId, ResponseOutcome)> {
        self.responses.on_inbound(message).await
    }

    pub async fn on_delivery_update(
        &self,
        message_id: MessageId,
        status: DeliveryStatus,
    ) -> Option<ResponseOutcome> {
        self.responses.on_delivery_update(message_id, status).await
    }

    pub async fn on_provider_receipt(
        &self,
        provider_message_id: &str,
        status: &str,
    ) -> Option<ResponseOutcome> {
        self.responses
            .on_provider_receipt(provider_message_id, status)
            .await
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn SequenceStore> {
        &self.store
    }
}

impl Drop for FollowUpEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Seeds a three-stage demo campaign for development. Steps are stored in
/// the raw structured form, mixing the field spellings older editors used.
pub fn seed_demo_campaign(store: &InMemoryStore) -> CampaignId {
    info!("Seeding demo campaign");

    let campaign_id = Uuid::new_v4();
    let intro = FunnelStage {
        id: Uuid::new_v4(),
        name: "Primeiro contato".to_string(),
        order: 1,
    };
    let pitch = FunnelStage {
        id: Uuid::new_v4(),
        name: "Apresentação".to_string(),
        order: 2,
    };
    let closing = FunnelStage {
        id: Uuid::new_v4(),
        name: "Fechamento".to_string(),
        order: 3,
    };

    let steps = json!([
        {
            "stage_id": intro.id,
            "message": "Olá {{client_name}}! Obrigado pelo interesse. Posso te ajudar?",
            "delay": "imediatamente",
            "template_name": "boas_vindas",
            "category": "utility"
        },
        {
            "funnel_stage_id": intro.id,
            "message_content": "{{client_name}}, ficou alguma dúvida sobre o que conversamos?",
            "wait_time": "2 horas",
            "auto_respond": true
        },
        {
            "stage_id": pitch.id,
            "message": "Separei uma proposta pensada para você, {{client_name}}.",
            "delay": "imediatamente",
            "template_name": "proposta",
            "category": "marketing"
        },
        {
            "stage_id": pitch.id,
            "message": "Conseguiu dar uma olhada na proposta?",
            "delay": "1 dia"
        },
        {
            "stage_id": closing.id,
            "message": "Podemos fechar hoje? Tenho uma condição especial válida até amanhã.",
            "delay": "30m",
            "category": "marketing"
        },
        {
            "stage_id": closing.id,
            "message": "Última chamada, {{client_name}}! Qualquer coisa é só responder.",
            "delay": "2 dias"
        }
    ]);

    store.insert_campaign(CampaignRecord {
        id: campaign_id,
        name: "Demo: funil de vendas".to_string(),
        stages: vec![intro, pitch, closing],
        steps: Some(steps),
    });

    info!(campaign_id = %campaign_id, "Seeded demo campaign");
    campaign_id
}
