//! In-process gateway that records every send. Used for local runs and as
//! the test double of the dispatch boundary.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use followup_core::gateway::DispatchGateway;
use followup_core::types::{DeliveryResult, TemplateMeta};

/// How the loopback answers sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackMode {
    /// Accepted and delivered right away.
    Sent,
    /// Accepted; delivery is confirmed later through a receipt.
    Pending,
    /// Rejected by the provider.
    Fail,
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub client_id: String,
    pub rendered: String,
    pub meta: TemplateMeta,
    pub provider_message_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}

pub struct LoopbackGateway {
    mode: Mutex<LoopbackMode>,
    sent: Mutex<Vec<SentMessage>>,
    counter: AtomicU64,
}

impl Default for LoopbackGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackGateway {
    pub fn new() -> Self {
        Self::with_mode(LoopbackMode::Sent)
    }

    pub fn with_mode(mode: LoopbackMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            sent: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn set_mode(&self, mode: LoopbackMode) {
        *self.mode.lock() = mode;
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn sent_to(&self, client_id: &str) -> Vec<SentMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.client_id == client_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DispatchGateway for LoopbackGateway {
    async fn send(&self, client_id: &str, rendered: &str, meta: &TemplateMeta) -> DeliveryResult {
        let mode = *self.mode.lock();
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let result = match mode {
            LoopbackMode::Sent => DeliveryResult::sent(format!("loopback-{}", n)),
            LoopbackMode::Pending => DeliveryResult::pending(format!("loopback-{}", n)),
            LoopbackMode::Fail => DeliveryResult::failed("loopback configured to fail"),
        };

        tracing::info!(
            client_id = client_id,
            step_id = %meta.step_id,
            status = ?result.status,
            text = rendered,
            "Loopback send"
        );

        self.sent.lock().push(SentMessage {
            client_id: client_id.to_string(),
            rendered: rendered.to_string(),
            meta: meta.clone(),
            provider_message_id: result.provider_message_id.clone(),
            sent_at: Utc::now(),
        });
        result
    }

    fn name(&self) -> &str {
        "loopback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use followup_core::types::DeliveryStatus;
    use uuid::Uuid;

    fn meta() -> TemplateMeta {
        TemplateMeta {
            campaign_id: Uuid::new_v4(),
            follow_up_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            template_name: None,
            category: None,
            auto_respond: false,
        }
    }

    #[tokio::test]
    async fn test_modes() {
        let gateway = LoopbackGateway::new();
        assert_eq!(gateway.send("a", "one", &meta()).await.status, DeliveryStatus::Sent);

        gateway.set_mode(LoopbackMode::Pending);
        assert_eq!(gateway.send("a", "two", &meta()).await.status, DeliveryStatus::Pending);

        gateway.set_mode(LoopbackMode::Fail);
        let failed = gateway.send("b", "three", &meta()).await;
        assert!(failed.is_failure());
        assert!(failed.provider_message_id.is_none());

        assert_eq!(gateway.sent_count(), 3);
        assert_eq!(gateway.sent_to("a").len(), 2);
        assert_eq!(gateway.sent()[1].rendered, "two");
    }
}
