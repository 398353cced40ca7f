//! Twilio SMS gateway: send, segment accounting and delivery callbacks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use followup_core::gateway::DispatchGateway;
use followup_core::types::{DeliveryResult, DeliveryStatus, TemplateMeta};

use crate::whatsapp::{normalize_phone, MAX_TRACKED_MESSAGES, TRACKING_RETENTION_DAYS};

/// Configuration for the Twilio SMS provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub status_callback_url: Option<String>,
}

/// An SMS message with delivery tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsMessage {
    pub id: Uuid,
    pub follow_up_id: Uuid,
    pub to: String,
    pub from: String,
    pub body: String,
    pub status: DeliveryStatus,
    pub provider_id: String,
    pub segments: u32,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Twilio provider with an in-memory message index for callbacks.
pub struct SmsProvider {
    config: TwilioConfig,
    messages: DashMap<String, SmsMessage>,
}

impl SmsProvider {
    pub fn new(config: TwilioConfig) -> Self {
        tracing::info!(
            account_sid = %config.account_sid,
            from = %config.from_number,
            "Twilio SMS provider initialized"
        );
        Self {
            config,
            messages: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TwilioConfig {
        &self.config
    }

    pub fn get_message(&self, provider_id: &str) -> Option<SmsMessage> {
        self.messages.get(provider_id).map(|m| m.clone())
    }

    pub fn tracked_count(&self) -> usize {
        self.messages.len()
    }

    /// Handle a Twilio status callback. Returns the mapped status if the
    /// message is known. SMS has no read receipts, so `delivered` and
    /// failures are final and release the message.
    pub fn handle_status_callback(
        &self,
        provider_id: &str,
        status: &str,
        error_code: Option<&str>,
    ) -> Option<DeliveryStatus> {
        let Some(new_status) = DeliveryStatus::from_provider(status) else {
            tracing::warn!(status = %status, "Unknown SMS status in callback");
            return None;
        };
        {
            let Some(mut message) = self.messages.get_mut(provider_id) else {
                tracing::warn!(provider_id = %provider_id, "Status callback for unknown provider_id");
                return None;
            };

            message.status = new_status;
            message.updated_at = Utc::now();
            if let Some(code) = error_code {
                message.error_code = Some(code.to_string());
                tracing::warn!(provider_id = %provider_id, error_code = code, "SMS delivery error");
            }
        }

        if matches!(new_status, DeliveryStatus::Delivered | DeliveryStatus::Failed) {
            self.messages.remove(provider_id);
        }

        tracing::debug!(provider_id = %provider_id, status = %status, "SMS status callback");
        metrics::counter!("sms.status_callbacks", "status" => status.to_string()).increment(1);
        Some(new_status)
    }

    /// Number of SMS segments for a body. GSM 7-bit bodies fit 160
    /// characters in one segment (153 when concatenated), UCS-2 bodies 70
    /// (67 when concatenated).
    pub fn calculate_segments(body: &str) -> u32 {
        let chars = body.chars().count() as u32;
        let (single, multi) = if body.chars().all(is_gsm_7bit) {
            (160, 153)
        } else {
            (70, 67)
        };
        if chars <= single {
            1
        } else {
            chars.div_ceil(multi)
        }
    }
}

const GSM_EXTRA: &str = " !\"#$%&'()*+,-./:;<=>?@_\n\r£¥èéùìòÇØøÅåΔΦΓΛΩΠΨΣΘΞÆæßÉ¤¡¿ÄÖÑÜ§äöñüà";

fn is_gsm_7bit(c: char) -> bool {
    c.is_ascii_alphanumeric() || GSM_EXTRA.contains(c)
}

#[async_trait]
impl DispatchGateway for SmsProvider {
    async fn send(&self, client_id: &str, rendered: &str, meta: &TemplateMeta) -> DeliveryResult {
        let Some(digits) = normalize_phone(client_id) else {
            return DeliveryResult::failed(format!("invalid SMS recipient: {}", client_id));
        };

        let now = Utc::now();
        let provider_id = format!("SM{}", Uuid::new_v4().as_simple());
        let segments = Self::calculate_segments(rendered);
        let message = SmsMessage {
            id: Uuid::new_v4(),
            follow_up_id: meta.follow_up_id,
            to: format!("+{}", digits),
            from: self.config.from_number.clone(),
            body: rendered.to_string(),
            status: DeliveryStatus::Pending,
            provider_id: provider_id.clone(),
            segments,
            error_code: None,
            created_at: now,
            updated_at: now,
        };

        tracing::info!(
            to = %message.to,
            provider_id = %provider_id,
            segments = segments,
            "SMS message queued"
        );
        metrics::counter!("sms.messages_sent").increment(1);
        metrics::counter!("sms.segments").increment(segments as u64);

        if self.messages.len() >= MAX_TRACKED_MESSAGES {
            let cutoff = now - chrono::Duration::days(TRACKING_RETENTION_DAYS);
            self.messages.retain(|_, m| m.created_at > cutoff);
        }
        self.messages.insert(provider_id.clone(), message);
        // Twilio accepts the message into its queue; delivery is confirmed by
        // the status callback.
        DeliveryResult::pending(provider_id)
    }

    fn name(&self) -> &str {
        "sms"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn provider() -> SmsProvider {
        SmsProvider::new(TwilioConfig {
            account_sid: "AC123".to_string(),
            auth_token: "secret".to_string(),
            from_number: "+15550001111".to_string(),
            status_callback_url: None,
        })
    }

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

    #[test]
    fn test_segments() {
        assert_eq!(SmsProvider::calculate_segments(""), 1);
        assert_eq!(SmsProvider::calculate_segments(&"a".repeat(160)), 1);
        assert_eq!(SmsProvider::calculate_segments(&"a".repeat(161)), 2);
        // 'ã' is outside GSM 7-bit.
        assert_eq!(SmsProvider::calculate_segments(&"ã".repeat(70)), 1);
        assert_eq!(SmsProvider::calculate_segments(&"ã".repeat(71)), 2);
    }

    #[tokio::test]
    async fn test_send_is_pending_until_callback() {
        let provider = provider();
        let result = provider.send("+1 555 123 4567", "Hi there", &meta()).await;
        assert_eq!(result.status, DeliveryStatus::Pending);

        let provider_id = result.provider_message_id.unwrap();
        assert_eq!(provider.get_message(&provider_id).unwrap().to, "+15551234567");

        assert_eq!(
            provider.handle_status_callback(&provider_id, "sent", None),
            Some(DeliveryStatus::Sent)
        );
        assert_eq!(provider.get_message(&provider_id).unwrap().status, DeliveryStatus::Sent);

        assert_eq!(
            provider.handle_status_callback(&provider_id, "undelivered", Some("30003")),
            Some(DeliveryStatus::Failed)
        );
        assert!(provider.get_message(&provider_id).is_none());
        assert_eq!(provider.tracked_count(), 0);
        assert_eq!(provider.handle_status_callback(&provider_id, "delivered", None), None);
    }

    #[tokio::test]
    async fn test_delivered_callback_releases_message() {
        let provider = provider();
        let kept = provider.send("+15551234567", "one", &meta()).await;
        let done = provider.send("+15551234568", "two", &meta()).await;
        assert_eq!(provider.tracked_count(), 2);

        let done_id = done.provider_message_id.unwrap();
        assert_eq!(
            provider.handle_status_callback(&done_id, "delivered", None),
            Some(DeliveryStatus::Delivered)
        );
        assert_eq!(provider.tracked_count(), 1);
        assert!(provider.get_message(&kept.provider_message_id.unwrap()).is_some());
    }
}
