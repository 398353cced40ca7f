//! Inbound webhook normalization. Turns provider payloads into client
//! replies and delivery receipts the engine understands.

use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use followup_core::types::InboundMessage;

/// A provider's report on an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
    /// Raw provider status, mapped later by `DeliveryStatus::from_provider`.
    pub status: String,
}

/// Everything one webhook call carried.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundBatch {
    pub messages: Vec<InboundMessage>,
    pub receipts: Vec<DeliveryReceipt>,
}

impl InboundBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.receipts.is_empty()
    }

    /// Normalizes a WhatsApp Cloud API webhook body.
    ///
    /// Only text messages are taken as replies; media and interactive
    /// messages carry no body the engine can use and are skipped.
    pub fn from_whatsapp_webhook(body: &Value) -> anyhow::Result<Self> {
        let entries = body
            .get("entry")
            .and_then(Value::as_array)
            .context("webhook body has no entry array")?;

        let mut batch = InboundBatch::default();
        for change in entries
            .iter()
            .filter_map(|e| e.get("changes").and_then(Value::as_array))
            .flatten()
        {
            let Some(value) = change.get("value") else {
                continue;
            };

            for message in value
                .get("messages")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let from = message.get("from").and_then(Value::as_str);
                let text = message
                    .get("text")
                    .and_then(|t| t.get("body"))
                    .and_then(Value::as_str);
                let (Some(from), Some(text)) = (from, text) else {
                    debug!(kind = ?message.get("type"), "Skipping non-text WhatsApp message");
                    continue;
                };

                let mut inbound = InboundMessage::new(from, text);
                if let Some(id) = message.get("id").and_then(Value::as_str) {
                    inbound = inbound.with_event_id(id);
                }
                if let Some(at) = message.get("timestamp").and_then(parse_epoch) {
                    inbound.received_at = at;
                }
                batch.messages.push(inbound);
            }

            for status in value
                .get("statuses")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let id = status.get("id").and_then(Value::as_str);
                let state = status.get("status").and_then(Value::as_str);
                match (id, state) {
                    (Some(id), Some(state)) => batch.receipts.push(DeliveryReceipt {
                        provider_message_id: id.to_string(),
                        status: state.to_string(),
                    }),
                    _ => warn!("WhatsApp status entry without id or status"),
                }
            }
        }

        batch.record("whatsapp");
        Ok(batch)
    }

    /// Normalizes a Twilio webhook form. Inbound SMS carries `From` and
    /// `Body`; status callbacks carry `MessageSid` and `MessageStatus`.
    pub fn from_twilio_form(form: &HashMap<String, String>) -> anyhow::Result<Self> {
        let mut batch = InboundBatch::default();

        if let Some(status) = form.get("MessageStatus") {
            let sid = form
                .get("MessageSid")
                .or_else(|| form.get("SmsSid"))
                .context("status callback without MessageSid")?;
            batch.receipts.push(DeliveryReceipt {
                provider_message_id: sid.clone(),
                status: status.clone(),
            });
        } else {
            let from = form.get("From").context("inbound SMS without From")?;
            let body = form.get("Body").map(String::as_str).unwrap_or_default();
            let mut inbound = InboundMessage::new(from.clone(), body);
            if let Some(sid) = form.get("MessageSid").or_else(|| form.get("SmsSid")) {
                inbound = inbound.with_event_id(sid.clone());
            }
            batch.messages.push(inbound);
        }

        batch.record("sms");
        Ok(batch)
    }

    fn record(&self, source: &'static str) {
        metrics::counter!("ingest.replies", "source" => source)
            .increment(self.messages.len() as u64);
        metrics::counter!("ingest.receipts", "source" => source)
            .increment(self.receipts.len() as u64);
        debug!(
            source = source,
            replies = self.messages.len(),
            receipts = self.receipts.len(),
            "Webhook normalized"
        );
    }
}

/// WhatsApp sends unix seconds as a string.
fn parse_epoch(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::String(s) => s.parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_whatsapp_webhook() {
        let body = json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "123",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messages": [
                            {
                                "from": "5511999990000",
                                "id": "wamid.abc",
                                "timestamp": "1700000000",
                                "type": "text",
                                "text": { "body": "Tenho interesse" }
                            },
                            {
                                "from": "5511999990000",
                                "id": "wamid.img",
                                "type": "image",
                                "image": { "id": "media-1" }
                            }
                        ],
                        "statuses": [
                            { "id": "wamid.out1", "status": "delivered" }
                        ]
                    }
                }]
            }]
        });

        let batch = InboundBatch::from_whatsapp_webhook(&body).unwrap();
        assert_eq!(batch.messages.len(), 1);
        let reply = &batch.messages[0];
        assert_eq!(reply.client_id, "5511999990000");
        assert_eq!(reply.text, "Tenho interesse");
        assert_eq!(reply.fingerprint(), "event:wamid.abc");
        assert_eq!(reply.received_at.timestamp(), 1_700_000_000);

        assert_eq!(
            batch.receipts,
            vec![DeliveryReceipt {
                provider_message_id: "wamid.out1".to_string(),
                status: "delivered".to_string(),
            }]
        );
    }

    #[test]
    fn test_whatsapp_webhook_without_entry_is_rejected() {
        assert!(InboundBatch::from_whatsapp_webhook(&json!({"object": "x"})).is_err());
        let empty = InboundBatch::from_whatsapp_webhook(&json!({"entry": []})).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_twilio_forms() {
        let inbound: HashMap<String, String> = [
            ("From", "+15551234567"),
            ("Body", "yes please"),
            ("MessageSid", "SM1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let batch = InboundBatch::from_twilio_form(&inbound).unwrap();
        assert_eq!(batch.messages[0].text, "yes please");
        assert_eq!(batch.messages[0].event_id.as_deref(), Some("SM1"));
        assert!(batch.receipts.is_empty());

        let status: HashMap<String, String> =
            [("MessageSid", "SM2"), ("MessageStatus", "undelivered")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        let batch = InboundBatch::from_twilio_form(&status).unwrap();
        assert!(batch.messages.is_empty());
        assert_eq!(batch.receipts[0].status, "undelivered");

        assert!(InboundBatch::from_twilio_form(&HashMap::new()).is_err());
    }
}
