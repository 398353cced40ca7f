//! Messaging channels for the follow-up engine.
//!
//! Outbound: Dispatch Gateway implementations (WhatsApp Business, Twilio SMS
//! and an in-process loopback). Inbound: normalization of provider webhooks
//! into client messages and delivery receipts.

pub mod ingest;
pub mod loopback;
pub mod sms;
pub mod whatsapp;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use followup_core::config::DispatchConfig;
use followup_core::gateway::DispatchGateway;

pub use ingest::{DeliveryReceipt, InboundBatch};
pub use loopback::{LoopbackGateway, LoopbackMode};
pub use sms::SmsProvider;
pub use whatsapp::WhatsAppProvider;

/// Builds the gateway named by `config.provider`.
pub fn build_gateway(config: &DispatchConfig) -> Result<Arc<dyn DispatchGateway>> {
    match config.provider.as_str() {
        "loopback" => Ok(Arc::new(LoopbackGateway::new())),
        "whatsapp" => {
            let token = config
                .access_token
                .clone()
                .ok_or_else(|| anyhow!("whatsapp provider requires dispatch.access_token"))?;
            let phone_number_id = config
                .phone_number_id
                .clone()
                .ok_or_else(|| anyhow!("whatsapp provider requires dispatch.phone_number_id"))?;
            Ok(Arc::new(WhatsAppProvider::new(
                config.api_base_url.clone(),
                token,
                phone_number_id,
            )))
        }
        "sms" => {
            let account_sid = config
                .account_sid
                .clone()
                .ok_or_else(|| anyhow!("sms provider requires dispatch.account_sid"))?;
            let auth_token = config
                .access_token
                .clone()
                .ok_or_else(|| anyhow!("sms provider requires dispatch.access_token"))?;
            let from_number = config
                .from_number
                .clone()
                .ok_or_else(|| anyhow!("sms provider requires dispatch.from_number"))?;
            Ok(Arc::new(SmsProvider::new(sms::TwilioConfig {
                account_sid,
                auth_token,
                from_number,
                status_callback_url: None,
            })))
        }
        other => Err(anyhow!("unknown dispatch provider: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_gateway() {
        let mut config = DispatchConfig::default();
        assert_eq!(build_gateway(&config).unwrap().name(), "loopback");

        config.provider = "whatsapp".to_string();
        assert!(build_gateway(&config).is_err());
        config.access_token = Some("token".to_string());
        config.phone_number_id = Some("1234".to_string());
        assert_eq!(build_gateway(&config).unwrap().name(), "whatsapp");

        config.provider = "sms".to_string();
        assert!(build_gateway(&config).is_err());
        config.account_sid = Some("AC123".to_string());
        config.from_number = Some("+15550001111".to_string());
        assert_eq!(build_gateway(&config).unwrap().name(), "sms");

        config.provider = "pigeon".to_string();
        assert!(build_gateway(&config).is_err());
    }
}
