//! Contract of the outbound messaging channel.

use async_trait::async_trait;

use crate::types::{DeliveryResult, TemplateMeta};

/// Sends one rendered message to a client.
///
/// Implementations report every outcome, including transport failures,
/// through [`DeliveryResult`] rather than an error, so the sequencer can
/// record the attempt and keep the follow-up moving.
#[async_trait]
pub trait DispatchGateway: Send + Sync {
    async fn send(&self, client_id: &str, rendered: &str, meta: &TemplateMeta) -> DeliveryResult;

    /// Provider name used in logs and metrics labels.
    fn name(&self) -> &str;
}
