//! No-op gateway backend.
//!
//! Used when the daemon runs without a messaging client attached. Every
//! operation fails as a transient API error, so nothing ever gets posted and
//! no compliance verdict is ever fabricated.

use async_trait::async_trait;
use tracing::debug;

use super::{ChannelGateway, ChannelPermissions, GatewayError};

/// Gateway that refuses all operations.
pub struct NoopGateway;

#[async_trait]
impl ChannelGateway for NoopGateway {
    async fn check_permissions(
        &self,
        channel_external_id: &str,
    ) -> Result<ChannelPermissions, GatewayError> {
        debug!(channel = %channel_external_id, "NoopGateway: check_permissions");
        Ok(ChannelPermissions::default())
    }

    async fn post(&self, channel_external_id: &str, _text: &str) -> Result<i64, GatewayError> {
        debug!(channel = %channel_external_id, "NoopGateway: post rejected");
        Err(GatewayError::Api("no messaging backend configured".into()))
    }

    async fn pin(&self, channel_external_id: &str, _message_id: i64) -> Result<(), GatewayError> {
        debug!(channel = %channel_external_id, "NoopGateway: pin rejected");
        Err(GatewayError::Api("no messaging backend configured".into()))
    }

    async fn is_still_pinned(
        &self,
        channel_external_id: &str,
        _message_id: i64,
    ) -> Result<bool, GatewayError> {
        debug!(channel = %channel_external_id, "NoopGateway: is_still_pinned rejected");
        Err(GatewayError::Api("no messaging backend configured".into()))
    }
}
