//! Channel gateway abstraction.
//!
//! The gateway is the boundary to the external messaging platform: posting,
//! pinning and inspecting messages in a channel, plus permission
//! introspection. The daemon ships only the [`noop`] backend; a real
//! messaging client implements [`ChannelGateway`] behind the same trait.
//!
//! Failure categories are kept distinct on purpose: a transient API failure
//! means "compliance unknown", never "non-compliant". Conflating the two
//! causes wrongful refunds.

use async_trait::async_trait;
use thiserror::Error;

use crate::error::ErrorKind;

pub mod noop;

/// What the bot may do in a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelPermissions {
    pub is_admin: bool,
    pub can_post: bool,
    pub can_pin: bool,
}

impl ChannelPermissions {
    /// Permissions required to publish and pin an ad.
    pub fn can_publish(&self) -> bool {
        self.is_admin && self.can_post
    }
}

/// Gateway errors, by failure category.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The bot lacks the rights for the operation.
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    /// The channel or message does not exist, or the request was malformed.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// Transient platform failure. Retryable.
    #[error("api error: {0}")]
    Api(String),
}

impl GatewayError {
    /// Classify into the shared error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ExternalService
    }
}

/// Operations against a channel on the messaging platform.
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    /// Introspect the bot's permissions in a channel.
    async fn check_permissions(
        &self,
        channel_external_id: &str,
    ) -> Result<ChannelPermissions, GatewayError>;

    /// Post a message, returning the platform message id.
    async fn post(&self, channel_external_id: &str, text: &str) -> Result<i64, GatewayError>;

    /// Pin a previously posted message.
    async fn pin(&self, channel_external_id: &str, message_id: i64) -> Result<(), GatewayError>;

    /// Whether the message is still the channel's pinned message.
    async fn is_still_pinned(
        &self,
        channel_external_id: &str,
        message_id: i64,
    ) -> Result<bool, GatewayError>;
}
