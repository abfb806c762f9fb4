//! Meta-style subscription handshake.
//!
//! Providers that support it send `GET ?hub.mode=subscribe&hub.verify_token=..&hub.challenge=..`
//! once when the webhook is registered. The challenge is echoed back when
//! the token matches the channel's configured verify token.

use serde::Deserialize;
use tracing::{info, warn};

use super::signature::constant_time_compare;
use crate::channel::Channel;
use crate::error::GatewayError;

#[derive(Debug, Default, Deserialize)]
pub struct HubQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Returns the challenge to echo, or [`GatewayError::VerificationFailed`].
///
/// Channel types without a handshake get [`GatewayError::MethodNotAllowed`].
pub fn verify_subscription(channel: &Channel, query: HubQuery) -> Result<String, GatewayError> {
    if !channel.channel_type.supports_handshake() {
        return Err(GatewayError::MethodNotAllowed);
    }

    let token_matches = match (channel.verify_token(), query.verify_token.as_deref()) {
        (Some(expected), Some(provided)) => constant_time_compare(expected, provided),
        _ => false,
    };

    if query.mode.as_deref() != Some("subscribe") || !token_matches {
        warn!(
            channel_id = %channel.id,
            mode = ?query.mode,
            has_verify_token = channel.verify_token().is_some(),
            "webhook_handshake_rejected"
        );
        return Err(GatewayError::VerificationFailed);
    }

    info!(channel_id = %channel.id, "webhook_handshake_accepted");
    Ok(query.challenge.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelType;

    fn query(mode: &str, token: &str, challenge: &str) -> HubQuery {
        HubQuery {
            mode: Some(mode.to_string()),
            verify_token: Some(token.to_string()),
            challenge: Some(challenge.to_string()),
        }
    }

    #[test]
    fn test_challenge_echoed() {
        let channel = Channel::new("c", "t", ChannelType::Facebook).with_credential("verify_token", "vt");
        assert_eq!(verify_subscription(&channel, query("subscribe", "vt", "1158201444")).unwrap(), "1158201444");
    }

    #[test]
    fn test_wrong_token_or_mode() {
        let channel = Channel::new("c", "t", ChannelType::WhatsappOfficial).with_config("verify_token", "vt");
        assert!(matches!(
            verify_subscription(&channel, query("subscribe", "nope", "x")),
            Err(GatewayError::VerificationFailed)
        ));
        assert!(matches!(
            verify_subscription(&channel, query("unsubscribe", "vt", "x")),
            Err(GatewayError::VerificationFailed)
        ));
        assert!(matches!(
            verify_subscription(&channel, HubQuery::default()),
            Err(GatewayError::VerificationFailed)
        ));
    }

    #[test]
    fn test_channel_without_token_rejects() {
        let channel = Channel::new("c", "t", ChannelType::Instagram);
        assert!(matches!(
            verify_subscription(&channel, query("subscribe", "", "x")),
            Err(GatewayError::VerificationFailed)
        ));
    }

    #[test]
    fn test_handshake_not_supported() {
        let channel = Channel::new("c", "t", ChannelType::Telegram).with_credential("verify_token", "vt");
        assert!(matches!(
            verify_subscription(&channel, query("subscribe", "vt", "x")),
            Err(GatewayError::MethodNotAllowed)
        ));
    }
}
