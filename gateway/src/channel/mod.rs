//! Channel records: a tenant's connected provider account.
//!
//! The gateway only reads these. Credentials are opaque secrets and are
//! redacted from `Debug` output and never serialized back out.

pub mod registry;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use registry::{ChannelRegistry, InMemoryChannelRegistry};

/// Provider family a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    WhatsappOfficial,
    Telegram,
    Sms,
    Facebook,
    Instagram,
    Rcs,
    Email,
    Generic,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::WhatsappOfficial => "whatsapp_official",
            ChannelType::Telegram => "telegram",
            ChannelType::Sms => "sms",
            ChannelType::Facebook => "facebook",
            ChannelType::Instagram => "instagram",
            ChannelType::Rcs => "rcs",
            ChannelType::Email => "email",
            ChannelType::Generic => "generic",
        }
    }

    /// Map the `{provider}` URL segment onto a channel type.
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        match segment.to_ascii_lowercase().as_str() {
            "whatsapp" | "whatsapp_official" => Some(ChannelType::WhatsappOfficial),
            "telegram" => Some(ChannelType::Telegram),
            "sms" | "twilio" => Some(ChannelType::Sms),
            "facebook" | "messenger" => Some(ChannelType::Facebook),
            "instagram" => Some(ChannelType::Instagram),
            "rcs" => Some(ChannelType::Rcs),
            "email" => Some(ChannelType::Email),
            "generic" => Some(ChannelType::Generic),
            _ => None,
        }
    }

    /// Providers that subscribe webhooks with a `hub.challenge` handshake.
    pub fn supports_handshake(&self) -> bool {
        matches!(
            self,
            ChannelType::WhatsappOfficial | ChannelType::Facebook | ChannelType::Instagram
        )
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Inactive,
    #[default]
    Active,
    Error,
    Disconnected,
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default, skip_serializing)]
    pub credentials: HashMap<String, String>,
}

impl Channel {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, channel_type: ChannelType) -> Self {
        Channel {
            id: id.into(),
            tenant_id: tenant_id.into(),
            channel_type,
            name: String::new(),
            enabled: true,
            status: ChannelStatus::Active,
            config: HashMap::new(),
            credentials: HashMap::new(),
        }
    }

    pub fn with_credential(mut self, key: &str, value: &str) -> Self {
        self.credentials.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_config(mut self, key: &str, value: &str) -> Self {
        self.config.insert(key.to_string(), value.to_string());
        self
    }

    /// A credential value, ignoring blank entries.
    pub fn credential(&self, key: &str) -> Option<&str> {
        non_blank(self.credentials.get(key))
    }

    /// The first non-blank credential among `keys`.
    pub fn first_credential(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.credential(k))
    }

    pub fn config_value(&self, key: &str) -> Option<&str> {
        non_blank(self.config.get(key))
    }

    /// `config["provider"]`, lowercased. Selects the RCS and email sub-parser.
    pub fn provider(&self) -> Option<String> {
        self.config_value("provider").map(|p| p.trim().to_ascii_lowercase())
    }

    /// Token compared against `hub.verify_token` during subscription.
    pub fn verify_token(&self) -> Option<&str> {
        self.credential("verify_token")
            .or_else(|| self.config_value("verify_token"))
    }
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.trim().is_empty())
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut credential_keys: Vec<&str> = self.credentials.keys().map(String::as_str).collect();
        credential_keys.sort_unstable();

        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("channel_type", &self.channel_type)
            .field("enabled", &self.enabled)
            .field("status", &self.status)
            .field("config", &self.config)
            .field("credentials", &format_args!("<redacted: {:?}>", credential_keys))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_credentials() {
        let channel = Channel::new("ch-1", "t-1", ChannelType::Telegram)
            .with_credential("webhook_secret", "super-secret-value");
        let rendered = format!("{:?}", channel);
        assert!(!rendered.contains("super-secret-value"));
        assert!(rendered.contains("webhook_secret"));
    }

    #[test]
    fn test_credentials_not_serialized() {
        let channel = Channel::new("ch-1", "t-1", ChannelType::Sms)
            .with_credential("auth_token", "tok");
        let json = serde_json::to_string(&channel).unwrap();
        assert!(!json.contains("auth_token"));
        assert!(json.contains("\"type\":\"sms\""));
    }

    #[test]
    fn test_deserialize_channel_record() {
        let json = r#"{
            "id": "9f1c",
            "tenant_id": "acme",
            "type": "whatsapp_official",
            "config": {"phone_number_id": "123"},
            "credentials": {"app_secret": "s", "verify_token": ""}
        }"#;
        let channel: Channel = serde_json::from_str(json).unwrap();
        assert_eq!(channel.channel_type, ChannelType::WhatsappOfficial);
        assert!(channel.enabled);
        assert_eq!(channel.credential("app_secret"), Some("s"));
        assert_eq!(channel.verify_token(), None);
    }

    #[test]
    fn test_path_segments() {
        assert_eq!(ChannelType::from_path_segment("whatsapp"), Some(ChannelType::WhatsappOfficial));
        assert_eq!(ChannelType::from_path_segment("twilio"), Some(ChannelType::Sms));
        assert_eq!(ChannelType::from_path_segment("pager"), None);
    }
}
