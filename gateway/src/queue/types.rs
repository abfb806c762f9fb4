//! Canonical event types published to the bus.
//!
//! Two shapes leave the gateway:
//! - `InboundMessage`: one customer-originated message
//! - `StatusUpdate`: a delivery-state change for a message we sent

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{Channel, ChannelType};

/// Queue bound to every inbound routing key.
pub const INBOUND_QUEUE: &str = "inbound_messages";

/// Queue bound to every status routing key.
pub const STATUS_QUEUE: &str = "status_updates";

pub const INBOUND_ROUTING_PREFIX: &str = "messages.inbound";
pub const STATUS_ROUTING_PREFIX: &str = "messages.status";

pub type Metadata = BTreeMap<String, String>;

// =============================================================================
// Content & Status Vocabularies
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Location,
    Contact,
    Interactive,
    Sticker,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Image => "image",
            ContentType::Video => "video",
            ContentType::Audio => "audio",
            ContentType::Document => "document",
            ContentType::Location => "location",
            ContentType::Contact => "contact",
            ContentType::Interactive => "interactive",
            ContentType::Sticker => "sticker",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw.trim().to_ascii_lowercase().as_str() {
            "text" => ContentType::Text,
            "image" => ContentType::Image,
            "video" => ContentType::Video,
            "audio" => ContentType::Audio,
            "document" | "file" => ContentType::Document,
            "location" => ContentType::Location,
            "contact" | "contacts" => ContentType::Contact,
            "interactive" => ContentType::Interactive,
            "sticker" => ContentType::Sticker,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Sent => "sent",
            Status::Delivered => "delivered",
            Status::Read => "read",
            Status::Failed => "failed",
        }
    }
}

// =============================================================================
// Canonical Envelopes
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: ContentType,
    /// Fetchable URL or an opaque provider media reference.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
}

impl Attachment {
    pub fn new(kind: ContentType, url: impl Into<String>) -> Self {
        Attachment {
            kind,
            url: url.into(),
            mime_type: None,
            filename: None,
            size_bytes: None,
            metadata: Metadata::new(),
        }
    }

    pub fn mime(mut self, mime_type: Option<&str>) -> Self {
        self.mime_type = mime_type.filter(|m| !m.is_empty()).map(str::to_string);
        self
    }

    pub fn filename(mut self, filename: Option<&str>) -> Self {
        self.filename = filename.filter(|f| !f.is_empty()).map(str::to_string);
        self
    }

    pub fn size(mut self, size_bytes: Option<u64>) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.metadata.insert(key.to_string(), value);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: Uuid,
    pub tenant_id: String,
    pub channel_id: String,
    pub channel_type: ChannelType,
    pub external_id: String,
    pub content_type: ContentType,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn routing_key(&self) -> String {
        format!("{}.{}", INBOUND_ROUTING_PREFIX, self.channel_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Internal message id, when the provider echoes one back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub external_id: String,
    pub tenant_id: String,
    pub channel_id: String,
    pub channel_type: ChannelType,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn routing_key(&self) -> String {
        format!("{}.{}", STATUS_ROUTING_PREFIX, self.channel_type)
    }

    /// Bus message id: `{external_id}-{status}-{nanos}`.
    pub fn bus_message_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.external_id,
            self.status.as_str(),
            self.timestamp.timestamp_nanos_opt().unwrap_or_default()
        )
    }

    pub fn for_channel(channel: &Channel, external_id: String, status: Status) -> Self {
        StatusUpdate {
            message_id: None,
            external_id,
            tenant_id: channel.tenant_id.clone(),
            channel_id: channel.id.clone(),
            channel_type: channel.channel_type,
            status,
            error_message: None,
            metadata: Metadata::new(),
            timestamp: Utc::now(),
        }
    }
}
