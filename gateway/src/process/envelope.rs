//! Shared helpers for building canonical envelopes.
//!
//! Parsers describe a message with an [`InboundDraft`] and call
//! [`InboundDraft::finish`] with the resolved channel. Finishing guarantees a
//! non-empty external id and strips empty metadata values.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::channel::Channel;
use crate::queue::{Attachment, ContentType, InboundMessage, Metadata};

// =============================================================================
// Content-Type Lookup
// =============================================================================

/// Provider families with their own message-kind vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    WhatsApp,
    Telegram,
    Messenger,
    Instagram,
    Rcs,
}

use ContentType::{
    Audio, Contact, Document, Image, Interactive, Location, Sticker, Text, Video,
};

const WHATSAPP_KINDS: &[(&str, ContentType)] = &[
    ("text", Text),
    ("image", Image),
    ("video", Video),
    ("audio", Audio),
    ("voice", Audio),
    ("document", Document),
    ("sticker", Sticker),
    ("location", Location),
    ("contacts", Contact),
    ("interactive", Interactive),
    ("button", Interactive),
    ("order", Interactive),
    ("reaction", Text),
    ("system", Text),
];

const TELEGRAM_KINDS: &[(&str, ContentType)] = &[
    ("text", Text),
    ("photo", Image),
    ("document", Document),
    ("animation", Video),
    ("voice", Audio),
    ("audio", Audio),
    ("video", Video),
    ("video_note", Video),
    ("sticker", Sticker),
    ("location", Location),
    ("venue", Location),
    ("contact", Contact),
    ("callback_query", Interactive),
];

const MESSENGER_KINDS: &[(&str, ContentType)] = &[
    ("text", Text),
    ("image", Image),
    ("video", Video),
    ("audio", Audio),
    ("file", Document),
    ("location", Location),
    ("sticker", Sticker),
    ("fallback", Text),
    ("template", Interactive),
    ("quick_reply", Interactive),
    ("postback", Interactive),
    ("reaction", Text),
];

const INSTAGRAM_KINDS: &[(&str, ContentType)] = &[
    ("text", Text),
    ("image", Image),
    ("video", Video),
    ("audio", Audio),
    ("file", Document),
    ("sticker", Sticker),
    ("share", Text),
    ("story_mention", Image),
    ("reel", Video),
    ("ig_reel", Video),
    ("quick_reply", Interactive),
    ("postback", Interactive),
    ("reaction", Text),
];

const RCS_KINDS: &[(&str, ContentType)] = &[
    ("text", Text),
    ("image", Image),
    ("video", Video),
    ("audio", Audio),
    ("file", Document),
    ("document", Document),
    ("location", Location),
    ("suggestion", Interactive),
    ("suggestion_response", Interactive),
    ("postback", Interactive),
];

impl Family {
    fn table(&self) -> &'static [(&'static str, ContentType)] {
        match self {
            Family::WhatsApp => WHATSAPP_KINDS,
            Family::Telegram => TELEGRAM_KINDS,
            Family::Messenger => MESSENGER_KINDS,
            Family::Instagram => INSTAGRAM_KINDS,
            Family::Rcs => RCS_KINDS,
        }
    }
}

/// Canonical content type for a provider message kind, if the kind is known.
pub fn content_type_for(family: Family, kind: &str) -> Option<ContentType> {
    family
        .table()
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(kind))
        .map(|(_, ct)| *ct)
}

/// Media category from a MIME type. Anything that is not image, video or
/// audio is a document.
pub fn content_type_for_mime(mime: &str) -> ContentType {
    let mime = mime.trim().to_ascii_lowercase();
    if mime.starts_with("image/") {
        Image
    } else if mime.starts_with("video/") {
        Video
    } else if mime.starts_with("audio/") {
        Audio
    } else {
        Document
    }
}

// =============================================================================
// Identifiers
// =============================================================================

/// Render a numeric provider id as decimal text.
pub fn format_id(id: i64) -> String {
    id.to_string()
}

/// An identifier that providers send either as a JSON number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    Signed(i64),
    Unsigned(u64),
    Text(String),
}

impl Default for IdValue {
    fn default() -> Self {
        IdValue::Text(String::new())
    }
}

impl IdValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdValue::Text(s) if s.is_empty())
    }
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Signed(v) => write!(f, "{}", v),
            IdValue::Unsigned(v) => write!(f, "{}", v),
            IdValue::Text(s) => f.write_str(s),
        }
    }
}

/// Deterministic stand-in for a provider that sent no message id.
///
/// Hashing the channel and item fields means a provider retry of the same
/// callback synthesizes the same id.
pub fn synthesize_external_id(channel_id: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(channel_id.as_bytes());
    for part in parts {
        hasher.update([0x1f]);
        hasher.update(part.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("syn-{}", &digest[..32])
}

// =============================================================================
// Timestamps
// =============================================================================

pub fn from_unix_seconds(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

pub fn from_unix_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Unix seconds carried as text, as WhatsApp and Twilio-style payloads do.
pub fn parse_unix_seconds(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return from_unix_seconds(secs);
    }
    raw.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(|f| from_unix_seconds(f.trunc() as i64))
}

pub fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// RFC 3339, then unix seconds, then RFC 2822 (email `Date` headers).
pub fn parse_any_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    parse_rfc3339(raw)
        .or_else(|| parse_unix_seconds(raw))
        .or_else(|| {
            DateTime::parse_from_rfc2822(raw.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

// =============================================================================
// Inbound Draft
// =============================================================================

#[derive(Debug, Clone)]
pub struct InboundDraft {
    pub content_type: ContentType,
    pub content: String,
    pub external_id: String,
    pub metadata: Metadata,
    pub attachments: Vec<Attachment>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl InboundDraft {
    pub fn new(content_type: ContentType) -> Self {
        InboundDraft {
            content_type,
            content: String::new(),
            external_id: String::new(),
            metadata: Metadata::new(),
            attachments: Vec::new(),
            timestamp: None,
        }
    }

    /// Draft for a kind missing from the lookup table: text, with the kind
    /// and the raw item kept in metadata.
    pub fn unknown(kind: &str, raw_item: &serde_json::Value) -> Self {
        let mut draft = InboundDraft::new(Text);
        draft.meta("original_type", kind);
        draft.meta("raw_payload", raw_item.to_string());
        draft
    }

    pub fn external_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.external_id = id.into();
        self
    }

    pub fn content(&mut self, content: impl Into<String>) -> &mut Self {
        self.content = content.into();
        self
    }

    /// Insert a metadata entry; empty values are skipped.
    pub fn meta(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        if !value.is_empty() {
            self.metadata.insert(key.to_string(), value);
        }
        self
    }

    pub fn meta_opt(&mut self, key: &str, value: Option<impl Into<String>>) -> &mut Self {
        if let Some(value) = value {
            self.meta(key, value);
        }
        self
    }

    pub fn attach(&mut self, attachment: Attachment) -> &mut Self {
        self.attachments.push(attachment);
        self
    }

    /// Thread linkage to the message this one replies to.
    pub fn reply_to(&mut self, external_id: &str) -> &mut Self {
        self.meta("reply_to_id", external_id)
    }

    pub fn at(&mut self, timestamp: Option<DateTime<Utc>>) -> &mut Self {
        if timestamp.is_some() {
            self.timestamp = timestamp;
        }
        self
    }

    /// Stamp tenant context and produce the canonical message.
    pub fn finish(mut self, channel: &Channel) -> InboundMessage {
        self.metadata.retain(|_, v| !v.is_empty());

        let external_id = if self.external_id.trim().is_empty() {
            self.synthesized_id(&channel.id)
        } else {
            self.external_id
        };

        InboundMessage {
            id: Uuid::new_v4(),
            tenant_id: channel.tenant_id.clone(),
            channel_id: channel.id.clone(),
            channel_type: channel.channel_type,
            external_id,
            content_type: self.content_type,
            content: self.content,
            metadata: self.metadata,
            attachments: self.attachments,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        }
    }

    fn synthesized_id(&self, channel_id: &str) -> String {
        let timestamp = self
            .timestamp
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_default();
        let mut parts: Vec<&str> = vec![
            self.content_type.as_str(),
            self.content.as_str(),
            timestamp.as_str(),
        ];
        for (k, v) in &self.metadata {
            parts.push(k.as_str());
            parts.push(v.as_str());
        }
        for attachment in &self.attachments {
            parts.push(attachment.url.as_str());
        }
        synthesize_external_id(channel_id, &parts)
    }
}
