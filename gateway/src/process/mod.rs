//! Provider payload parsing.
//!
//! Each provider family implements [`Parser`], turning the raw body of an
//! authenticated callback into canonical events.
//!
//! ## Processing Flow
//!
//! ```text
//! raw body → parser_for(channel type) → ParsedBatch { messages, statuses, failures }
//! ```
//!
//! A body that cannot be decoded at the envelope level is a
//! [`GatewayError::MalformedEnvelope`]. A single bad item inside a valid
//! envelope is recorded in [`ParsedBatch::failures`] and its siblings are
//! still parsed.

pub mod email;
pub mod email_parser;
pub mod envelope;
pub mod facebook;
pub mod generic;
pub mod instagram;
pub mod messenger;
pub mod rcs;
pub mod sms;
pub mod status;
pub mod telegram;
pub mod whatsapp;

use std::fmt;

use axum::http::HeaderMap;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::channel::{Channel, ChannelType};
use crate::error::GatewayError;
use crate::queue::{InboundMessage, StatusUpdate};

pub use email_parser::{parse_raw_email, EmailAttachment, ParsedEmail};
pub use envelope::InboundDraft;
pub use status::{canonicalize, Vocabulary};

/// Everything a parser may look at besides the body.
pub struct ParseContext<'a> {
    pub channel: &'a Channel,
    pub headers: &'a HeaderMap,
}

impl<'a> ParseContext<'a> {
    pub fn new(channel: &'a Channel, headers: &'a HeaderMap) -> Self {
        Self { channel, headers }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// True when the request declares a form-encoded body.
    pub fn is_form(&self) -> bool {
        self.header("content-type")
            .map(|ct| {
                let ct = ct.to_ascii_lowercase();
                ct.contains("application/x-www-form-urlencoded")
            })
            .unwrap_or(false)
    }
}

/// How the HTTP layer should acknowledge a successfully parsed callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ack {
    #[default]
    Ok,
    /// Valid callback that carries nothing we publish.
    Ignored,
    /// Subscription confirmation (SNS), acknowledged without events.
    Confirmed,
}

impl Ack {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ack::Ok => "ok",
            Ack::Ignored => "ignored",
            Ack::Confirmed => "confirmed",
        }
    }
}

/// One batch item that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// Location of the item inside the payload, e.g. `entry[0].messages[2]`.
    pub item: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub messages: Vec<InboundMessage>,
    pub statuses: Vec<StatusUpdate>,
    pub failures: Vec<ItemFailure>,
    pub ack: Ack,
}

impl ParsedBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acknowledged(ack: Ack) -> Self {
        ParsedBatch {
            ack,
            ..Default::default()
        }
    }

    pub fn push_message(&mut self, message: InboundMessage) {
        self.messages.push(message);
    }

    pub fn push_status(&mut self, update: StatusUpdate) {
        self.statuses.push(update);
    }

    /// Record a bad item and move on.
    pub fn push_failure(&mut self, item: impl Into<String>, error: impl fmt::Display) {
        let failure = ItemFailure {
            item: item.into(),
            error: error.to_string(),
        };
        warn!(item = %failure.item, error = %failure.error, "webhook_item_parse_failed");
        self.failures.push(failure);
    }

    pub fn event_count(&self) -> usize {
        self.messages.len() + self.statuses.len()
    }

    /// Ignored when a well-formed callback produced nothing at all.
    pub fn settle(mut self) -> Self {
        if self.ack == Ack::Ok && self.event_count() == 0 && self.failures.is_empty() {
            self.ack = Ack::Ignored;
        }
        self
    }

    pub fn extend(&mut self, other: ParsedBatch) {
        self.messages.extend(other.messages);
        self.statuses.extend(other.statuses);
        self.failures.extend(other.failures);
    }
}

/// Decode one item of a batch, recording a failure instead of erroring.
pub(crate) fn decode_item<T: DeserializeOwned>(
    value: serde_json::Value,
    item: impl FnOnce() -> String,
    batch: &mut ParsedBatch,
) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            batch.push_failure(item(), e);
            None
        }
    }
}

/// Decode a top-level JSON object envelope.
pub(crate) fn decode_envelope<T: DeserializeOwned>(body: &[u8]) -> Result<T, GatewayError> {
    let value: serde_json::Value = serde_json::from_slice(body).map_err(GatewayError::malformed)?;
    if !value.is_object() {
        return Err(GatewayError::malformed("expected a JSON object"));
    }
    serde_json::from_value(value).map_err(GatewayError::malformed)
}

/// Per-provider payload parser.
pub trait Parser: Send + Sync {
    fn parse(&self, ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError>;
}

/// Parser for a channel type.
pub fn parser_for(channel_type: ChannelType) -> &'static dyn Parser {
    match channel_type {
        ChannelType::WhatsappOfficial => &whatsapp::WhatsAppParser,
        ChannelType::Telegram => &telegram::TelegramParser,
        ChannelType::Sms => &sms::TwilioParser,
        ChannelType::Facebook => &facebook::FacebookParser,
        ChannelType::Instagram => &instagram::InstagramParser,
        ChannelType::Rcs => &rcs::RcsParser,
        ChannelType::Email => &email::EmailParser,
        ChannelType::Generic => &generic::GenericParser,
    }
}
