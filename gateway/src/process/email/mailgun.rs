//! Mailgun inbound routes (form posts) and event webhooks (JSON).

use serde::Deserialize;
use tracing::{debug, warn};

use super::{email_status, EmailProvider, IncomingEmail};
use crate::error::GatewayError;
use crate::process::email_parser::EmailAttachment;
use crate::process::envelope::{from_unix_seconds, parse_unix_seconds};
use crate::process::sms::decode_form;
use crate::process::status::Vocabulary;
use crate::process::{decode_envelope, ParseContext, ParsedBatch};

pub(super) fn parse(ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError> {
    let mut batch = ParsedBatch::new();
    if ctx.is_form() {
        batch.push_message(inbound(ctx, body)?);
    } else {
        let envelope: EventEnvelope = decode_envelope(body)?;
        batch.push_status(event(ctx, envelope.event_data));
    }
    Ok(batch)
}

// =============================================================================
// Signature
// =============================================================================

/// The `timestamp`, `token` and `signature` triple Mailgun signs with.
///
/// Inbound routes carry it as form fields; event webhooks nest it under a
/// JSON `signature` object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MailgunSignature {
    #[serde(default, deserialize_with = "string_or_number")]
    pub timestamp: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub signature: String,
}

impl MailgunSignature {
    pub fn extract(ctx: &ParseContext<'_>, body: &[u8]) -> Option<Self> {
        let signature = if ctx.is_form() {
            let form = decode_form(body).ok()?;
            let field = |k: &str| form.get(k).cloned().unwrap_or_default();
            MailgunSignature {
                timestamp: field("timestamp"),
                token: field("token"),
                signature: field("signature"),
            }
        } else {
            #[derive(Deserialize)]
            struct Signed {
                signature: MailgunSignature,
            }
            serde_json::from_slice::<Signed>(body).ok()?.signature
        };

        if signature.timestamp.is_empty() || signature.token.is_empty() || signature.signature.is_empty() {
            return None;
        }
        Some(signature)
    }
}

fn string_or_number<'de, D: serde::Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    let value = serde_json::Value::deserialize(de)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

// =============================================================================
// Inbound
// =============================================================================

fn inbound(ctx: &ParseContext<'_>, body: &[u8]) -> Result<crate::queue::InboundMessage, GatewayError> {
    let form = decode_form(body)?;
    let field = |k: &str| form.get(k).cloned().unwrap_or_default();

    let recipient = field("recipient");
    let from = if field("from").is_empty() { field("sender") } else { field("from") };
    if recipient.is_empty() && from.is_empty() {
        return Err(GatewayError::malformed("missing recipient and sender"));
    }

    let headers = field("message-headers");
    let header = |name: &str| header_from_list(&headers, name).unwrap_or_default();

    let message_id = if field("Message-Id").is_empty() {
        header("Message-Id")
    } else {
        field("Message-Id")
    };

    let attachment_count = field("attachment-count").parse::<usize>().unwrap_or(0);
    let attachments = (1..=attachment_count)
        .map(|i| EmailAttachment {
            reference: format!("attachment-{}", i),
            ..Default::default()
        })
        .collect();

    let text = if field("body-plain").is_empty() {
        field("stripped-text")
    } else {
        field("body-plain")
    };
    let html = if field("body-html").is_empty() {
        field("stripped-html")
    } else {
        field("body-html")
    };

    let mut email = IncomingEmail {
        message_id,
        from,
        to: recipient,
        cc: header("Cc"),
        subject: field("subject"),
        text,
        html,
        in_reply_to: if field("In-Reply-To").is_empty() { header("In-Reply-To") } else { field("In-Reply-To") },
        references: if field("References").is_empty() { header("References") } else { field("References") },
        received_at: parse_unix_seconds(&field("timestamp")),
        attachments,
        ..Default::default()
    };
    email.meta("envelope_sender", field("sender"));

    debug!(channel_id = %ctx.channel.id, attachment_count, "mailgun_inbound_parsed");
    Ok(email.into_message(EmailProvider::Mailgun, ctx.channel))
}

/// Look up a header in Mailgun's `message-headers` JSON.
///
/// Mailgun provides headers as a JSON array of [name, value] pairs, e.g.:
/// `[["Message-Id", "<abc123@example.com>"], ["Subject", "Hello"], ...]`
fn header_from_list(message_headers: &str, name: &str) -> Option<String> {
    if message_headers.is_empty() {
        return None;
    }

    match serde_json::from_str::<Vec<Vec<String>>>(message_headers) {
        Ok(pairs) => pairs
            .into_iter()
            .filter(|pair| pair.len() >= 2)
            .find(|pair| pair[0].eq_ignore_ascii_case(name))
            .map(|pair| pair[1].trim().to_string())
            .filter(|v| !v.is_empty()),
        Err(e) => {
            warn!(error = %e, "mailgun_headers_parse_failed");
            None
        }
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "event-data")]
    event_data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    #[serde(default)]
    event: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    timestamp: f64,
    #[serde(default)]
    recipient: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: EventMessage,
    #[serde(default, rename = "delivery-status")]
    delivery_status: DeliveryStatus,
}

#[derive(Debug, Default, Deserialize)]
struct EventMessage {
    #[serde(default)]
    headers: EventHeaders,
}

#[derive(Debug, Default, Deserialize)]
struct EventHeaders {
    #[serde(default, rename = "message-id")]
    message_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct DeliveryStatus {
    #[serde(default)]
    message: String,
    #[serde(default)]
    description: String,
}

fn event(ctx: &ParseContext<'_>, data: EventData) -> crate::queue::StatusUpdate {
    let external_id = if data.message.headers.message_id.is_empty() {
        &data.id
    } else {
        &data.message.headers.message_id
    };
    let error = [&data.delivery_status.description, &data.delivery_status.message, &data.reason]
        .into_iter()
        .find(|e| !e.is_empty())
        .cloned();

    let mut update = email_status(
        ctx.channel,
        Vocabulary::Mailgun,
        external_id,
        &data.event,
        error,
        &[
            ("event_id", data.id.as_str()),
            ("recipient", data.recipient.as_str()),
            ("severity", data.severity.as_str()),
        ],
    );
    if let Some(at) = from_unix_seconds(data.timestamp.trunc() as i64).filter(|_| data.timestamp > 0.0) {
        update.timestamp = at;
    }
    update
}
