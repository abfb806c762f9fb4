//! Email-worker forwards: envelope fields plus the raw RFC 5322 message.

use serde::Deserialize;
use tracing::warn;

use super::{EmailProvider, IncomingEmail};
use crate::error::GatewayError;
use crate::process::email_parser::{parse_raw_email, ParsedEmail};
use crate::process::envelope::parse_any_timestamp;
use crate::process::{decode_envelope, ParseContext, ParsedBatch};

#[derive(Debug, Deserialize)]
struct WorkerPayload {
    #[serde(default, rename = "from")]
    from_field: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    timestamp: String,
    raw_content: String,
}

pub(super) fn parse(ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError> {
    let payload: WorkerPayload = decode_envelope(body)?;

    // A message mailparse rejects still carries usable envelope fields.
    let parsed = match parse_raw_email(payload.raw_content.as_bytes()) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(channel_id = %ctx.channel.id, error = %e, "raw_email_parse_failed");
            ParsedEmail::default()
        }
    };

    let pick = |parsed: Option<String>, fallback: String| parsed.unwrap_or(fallback);
    let email = IncomingEmail {
        message_id: parsed.message_id.unwrap_or_default(),
        from: pick(parsed.from, payload.from_field),
        to: pick(parsed.to, payload.to),
        cc: parsed.cc.unwrap_or_default(),
        subject: pick(parsed.subject, payload.subject),
        text: parsed.text.unwrap_or_default(),
        html: parsed.html.unwrap_or_default(),
        in_reply_to: parsed.in_reply_to.unwrap_or_default(),
        references: parsed.references.unwrap_or_default(),
        received_at: parse_any_timestamp(&payload.timestamp)
            .or_else(|| parsed.date.as_deref().and_then(parse_any_timestamp)),
        attachments: parsed.attachments,
        ..Default::default()
    };

    let mut batch = ParsedBatch::new();
    batch.push_message(email.into_message(EmailProvider::Raw, ctx.channel));
    Ok(batch)
}
