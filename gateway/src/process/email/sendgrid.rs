//! SendGrid Inbound Parse (form posts) and Event Webhook (JSON arrays).

use mailparse::{parse_headers, MailHeaderMap};
use serde::Deserialize;
use serde_json::Value;

use super::{email_status, EmailProvider, IncomingEmail};
use crate::error::GatewayError;
use crate::process::email_parser::{strip_angle_brackets, EmailAttachment};
use crate::process::envelope::from_unix_seconds;
use crate::process::sms::decode_form;
use crate::process::status::Vocabulary;
use crate::process::{decode_item, ParseContext, ParsedBatch};

pub(super) fn parse(ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError> {
    if ctx.is_form() {
        let mut batch = ParsedBatch::new();
        batch.push_message(inbound(ctx, body)?);
        return Ok(batch);
    }
    events(ctx, body)
}

fn inbound(ctx: &ParseContext<'_>, body: &[u8]) -> Result<crate::queue::InboundMessage, GatewayError> {
    let form = decode_form(body)?;
    let field = |k: &str| form.get(k).cloned().unwrap_or_default();

    let from = field("from");
    if from.is_empty() {
        return Err(GatewayError::malformed("missing from"));
    }

    // The `headers` field is the raw header block of the original message.
    let raw_headers = field("headers");
    let parsed_headers = parse_headers(raw_headers.as_bytes()).ok().map(|(h, _)| h);
    let header = |name: &str| {
        parsed_headers
            .as_ref()
            .and_then(|h| h.get_first_value(name))
            .unwrap_or_default()
    };

    let attachment_count = field("attachments").parse::<usize>().unwrap_or(0);
    // `attachment-info` maps each form field (`attachment1`, ...) to its file description.
    let attachments = match serde_json::from_str::<serde_json::Map<String, Value>>(&field("attachment-info")) {
        Ok(info) => info
            .iter()
            .map(|(field_name, a)| {
                let text = |key: &str| a.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
                let filename = if text("filename").is_empty() { text("name") } else { text("filename") };
                EmailAttachment {
                    filename,
                    mime_type: text("type"),
                    size_bytes: None,
                    content_id: strip_angle_brackets(&text("content-id")),
                    reference: field_name.clone(),
                }
            })
            .collect(),
        Err(_) => (1..=attachment_count)
            .map(|i| EmailAttachment {
                reference: format!("attachment{}", i),
                ..Default::default()
            })
            .collect(),
    };

    let mut email = IncomingEmail {
        message_id: header("Message-ID"),
        from,
        to: field("to"),
        cc: field("cc"),
        subject: field("subject"),
        text: field("text"),
        html: field("html"),
        in_reply_to: header("In-Reply-To"),
        references: header("References"),
        spam_score: field("spam_score").trim().parse::<f64>().ok(),
        attachments,
        ..Default::default()
    };
    email
        .meta("spf", field("SPF"))
        .meta("dkim", field("dkim"))
        .meta("envelope", field("envelope"));

    Ok(email.into_message(EmailProvider::SendGrid, ctx.channel))
}

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(default)]
    event: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    sg_message_id: String,
    #[serde(default)]
    sg_event_id: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    response: String,
    #[serde(default)]
    url: String,
    #[serde(default, rename = "type")]
    bounce_type: String,
}

impl Event {
    /// `sg_message_id` is the `X-Message-Id` from the send response with a
    /// `.filter...` routing suffix appended.
    fn send_id(&self) -> &str {
        self.sg_message_id.split('.').next().unwrap_or_default()
    }
}

/// Every event in the array is processed.
fn events(ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError> {
    let value: Value = serde_json::from_slice(body).map_err(GatewayError::malformed)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(_) => vec![value],
        _ => return Err(GatewayError::malformed("expected an event array")),
    };

    let mut batch = ParsedBatch::new();
    for (i, raw) in items.into_iter().enumerate() {
        let Some(event) = decode_item::<Event>(raw, || format!("[{}]", i), &mut batch) else {
            continue;
        };
        let error = [&event.reason, &event.response]
            .into_iter()
            .find(|e| !e.is_empty())
            .cloned();

        let mut update = email_status(
            ctx.channel,
            Vocabulary::SendGrid,
            event.send_id(),
            &event.event,
            error,
            &[
                ("recipient", event.email.as_str()),
                ("sg_message_id", event.sg_message_id.as_str()),
                ("sg_event_id", event.sg_event_id.as_str()),
                ("url", event.url.as_str()),
                ("bounce_type", event.bounce_type.as_str()),
            ],
        );
        if let Some(at) = from_unix_seconds(event.timestamp).filter(|_| event.timestamp > 0) {
            update.timestamp = at;
        }
        batch.push_status(update);
    }
    Ok(batch)
}
