//! Generic JSON webhooks for channels without a dedicated parser.
//!
//! The body is one item or an array of items. An item with a `status`
//! field is a delivery callback; anything else is an inbound message.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use super::envelope::{content_type_for_mime, from_unix_seconds, parse_any_timestamp, IdValue, InboundDraft};
use super::status::{status_update, Vocabulary};
use super::{decode_item, ParseContext, ParsedBatch, Parser};
use crate::error::GatewayError;
use crate::queue::{Attachment, ContentType, InboundMessage, StatusUpdate};

pub struct GenericParser;

#[derive(Debug, Deserialize)]
struct GenericMessage {
    #[serde(default)]
    message_id: IdValue,
    #[serde(default)]
    sender_id: IdValue,
    #[serde(default)]
    sender_name: String,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    reply_to_id: String,
    timestamp: Option<Value>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
    #[serde(default)]
    attachments: Vec<GenericAttachment>,
}

#[derive(Debug, Deserialize)]
struct GenericAttachment {
    #[serde(default, rename = "type")]
    kind: String,
    url: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    filename: String,
    size_bytes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GenericStatus {
    #[serde(default)]
    message_id: IdValue,
    #[serde(default)]
    external_id: IdValue,
    status: String,
    #[serde(default)]
    error_message: String,
    timestamp: Option<Value>,
}

impl Parser for GenericParser {
    fn parse(&self, ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError> {
        let value: Value = serde_json::from_slice(body).map_err(GatewayError::malformed)?;
        let items = match value {
            Value::Array(items) => items,
            Value::Object(_) => vec![value],
            _ => return Err(GatewayError::malformed("expected an object or an array of objects")),
        };

        let mut batch = ParsedBatch::new();
        for (i, item) in items.into_iter().enumerate() {
            let location = || format!("[{}]", i);
            if !item.is_object() {
                batch.push_failure(location(), "item is not an object");
                continue;
            }
            if item.get("status").is_some() {
                if let Some(status) = decode_item::<GenericStatus>(item, location, &mut batch) {
                    batch.push_status(status_of(ctx, status));
                }
            } else if let Some(message) = decode_item::<GenericMessage>(item, location, &mut batch) {
                batch.push_message(message_of(ctx, message));
            }
        }
        Ok(batch.settle())
    }
}

fn timestamp_of(value: Option<&Value>) -> Option<chrono::DateTime<chrono::Utc>> {
    match value? {
        Value::String(s) => parse_any_timestamp(s),
        Value::Number(n) => n.as_i64().and_then(from_unix_seconds),
        _ => None,
    }
}

fn message_of(ctx: &ParseContext<'_>, message: GenericMessage) -> InboundMessage {
    let content_type = ContentType::parse(&message.content_type);
    let mut draft = match content_type {
        Some(content_type) => InboundDraft::new(content_type),
        None if message.content_type.is_empty() => InboundDraft::new(ContentType::Text),
        None => {
            let mut draft = InboundDraft::new(ContentType::Text);
            draft.meta("original_type", message.content_type.clone());
            draft
        }
    };

    for (key, value) in message.metadata {
        let value = match value {
            Value::String(s) => s,
            Value::Null => continue,
            other => other.to_string(),
        };
        draft.meta(&key, value);
    }

    draft
        .external_id(message.message_id.to_string())
        .content(message.content)
        .meta("sender_id", message.sender_id.to_string())
        .meta("sender_name", message.sender_name)
        .reply_to(&message.reply_to_id)
        .at(timestamp_of(message.timestamp.as_ref()));

    for attachment in message.attachments {
        let kind = ContentType::parse(&attachment.kind)
            .unwrap_or_else(|| content_type_for_mime(&attachment.mime_type));
        draft.attach(
            Attachment::new(kind, attachment.url)
                .mime(Some(&attachment.mime_type))
                .filename(Some(&attachment.filename))
                .size(attachment.size_bytes),
        );
    }
    draft.finish(ctx.channel)
}

fn status_of(ctx: &ParseContext<'_>, status: GenericStatus) -> StatusUpdate {
    let external_id = if status.external_id.is_empty() {
        status.message_id.to_string()
    } else {
        status.external_id.to_string()
    };
    let mut update = status_update(
        ctx.channel,
        Vocabulary::Generic,
        external_id,
        &status.status,
        Some(status.error_message),
    );
    if !status.message_id.is_empty() && !status.external_id.is_empty() {
        update.message_id = Some(status.message_id.to_string());
    }
    if let Some(at) = timestamp_of(status.timestamp.as_ref()) {
        update.timestamp = at;
    }
    update
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::test_support::{channel, parse};
    use super::*;
    use crate::channel::ChannelType;
    use crate::queue::Status;

    #[test]
    fn test_single_message() {
        let body = json!({
            "message_id": 42, "sender_id": "u-1", "sender_name": "Ana",
            "content_type": "image", "content": "pic",
            "timestamp": 1700000000,
            "metadata": {"campaign": "spring", "score": 3},
            "attachments": [{"type": "image", "url": "https://cdn/x.png", "mime_type": "image/png"}]
        })
        .to_string();
        let batch = parse(&channel(ChannelType::Generic), body.as_bytes()).unwrap();

        let msg = &batch.messages[0];
        assert_eq!(msg.external_id, "42");
        assert_eq!(msg.content_type, ContentType::Image);
        assert_eq!(msg.metadata["sender_id"], "u-1");
        assert_eq!(msg.metadata["campaign"], "spring");
        assert_eq!(msg.metadata["score"], "3");
        assert_eq!(msg.attachments[0].mime_type.as_deref(), Some("image/png"));
        assert_eq!(msg.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_mixed_array_with_bad_item() {
        let body = json!([
            {"message_id": "a", "content": "one"},
            {"external_id": "out-1", "status": "DELIVERED"},
            "not an object",
            {"message_id": "b", "content": "two", "attachments": [{"type": "image"}]},
            {"message_id": "c", "content": "three", "content_type": "carousel"}
        ])
        .to_string();
        let batch = parse(&channel(ChannelType::Generic), body.as_bytes()).unwrap();

        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.statuses.len(), 1);
        assert_eq!(batch.failures.len(), 2);
        assert_eq!(batch.statuses[0].status, Status::Delivered);
        assert_eq!(batch.messages[1].metadata["original_type"], "carousel");
        assert_eq!(batch.failures[0].item, "[2]");
    }

    #[test]
    fn test_failed_status_without_text_reports_raw_status() {
        let body = json!({"message_id": "m1", "status": "undelivered"}).to_string();
        let batch = parse(&channel(ChannelType::Generic), body.as_bytes()).unwrap();
        let update = &batch.statuses[0];
        assert_eq!(update.external_id, "m1");
        assert_eq!(update.status, Status::Failed);
        assert_eq!(update.error_message.as_deref(), Some("undelivered"));
    }
}
