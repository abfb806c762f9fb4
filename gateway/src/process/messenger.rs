//! Meta Messenger Platform events shared by Facebook and Instagram.
//!
//! Payload shape: `entry[].messaging[]` (plus `standby[]` when another app
//! owns the thread, and `changes[]` for Instagram test deliveries). Each
//! event carries exactly one of message, delivery, read, postback or
//! reaction.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::envelope::{content_type_for, from_unix_millis, Family, IdValue, InboundDraft};
use super::status::{status_update, Vocabulary};
use super::{decode_envelope, decode_item, Ack, ParseContext, ParsedBatch};
use crate::error::GatewayError;
use crate::queue::{Attachment, ContentType, InboundMessage, StatusUpdate};

/// Per-platform knobs for the shared parser.
pub(super) struct Platform {
    pub family: Family,
    /// Accepted values of the top-level `object` field.
    pub objects: &'static [&'static str],
    /// Read `entry[].changes[field=messages]` as messaging events.
    pub read_changes: bool,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    object: String,
    #[serde(default)]
    entry: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    messaging: Vec<Value>,
    #[serde(default)]
    standby: Vec<Value>,
    #[serde(default)]
    changes: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Change {
    #[serde(default)]
    field: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Default, Deserialize)]
struct Party {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(default)]
    sender: Party,
    #[serde(default)]
    recipient: Party,
    #[serde(default)]
    timestamp: i64,
    message: Option<Message>,
    delivery: Option<Delivery>,
    read: Option<Read>,
    postback: Option<Postback>,
    reaction: Option<Reaction>,
    referral: Option<Referral>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    mid: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_echo: bool,
    #[serde(default)]
    is_deleted: bool,
    #[serde(default)]
    is_unsupported: bool,
    #[serde(default)]
    attachments: Vec<MetaAttachment>,
    quick_reply: Option<QuickReply>,
    reply_to: Option<ReplyTo>,
    referral: Option<Referral>,
}

#[derive(Debug, Deserialize)]
struct MetaAttachment {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    payload: AttachmentPayload,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct AttachmentPayload {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    sticker_id: Option<IdValue>,
    coordinates: Option<Coordinates>,
}

#[derive(Debug, Deserialize)]
struct Coordinates {
    lat: f64,
    long: f64,
}

#[derive(Debug, Serialize)]
struct LocationContent<'a> {
    latitude: f64,
    longitude: f64,
    #[serde(skip_serializing_if = "str::is_empty")]
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct QuickReply {
    #[serde(default)]
    payload: String,
}

#[derive(Debug, Deserialize)]
struct ReplyTo {
    #[serde(default)]
    mid: String,
    story: Option<StoryRef>,
}

#[derive(Debug, Deserialize)]
struct StoryRef {
    #[serde(default)]
    id: String,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct Delivery {
    #[serde(default)]
    mids: Vec<String>,
    #[serde(default)]
    watermark: i64,
}

#[derive(Debug, Deserialize)]
struct Read {
    #[serde(default)]
    watermark: i64,
    #[serde(default)]
    mid: String,
}

#[derive(Debug, Deserialize)]
struct Postback {
    #[serde(default)]
    mid: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    payload: String,
}

#[derive(Debug, Deserialize)]
struct Reaction {
    #[serde(default)]
    mid: String,
    #[serde(default)]
    action: String,
    #[serde(default)]
    reaction: String,
    #[serde(default)]
    emoji: String,
}

#[derive(Debug, Deserialize)]
struct Referral {
    #[serde(rename = "ref", default)]
    reference: String,
    #[serde(default)]
    source: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    ad_id: String,
}

pub(super) fn parse(
    platform: &Platform,
    ctx: &ParseContext<'_>,
    body: &[u8],
) -> Result<ParsedBatch, GatewayError> {
    let envelope: Envelope = decode_envelope(body)?;

    if !platform.objects.contains(&envelope.object.as_str()) {
        warn!(
            channel_id = %ctx.channel.id,
            object = %envelope.object,
            "meta_unexpected_object"
        );
        return Ok(ParsedBatch::acknowledged(Ack::Ignored));
    }

    let mut batch = ParsedBatch::new();

    for (e, raw_entry) in envelope.entry.into_iter().enumerate() {
        let Some(entry) = decode_item::<Entry>(raw_entry, || format!("entry[{}]", e), &mut batch) else {
            continue;
        };
        let mut events: Vec<(String, Value, bool)> = Vec::new();
        for (i, raw) in entry.messaging.into_iter().enumerate() {
            events.push((format!("entry[{}].messaging[{}]", e, i), raw, false));
        }
        for (i, raw) in entry.standby.into_iter().enumerate() {
            events.push((format!("entry[{}].standby[{}]", e, i), raw, true));
        }
        if platform.read_changes {
            for (i, raw_change) in entry.changes.into_iter().enumerate() {
                let location = format!("entry[{}].changes[{}]", e, i);
                let Some(change) = decode_item::<Change>(raw_change, || location.clone(), &mut batch) else {
                    continue;
                };
                if change.field == "messages" {
                    events.push((location, change.value, false));
                }
            }
        }

        for (location, raw, standby) in events {
            let Some(event) = decode_item::<Event>(raw.clone(), || location.clone(), &mut batch)
            else {
                continue;
            };
            if let Err(err) = dispatch(platform, ctx, &entry.id, event, &raw, standby, &mut batch) {
                batch.push_failure(location, err);
            }
        }
    }

    Ok(batch.settle())
}

fn dispatch(
    platform: &Platform,
    ctx: &ParseContext<'_>,
    page_id: &str,
    event: Event,
    raw: &Value,
    standby: bool,
    batch: &mut ParsedBatch,
) -> serde_json::Result<()> {
    if let Some(message) = &event.message {
        if message.is_echo {
            debug!(mid = %message.mid, "meta_echo_skipped");
            return Ok(());
        }
        if message.is_deleted {
            debug!(mid = %message.mid, "meta_deleted_skipped");
            return Ok(());
        }
        let inbound = inbound(platform, ctx, page_id, &event, message, raw, standby)?;
        batch.push_message(inbound);
    } else if let Some(postback) = &event.postback {
        let mut draft = InboundDraft::new(ContentType::Interactive);
        draft
            .external_id(postback.mid.clone())
            .content(postback.title.clone())
            .meta("postback_payload", postback.payload.clone())
            .meta("postback_title", postback.title.clone());
        batch.push_message(common(draft, ctx, page_id, &event, standby));
    } else if let Some(reaction) = &event.reaction {
        let mut draft = InboundDraft::new(ContentType::Text);
        draft
            .content(reaction.emoji.clone())
            .meta("is_reaction", "true")
            .meta("reaction_message_id", reaction.mid.clone())
            .meta("reaction_action", reaction.action.clone())
            .meta("reaction", reaction.reaction.clone());
        batch.push_message(common(draft, ctx, page_id, &event, standby));
    } else if let Some(delivery) = &event.delivery {
        for mid in &delivery.mids {
            let mut update = meta_status(ctx, &event, mid.clone(), "delivered");
            update
                .metadata
                .insert("watermark".into(), delivery.watermark.to_string());
            batch.push_status(update);
        }
    } else if let Some(read) = &event.read {
        // Read receipts cover every message up to the watermark.
        let external_id = if read.mid.is_empty() {
            format!("watermark:{}", read.watermark)
        } else {
            read.mid.clone()
        };
        let mut update = meta_status(ctx, &event, external_id, "read");
        update
            .metadata
            .insert("watermark".into(), read.watermark.to_string());
        batch.push_status(update);
    } else if event.referral.is_some() {
        debug!(sender_id = %event.sender.id, "meta_referral_skipped");
    } else {
        debug!(sender_id = %event.sender.id, "meta_event_unhandled");
    }
    Ok(())
}

/// Stamp the sender, page and timestamp shared by every inbound event.
fn common(
    mut draft: InboundDraft,
    ctx: &ParseContext<'_>,
    page_id: &str,
    event: &Event,
    standby: bool,
) -> InboundMessage {
    draft
        .at(from_unix_millis(event.timestamp))
        .meta("sender_id", event.sender.id.clone())
        .meta("recipient_id", event.recipient.id.clone())
        .meta("page_id", page_id);
    if standby {
        draft.meta("standby", "true");
    }
    if let Some(referral) = &event.referral {
        draft
            .meta("referral_ref", referral.reference.clone())
            .meta("referral_source", referral.source.clone())
            .meta("referral_type", referral.kind.clone())
            .meta("referral_ad_id", referral.ad_id.clone());
    }
    draft.finish(ctx.channel)
}

fn meta_status(ctx: &ParseContext<'_>, event: &Event, external_id: String, raw: &str) -> StatusUpdate {
    let mut update = status_update(ctx.channel, Vocabulary::Messenger, external_id, raw, None);
    if let Some(at) = from_unix_millis(event.timestamp).filter(|_| event.timestamp > 0) {
        update.timestamp = at;
    }
    update
        .metadata
        .insert("recipient_id".into(), event.sender.id.clone());
    update
}

fn inbound(
    platform: &Platform,
    ctx: &ParseContext<'_>,
    page_id: &str,
    event: &Event,
    message: &Message,
    raw: &Value,
    standby: bool,
) -> serde_json::Result<InboundMessage> {
    let mut draft = if message.is_unsupported {
        InboundDraft::unknown("unsupported", raw)
    } else if let Some(first) = message.attachments.first() {
        let is_sticker = first
            .payload
            .sticker_id
            .as_ref()
            .is_some_and(|id| !id.is_empty());
        let kind = if is_sticker { "sticker" } else { first.kind.as_str() };
        match content_type_for(platform.family, kind) {
            Some(content_type) => InboundDraft::new(content_type),
            None => InboundDraft::unknown(kind, raw),
        }
    } else if message.quick_reply.is_some() {
        InboundDraft::new(ContentType::Interactive)
    } else {
        InboundDraft::new(ContentType::Text)
    };

    draft.external_id(message.mid.clone()).content(message.text.clone());

    for attachment in &message.attachments {
        let url = if attachment.payload.url.is_empty() {
            attachment.url.clone()
        } else {
            attachment.payload.url.clone()
        };

        if let Some(coords) = &attachment.payload.coordinates {
            let name = if attachment.title.is_empty() {
                attachment.payload.title.as_str()
            } else {
                attachment.title.as_str()
            };
            draft
                .content(serde_json::to_string(&LocationContent {
                    latitude: coords.lat,
                    longitude: coords.long,
                    name,
                })?)
                .meta("latitude", format!("{:.6}", coords.lat))
                .meta("longitude", format!("{:.6}", coords.long))
                .meta("location_name", name);
            continue;
        }

        if let Some(sticker_id) = attachment.payload.sticker_id.as_ref().filter(|id| !id.is_empty()) {
            draft.attach(
                Attachment::new(ContentType::Sticker, url).meta("sticker_id", sticker_id.to_string()),
            );
            continue;
        }

        let kind = content_type_for(platform.family, &attachment.kind);
        match kind {
            Some(kind @ (ContentType::Image
            | ContentType::Video
            | ContentType::Audio
            | ContentType::Document
            | ContentType::Sticker)) => {
                draft.attach(
                    Attachment::new(kind, url)
                        .meta("attachment_type", attachment.kind.clone()),
                );
            }
            _ => {
                // share, fallback and other link-style attachments
                draft
                    .meta("attachment_type", attachment.kind.clone())
                    .meta("attachment_url", url)
                    .meta("attachment_title", attachment.title.clone());
                if draft.content.is_empty() {
                    let title = if attachment.title.is_empty() {
                        attachment.payload.title.clone()
                    } else {
                        attachment.title.clone()
                    };
                    draft.content(title);
                }
            }
        }
    }

    if let Some(quick_reply) = &message.quick_reply {
        draft.meta("quick_reply_payload", quick_reply.payload.clone());
    }
    if let Some(reply_to) = &message.reply_to {
        draft.reply_to(&reply_to.mid);
        if let Some(story) = &reply_to.story {
            draft
                .meta("story_id", story.id.clone())
                .meta("story_url", story.url.clone());
        }
    }
    if let Some(referral) = &message.referral {
        draft
            .meta("referral_ref", referral.reference.clone())
            .meta("referral_source", referral.source.clone());
    }

    Ok(common(draft, ctx, page_id, event, standby))
}
