//! Telegram Bot API webhook parser.
//!
//! Telegram posts exactly one `Update` per request. Numeric identifiers are
//! 64-bit integers and are always rendered as decimal text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::envelope::{content_type_for, format_id, from_unix_seconds, Family, InboundDraft};
use super::{decode_envelope, decode_item, Ack, ParseContext, ParsedBatch, Parser};
use crate::error::GatewayError;
use crate::queue::{Attachment, ContentType, InboundMessage};

pub struct TelegramParser;

#[derive(Debug, Deserialize)]
struct Update {
    #[serde(default)]
    update_id: i64,
    message: Option<Value>,
    edited_message: Option<Value>,
    channel_post: Option<Value>,
    edited_channel_post: Option<Value>,
    callback_query: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    language_code: String,
    #[serde(default)]
    is_bot: bool,
}

impl TgUser {
    fn full_name(&self) -> String {
        if self.last_name.is_empty() {
            self.first_name.clone()
        } else {
            format!("{} {}", self.first_name, self.last_name)
        }
    }
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct TgFile {
    file_id: String,
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    mime_type: String,
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TgSticker {
    file_id: String,
    #[serde(default)]
    emoji: String,
    #[serde(default)]
    set_name: String,
    #[serde(default)]
    is_animated: bool,
    #[serde(default)]
    is_video: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct TgLocation {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct TgVenue {
    location: TgLocation,
    #[serde(default)]
    title: String,
    #[serde(default)]
    address: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TgContact {
    phone_number: String,
    #[serde(default)]
    first_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TgReplyRef {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    from: Option<TgUser>,
    chat: TgChat,
    #[serde(default)]
    date: i64,
    edit_date: Option<i64>,
    message_thread_id: Option<i64>,
    #[serde(default)]
    media_group_id: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    caption: String,
    #[serde(default)]
    photo: Vec<TgFile>,
    document: Option<TgFile>,
    animation: Option<TgFile>,
    voice: Option<TgFile>,
    audio: Option<TgFile>,
    video: Option<TgFile>,
    video_note: Option<TgFile>,
    sticker: Option<TgSticker>,
    venue: Option<TgVenue>,
    location: Option<TgLocation>,
    contact: Option<TgContact>,
    reply_to_message: Option<TgReplyRef>,
}

impl TgMessage {
    /// The message kind, checked in an order where kinds that also set a
    /// more generic field (animation sets document, venue sets location)
    /// win over it.
    fn kind(&self) -> &'static str {
        if !self.photo.is_empty() {
            "photo"
        } else if self.animation.is_some() {
            "animation"
        } else if self.document.is_some() {
            "document"
        } else if self.voice.is_some() {
            "voice"
        } else if self.audio.is_some() {
            "audio"
        } else if self.video.is_some() {
            "video"
        } else if self.video_note.is_some() {
            "video_note"
        } else if self.sticker.is_some() {
            "sticker"
        } else if self.venue.is_some() {
            "venue"
        } else if self.location.is_some() {
            "location"
        } else if self.contact.is_some() {
            "contact"
        } else if !self.text.is_empty() {
            "text"
        } else {
            ""
        }
    }
}

#[derive(Debug, Deserialize)]
struct TgCallbackQuery {
    id: String,
    from: TgUser,
    message: Option<TgCallbackMessage>,
    #[serde(default)]
    data: String,
    #[serde(default)]
    chat_instance: String,
}

#[derive(Debug, Deserialize)]
struct TgCallbackMessage {
    message_id: i64,
    chat: TgChat,
}

/// Keys Telegram uses for message kinds we do not map to a content type.
const OTHER_KINDS: &[&str] = &[
    "poll",
    "dice",
    "game",
    "invoice",
    "story",
    "new_chat_members",
    "left_chat_member",
    "new_chat_title",
    "pinned_message",
    "successful_payment",
];

impl Parser for TelegramParser {
    fn parse(&self, ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError> {
        let update: Update = decode_envelope(body)?;
        let mut batch = ParsedBatch::new();
        let update_id = format_id(update.update_id);

        let posts = [
            ("message", update.message, false),
            ("edited_message", update.edited_message, true),
            ("channel_post", update.channel_post, false),
            ("edited_channel_post", update.edited_channel_post, true),
        ];

        for (field, raw, edited) in posts {
            let Some(raw) = raw else { continue };
            let Some(msg) = decode_item::<TgMessage>(raw.clone(), || field.to_string(), &mut batch)
            else {
                continue;
            };
            match inbound(ctx, &update_id, msg, &raw, edited) {
                Ok(message) => batch.push_message(message),
                Err(err) => batch.push_failure(field, err),
            }
        }

        if let Some(raw) = update.callback_query {
            if let Some(query) =
                decode_item::<TgCallbackQuery>(raw, || "callback_query".to_string(), &mut batch)
            {
                batch.push_message(callback(ctx, &update_id, query));
            }
        }

        if batch.event_count() == 0 && batch.failures.is_empty() {
            return Ok(ParsedBatch::acknowledged(Ack::Ignored));
        }
        Ok(batch)
    }
}

fn file_attachment(kind: ContentType, file: &TgFile) -> Attachment {
    Attachment::new(kind, file.file_id.clone())
        .mime(Some(&file.mime_type))
        .filename(Some(&file.file_name))
        .size(file.file_size)
        .meta("file_id", file.file_id.clone())
}

fn inbound(
    ctx: &ParseContext<'_>,
    update_id: &str,
    msg: TgMessage,
    raw: &Value,
    edited: bool,
) -> serde_json::Result<InboundMessage> {
    let kind = msg.kind();
    let mut draft = match content_type_for(Family::Telegram, kind) {
        Some(content_type) => InboundDraft::new(content_type),
        None => {
            let original = raw
                .as_object()
                .and_then(|obj| OTHER_KINDS.iter().find(|k| obj.contains_key(**k)))
                .copied()
                .unwrap_or("unknown");
            InboundDraft::unknown(original, raw)
        }
    };

    // Edits reuse message_id; the revision keeps each edit distinct.
    let external_id = if edited {
        let revision = msg.edit_date.map(format_id).unwrap_or_else(|| update_id.to_string());
        format!("{}:edit:{}", msg.message_id, revision)
    } else {
        format_id(msg.message_id)
    };

    draft
        .external_id(external_id)
        .at(from_unix_seconds(msg.date))
        .meta("update_id", update_id)
        .meta("chat_id", format_id(msg.chat.id))
        .meta("chat_type", msg.chat.kind.clone())
        .meta("chat_title", msg.chat.title.clone())
        .meta("media_group_id", msg.media_group_id.clone())
        .meta_opt("message_thread_id", msg.message_thread_id.map(format_id));

    if let Some(user) = &msg.from {
        draft
            .meta("sender_id", format_id(user.id))
            .meta("sender_name", user.full_name())
            .meta("username", user.username.clone())
            .meta("language_code", user.language_code.clone());
        if user.is_bot {
            draft.meta("is_bot", "true");
        }
    }
    if edited {
        draft
            .meta("edited", "true")
            .meta("original_message_id", format_id(msg.message_id))
            .at(msg.edit_date.and_then(from_unix_seconds));
    }
    if let Some(reply) = &msg.reply_to_message {
        draft.reply_to(&format_id(reply.message_id));
    }

    let content_type = draft.content_type;
    match kind {
        "text" => {
            draft.content(msg.text.clone());
        }
        "photo" => {
            // Telegram lists sizes ascending; the last one is the original.
            if let Some(largest) = msg.photo.last() {
                draft.attach(file_attachment(ContentType::Image, largest));
            }
            draft.content(msg.caption.clone());
        }
        "animation" | "document" | "voice" | "audio" | "video" | "video_note" => {
            let file = match kind {
                "animation" => &msg.animation,
                "document" => &msg.document,
                "voice" => &msg.voice,
                "audio" => &msg.audio,
                "video" => &msg.video,
                _ => &msg.video_note,
            };
            if let Some(file) = file {
                draft.attach(file_attachment(content_type, file));
            }
            draft.content(msg.caption.clone());
            if kind != content_type.as_str() {
                draft.meta("telegram_type", kind);
            }
        }
        "sticker" => {
            if let Some(sticker) = &msg.sticker {
                draft
                    .content(sticker.emoji.clone())
                    .attach(
                        Attachment::new(ContentType::Sticker, sticker.file_id.clone())
                            .meta("file_id", sticker.file_id.clone())
                            .meta("set_name", sticker.set_name.clone())
                            .meta("animated", (sticker.is_animated || sticker.is_video).to_string()),
                    );
            }
        }
        "venue" => {
            if let Some(venue) = &msg.venue {
                draft
                    .content(serde_json::to_string(&venue.location)?)
                    .meta("latitude", format!("{:.6}", venue.location.latitude))
                    .meta("longitude", format!("{:.6}", venue.location.longitude))
                    .meta("location_name", venue.title.clone())
                    .meta("location_address", venue.address.clone());
            }
        }
        "location" => {
            if let Some(location) = &msg.location {
                draft
                    .content(serde_json::to_string(location)?)
                    .meta("latitude", format!("{:.6}", location.latitude))
                    .meta("longitude", format!("{:.6}", location.longitude));
            }
        }
        "contact" => {
            if let Some(contact) = &msg.contact {
                draft
                    .content(serde_json::to_string(contact)?)
                    .meta("contact_phone", contact.phone_number.clone());
            }
        }
        _ => {
            let text = if msg.text.is_empty() { &msg.caption } else { &msg.text };
            draft.content(text.clone());
        }
    }

    Ok(draft.finish(ctx.channel))
}

fn callback(ctx: &ParseContext<'_>, update_id: &str, query: TgCallbackQuery) -> InboundMessage {
    let mut draft = InboundDraft::new(ContentType::Interactive);
    draft
        .external_id(query.id.clone())
        .content(query.data.clone())
        .meta("update_id", update_id)
        .meta("callback_data", query.data.clone())
        .meta("chat_instance", query.chat_instance.clone())
        .meta("sender_id", format_id(query.from.id))
        .meta("sender_name", query.from.full_name())
        .meta("username", query.from.username.clone());

    if let Some(message) = &query.message {
        draft
            .meta("chat_id", format_id(message.chat.id))
            .reply_to(&format_id(message.message_id));
    }
    draft.finish(ctx.channel)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::test_support::{channel, parse};
    use super::*;
    use crate::channel::ChannelType;

    fn parse_update(update: Value) -> ParsedBatch {
        parse(&channel(ChannelType::Telegram), update.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_large_ids_render_as_decimal() {
        let batch = parse_update(json!({
            "update_id": 900000001,
            "message": {
                "message_id": 123456789012345_i64,
                "date": 1700000000,
                "from": {"id": 123456789012345_i64, "first_name": "Ada", "last_name": "L"},
                "chat": {"id": -1001234567890_i64, "type": "supergroup"},
                "text": "hi"
            }
        }));

        let msg = &batch.messages[0];
        assert_eq!(msg.external_id, "123456789012345");
        assert_eq!(msg.metadata["sender_id"], "123456789012345");
        assert_eq!(msg.metadata["chat_id"], "-1001234567890");
        assert_eq!(msg.metadata["sender_name"], "Ada L");
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.content_type, ContentType::Text);
    }

    #[test]
    fn test_photo_uses_largest_size_and_caption() {
        let batch = parse_update(json!({
            "update_id": 1,
            "message": {
                "message_id": 7,
                "chat": {"id": 42, "type": "private"},
                "caption": "sunset",
                "photo": [
                    {"file_id": "small", "file_size": 100},
                    {"file_id": "large", "file_size": 9000}
                ],
                "reply_to_message": {"message_id": 6, "chat": {"id": 42, "type": "private"}}
            }
        }));

        let msg = &batch.messages[0];
        assert_eq!(msg.content_type, ContentType::Image);
        assert_eq!(msg.content, "sunset");
        assert_eq!(msg.attachments[0].url, "large");
        assert_eq!(msg.attachments[0].size_bytes, Some(9000));
        assert_eq!(msg.metadata["reply_to_id"], "6");
    }

    #[test]
    fn test_voice_and_venue() {
        let voice = parse_update(json!({
            "update_id": 2,
            "message": {"message_id": 8, "chat": {"id": 1},
                        "voice": {"file_id": "v1", "mime_type": "audio/ogg"}}
        }));
        assert_eq!(voice.messages[0].content_type, ContentType::Audio);
        assert_eq!(voice.messages[0].metadata["telegram_type"], "voice");

        let venue = parse_update(json!({
            "update_id": 3,
            "message": {"message_id": 9, "chat": {"id": 1},
                        "location": {"latitude": 1.5, "longitude": 2.5},
                        "venue": {"location": {"latitude": 1.5, "longitude": 2.5},
                                  "title": "Cafe", "address": "Main St"}}
        }));
        let msg = &venue.messages[0];
        assert_eq!(msg.content_type, ContentType::Location);
        assert_eq!(msg.metadata["location_name"], "Cafe");
    }

    #[test]
    fn test_poll_maps_to_text_with_original_type() {
        let batch = parse_update(json!({
            "update_id": 4,
            "message": {"message_id": 10, "chat": {"id": 1}, "poll": {"id": "p", "question": "?"}}
        }));
        let msg = &batch.messages[0];
        assert_eq!(msg.content_type, ContentType::Text);
        assert_eq!(msg.metadata["original_type"], "poll");
    }

    #[test]
    fn test_callback_query() {
        let batch = parse_update(json!({
            "update_id": 5,
            "callback_query": {
                "id": "4382bfdwdsb323b2d9",
                "from": {"id": 555, "first_name": "Bo"},
                "message": {"message_id": 77, "chat": {"id": 555, "type": "private"}},
                "data": "menu:pricing"
            }
        }));
        let msg = &batch.messages[0];
        assert_eq!(msg.content_type, ContentType::Interactive);
        assert_eq!(msg.content, "menu:pricing");
        assert_eq!(msg.external_id, "4382bfdwdsb323b2d9");
        assert_eq!(msg.metadata["reply_to_id"], "77");
    }

    #[test]
    fn test_unhandled_update_is_ignored() {
        let batch = parse_update(json!({"update_id": 6, "my_chat_member": {}}));
        assert_eq!(batch.ack, Ack::Ignored);
    }

    #[test]
    fn test_bad_message_is_an_item_failure() {
        let batch = parse_update(json!({"update_id": 7, "message": {"chat": "nope"}}));
        assert!(batch.messages.is_empty());
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].item, "message");
    }

    #[test]
    fn test_edits_get_distinct_external_ids() {
        let edit = |update_id: i64, edit_date: i64, text: &str| {
            parse_update(json!({
                "update_id": update_id,
                "edited_message": {
                    "message_id": 8, "date": 1700000000, "edit_date": edit_date,
                    "chat": {"id": 1, "type": "private"}, "text": text
                }
            }))
        };
        let original = parse_update(json!({
            "update_id": 10,
            "message": {"message_id": 8, "date": 1700000000, "chat": {"id": 1, "type": "private"}, "text": "v1"}
        }));
        let first = edit(11, 1700000060, "v2");
        let second = edit(12, 1700000120, "v3");

        let first = &first.messages[0];
        assert_eq!(original.messages[0].external_id, "8");
        assert_eq!(first.external_id, "8:edit:1700000060");
        assert_eq!(second.messages[0].external_id, "8:edit:1700000120");
        assert_eq!(first.metadata["original_message_id"], "8");
        assert_eq!(first.metadata["edited"], "true");
        assert_eq!(first.timestamp.timestamp(), 1_700_000_060);
    }
}
