//! WhatsApp Cloud API webhook parser.
//!
//! Payload shape: `entry[].changes[].value.{contacts, messages, statuses}`.
//! One callback can carry several messages and statuses across entries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::envelope::{content_type_for, parse_unix_seconds, Family, InboundDraft};
use super::status::{status_update, Vocabulary};
use super::{decode_envelope, decode_item, Ack, ParseContext, ParsedBatch, Parser};
use crate::error::GatewayError;
use crate::queue::{Attachment, ContentType, InboundMessage, StatusUpdate};

pub struct WhatsAppParser;

// =============================================================================
// Payload Types
// =============================================================================

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
    changes: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Change {
    #[serde(default)]
    field: String,
    #[serde(default)]
    value: ChangeValue,
}

#[derive(Debug, Default, Deserialize)]
struct ChangeValue {
    #[serde(default)]
    metadata: PhoneMetadata,
    /// Kept raw so a malformed profile cannot sink the messages beside it.
    #[serde(default)]
    contacts: Vec<Value>,
    #[serde(default)]
    messages: Vec<Value>,
    #[serde(default)]
    statuses: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct PhoneMetadata {
    #[serde(default)]
    display_phone_number: String,
    #[serde(default)]
    phone_number_id: String,
}

#[derive(Debug, Deserialize)]
struct WaMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    timestamp: String,
    #[serde(rename = "type", default)]
    kind: String,
    text: Option<WaText>,
    image: Option<WaMedia>,
    video: Option<WaMedia>,
    audio: Option<WaMedia>,
    voice: Option<WaMedia>,
    document: Option<WaMedia>,
    sticker: Option<WaMedia>,
    location: Option<WaLocation>,
    contacts: Option<Vec<Value>>,
    interactive: Option<WaInteractive>,
    button: Option<WaButton>,
    reaction: Option<WaReaction>,
    order: Option<Value>,
    system: Option<WaSystem>,
    context: Option<WaContext>,
    referral: Option<WaReferral>,
}

#[derive(Debug, Deserialize)]
struct WaText {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Default, Deserialize)]
struct WaMedia {
    #[serde(default)]
    id: String,
    #[serde(default)]
    caption: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    sha256: String,
    #[serde(default)]
    animated: bool,
    #[serde(default)]
    voice: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WaLocation {
    latitude: f64,
    longitude: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    url: String,
}

#[derive(Debug, Deserialize)]
struct WaInteractive {
    #[serde(rename = "type", default)]
    kind: String,
    button_reply: Option<WaReply>,
    list_reply: Option<WaReply>,
    nfm_reply: Option<WaFlowReply>,
}

#[derive(Debug, Deserialize)]
struct WaReply {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct WaFlowReply {
    #[serde(default)]
    name: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    response_json: String,
}

#[derive(Debug, Deserialize)]
struct WaButton {
    #[serde(default)]
    text: String,
    #[serde(default)]
    payload: String,
}

#[derive(Debug, Deserialize)]
struct WaReaction {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    emoji: String,
}

#[derive(Debug, Deserialize)]
struct WaSystem {
    #[serde(default)]
    body: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    wa_id: String,
}

#[derive(Debug, Deserialize)]
struct WaContext {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    forwarded: bool,
    #[serde(default)]
    frequently_forwarded: bool,
}

#[derive(Debug, Deserialize)]
struct WaReferral {
    #[serde(default)]
    source_url: String,
    #[serde(default)]
    source_id: String,
    #[serde(default)]
    source_type: String,
    #[serde(default)]
    headline: String,
    #[serde(default)]
    ctwa_clid: String,
}

#[derive(Debug, Deserialize)]
struct WaStatus {
    #[serde(default)]
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    recipient_id: String,
    #[serde(default)]
    biz_opaque_callback_data: String,
    conversation: Option<WaConversation>,
    pricing: Option<WaPricing>,
    #[serde(default)]
    errors: Vec<WaError>,
}

#[derive(Debug, Deserialize)]
struct WaConversation {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct WaPricing {
    #[serde(default)]
    category: String,
}

#[derive(Debug, Deserialize)]
struct WaError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    message: String,
    error_data: Option<WaErrorData>,
}

#[derive(Debug, Deserialize)]
struct WaErrorData {
    #[serde(default)]
    details: String,
}

impl WaError {
    /// `[code] title: message`
    fn describe(&self) -> String {
        let message = if self.message.is_empty() {
            self.error_data
                .as_ref()
                .map(|d| d.details.as_str())
                .unwrap_or_default()
        } else {
            self.message.as_str()
        };
        format!("[{}] {}: {}", self.code, self.title, message)
    }
}

// =============================================================================
// Parsing
// =============================================================================

impl Parser for WhatsAppParser {
    fn parse(&self, ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError> {
        let envelope: Envelope = decode_envelope(body)?;

        if !envelope.object.is_empty() && envelope.object != "whatsapp_business_account" {
            warn!(
                channel_id = %ctx.channel.id,
                object = %envelope.object,
                "whatsapp_unexpected_object"
            );
            return Ok(ParsedBatch::acknowledged(Ack::Ignored));
        }

        let mut batch = ParsedBatch::new();

        for (e, raw_entry) in envelope.entry.into_iter().enumerate() {
            let Some(entry) = decode_item::<Entry>(raw_entry, || format!("entry[{}]", e), &mut batch) else {
                continue;
            };
            for (c, raw_change) in entry.changes.into_iter().enumerate() {
                let change_location = || format!("entry[{}].changes[{}]", e, c);
                let Some(change) = decode_item::<Change>(raw_change, change_location, &mut batch) else {
                    continue;
                };
                if !change.field.is_empty() && change.field != "messages" {
                    debug!(field = %change.field, "whatsapp_change_skipped");
                    continue;
                }
                let value = change.value;

                for (i, raw) in value.messages.into_iter().enumerate() {
                    let location = || format!("entry[{}].changes[{}].messages[{}]", e, c, i);
                    let Some(msg) = decode_item::<WaMessage>(raw.clone(), location, &mut batch)
                    else {
                        continue;
                    };
                    match inbound(ctx, &entry.id, &value.metadata, &value.contacts, msg, &raw) {
                        Ok(message) => batch.push_message(message),
                        Err(err) => batch.push_failure(location(), err),
                    }
                }

                for (i, raw) in value.statuses.into_iter().enumerate() {
                    let location = || format!("entry[{}].changes[{}].statuses[{}]", e, c, i);
                    if let Some(status) = decode_item::<WaStatus>(raw, location, &mut batch) {
                        batch.push_status(status_of(ctx, status));
                    }
                }
            }
        }

        Ok(batch.settle())
    }
}

/// Profile name of the contact whose `wa_id` matches the sender.
fn contact_name(contacts: &[Value], wa_id: &str) -> String {
    let id_of = |contact: &Value| match contact.get("wa_id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    contacts
        .iter()
        .find(|contact| id_of(contact) == wa_id)
        .and_then(|contact| contact.pointer("/profile/name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn media_attachment(kind: ContentType, media: &WaMedia) -> Attachment {
    Attachment::new(kind, media.id.clone())
        .mime(Some(&media.mime_type))
        .filename(Some(&media.filename))
        .meta("media_id", media.id.clone())
        .meta("sha256", media.sha256.clone())
}

fn inbound(
    ctx: &ParseContext<'_>,
    account_id: &str,
    phone: &PhoneMetadata,
    contacts: &[Value],
    msg: WaMessage,
    raw: &Value,
) -> serde_json::Result<InboundMessage> {
    let sender_name = contact_name(contacts, &msg.from);
    let kind = msg.kind.to_ascii_lowercase();

    let mut draft = match content_type_for(Family::WhatsApp, &kind) {
        Some(content_type) => InboundDraft::new(content_type),
        None => InboundDraft::unknown(&msg.kind, raw),
    };
    draft
        .external_id(msg.id.clone())
        .at(parse_unix_seconds(&msg.timestamp))
        .meta("phone", msg.from.clone())
        .meta("sender_id", msg.from.clone())
        .meta("sender_name", sender_name)
        .meta("business_account_id", account_id)
        .meta("phone_number_id", phone.phone_number_id.clone())
        .meta("display_phone_number", phone.display_phone_number.clone());

    match kind.as_str() {
        "text" => {
            if let Some(text) = &msg.text {
                draft.content(text.body.clone());
            }
        }
        "image" | "video" | "audio" | "voice" | "document" => {
            let media = match kind.as_str() {
                "image" => &msg.image,
                "video" => &msg.video,
                "audio" => &msg.audio,
                "voice" => &msg.voice,
                _ => &msg.document,
            };
            if let Some(media) = media {
                let content_type = draft.content_type;
                draft.content(media.caption.clone());
                draft.attach(media_attachment(content_type, media));
                if media.voice || kind == "voice" {
                    draft.meta("is_voice", "true");
                }
            }
        }
        "sticker" => {
            if let Some(sticker) = &msg.sticker {
                draft.attach(
                    media_attachment(ContentType::Sticker, sticker)
                        .meta("animated", sticker.animated.to_string()),
                );
            }
            draft.meta("is_sticker", "true");
        }
        "location" => {
            if let Some(location) = &msg.location {
                draft
                    .content(serde_json::to_string(location)?)
                    .meta("latitude", format!("{:.6}", location.latitude))
                    .meta("longitude", format!("{:.6}", location.longitude))
                    .meta("location_name", location.name.clone())
                    .meta("location_address", location.address.clone());
            }
        }
        "contacts" => {
            if let Some(cards) = msg.contacts.as_ref().filter(|c| !c.is_empty()) {
                draft.content(serde_json::to_string(cards)?);
            }
        }
        "interactive" => {
            if let Some(interactive) = &msg.interactive {
                draft.meta("interactive_type", interactive.kind.clone());
                if let Some(reply) = &interactive.button_reply {
                    draft.content(reply.title.clone()).meta("button_id", reply.id.clone());
                } else if let Some(reply) = &interactive.list_reply {
                    draft
                        .content(reply.title.clone())
                        .meta("list_id", reply.id.clone())
                        .meta("list_description", reply.description.clone());
                } else if let Some(flow) = &interactive.nfm_reply {
                    draft
                        .content(flow.response_json.clone())
                        .meta("flow_name", flow.name.clone())
                        .meta("flow_body", flow.body.clone());
                }
            }
        }
        "button" => {
            if let Some(button) = &msg.button {
                draft
                    .content(button.text.clone())
                    .meta("button_payload", button.payload.clone());
            }
        }
        "reaction" => {
            draft.meta("is_reaction", "true");
            if let Some(reaction) = &msg.reaction {
                draft
                    .content(reaction.emoji.clone())
                    .meta("reaction_message_id", reaction.message_id.clone());
            }
        }
        "order" => {
            if let Some(order) = &msg.order {
                draft.content(order.to_string());
            }
        }
        "system" => {
            if let Some(system) = &msg.system {
                draft
                    .content(system.body.clone())
                    .meta("system_type", system.kind.clone())
                    .meta("new_wa_id", system.wa_id.clone());
            }
        }
        _ => {}
    }

    if let Some(context) = &msg.context {
        if !context.id.is_empty() {
            draft.reply_to(&context.id).meta("reply_to_from", context.from.clone());
        }
        if context.forwarded || context.frequently_forwarded {
            draft.meta("forwarded", "true");
        }
    }

    if let Some(referral) = &msg.referral {
        draft
            .meta("referral_source_url", referral.source_url.clone())
            .meta("referral_source_id", referral.source_id.clone())
            .meta("referral_source_type", referral.source_type.clone())
            .meta("referral_headline", referral.headline.clone())
            .meta("ctwa_clid", referral.ctwa_clid.clone());
    }

    Ok(draft.finish(ctx.channel))
}

fn status_of(ctx: &ParseContext<'_>, status: WaStatus) -> StatusUpdate {
    let error = status.errors.first().map(WaError::describe);
    let mut update = status_update(ctx.channel, Vocabulary::WhatsApp, status.id, &status.status, error);

    if let Some(at) = parse_unix_seconds(&status.timestamp) {
        update.timestamp = at;
    }
    if !status.biz_opaque_callback_data.is_empty() {
        update.message_id = Some(status.biz_opaque_callback_data);
    }
    let meta = &mut update.metadata;
    if !status.recipient_id.is_empty() {
        meta.insert("recipient_id".into(), status.recipient_id);
    }
    if let Some(conversation) = status.conversation.filter(|c| !c.id.is_empty()) {
        meta.insert("conversation_id".into(), conversation.id);
    }
    if let Some(pricing) = status.pricing.filter(|p| !p.category.is_empty()) {
        meta.insert("pricing_category".into(), pricing.category);
    }
    update
}
