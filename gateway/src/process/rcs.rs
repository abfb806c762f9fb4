//! RCS webhook parser.
//!
//! RCS reaches us through one of several aggregators, each with its own
//! payload shape. The channel's `config.provider` selects the shape; when it
//! is unset the shape is recognised from the body.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::envelope::{content_type_for, content_type_for_mime, parse_any_timestamp, Family, InboundDraft, IdValue};
use super::status::{status_update, Vocabulary};
use super::{decode_envelope, decode_item, Ack, ParseContext, ParsedBatch, Parser};
use crate::error::GatewayError;
use crate::queue::{Attachment, ContentType};

pub struct RcsParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provider {
    Zenvia,
    Infobip,
    Pontaltech,
    Google,
}

impl Provider {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "zenvia" => Some(Provider::Zenvia),
            "infobip" => Some(Provider::Infobip),
            "pontaltech" => Some(Provider::Pontaltech),
            "google" | "rbm" => Some(Provider::Google),
            _ => None,
        }
    }

    fn sniff(envelope: &Value) -> Option<Self> {
        if envelope.get("results").is_some_and(Value::is_array) {
            return Some(Provider::Infobip);
        }
        if envelope.get("senderPhoneNumber").is_some()
            || envelope.get("eventType").is_some()
            || envelope.pointer("/message/data").is_some_and(Value::is_string)
        {
            return Some(Provider::Google);
        }
        match envelope.get("type").and_then(Value::as_str) {
            Some("MESSAGE") | Some("MESSAGE_STATUS") => Some(Provider::Zenvia),
            Some("message") | Some("status") => Some(Provider::Pontaltech),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Provider::Zenvia => "zenvia",
            Provider::Infobip => "infobip",
            Provider::Pontaltech => "pontaltech",
            Provider::Google => "google",
        }
    }
}

impl Parser for RcsParser {
    fn parse(&self, ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError> {
        let envelope: Value = decode_envelope(body)?;

        let provider = match ctx.channel.provider() {
            Some(name) => Provider::from_name(&name)
                .ok_or_else(|| GatewayError::malformed(format!("unknown rcs provider {}", name)))?,
            None => Provider::sniff(&envelope)
                .ok_or_else(|| GatewayError::malformed("unrecognized rcs payload"))?,
        };
        debug!(channel_id = %ctx.channel.id, provider = provider.as_str(), "rcs_payload_detected");

        let batch = match provider {
            Provider::Zenvia => zenvia(ctx, envelope)?,
            Provider::Infobip => infobip(ctx, envelope)?,
            Provider::Pontaltech => pontaltech(ctx, envelope)?,
            Provider::Google => google(ctx, envelope)?,
        };
        Ok(batch.settle())
    }
}

fn envelope_of<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, GatewayError> {
    serde_json::from_value(value).map_err(GatewayError::malformed)
}

fn draft_for(provider: Provider, content_type: ContentType) -> InboundDraft {
    let mut draft = InboundDraft::new(content_type);
    draft.meta("rcs_provider", provider.as_str());
    draft
}

fn location_content(latitude: f64, longitude: f64, name: &str, address: &str) -> String {
    let mut content = json!({"latitude": latitude, "longitude": longitude});
    if let Some(object) = content.as_object_mut() {
        if !name.is_empty() {
            object.insert("name".into(), Value::from(name));
        }
        if !address.is_empty() {
            object.insert("address".into(), Value::from(address));
        }
    }
    content.to_string()
}

fn locate(draft: &mut InboundDraft, latitude: f64, longitude: f64, name: &str, address: &str) {
    draft.content_type = ContentType::Location;
    draft
        .content(location_content(latitude, longitude, name, address))
        .meta("latitude", format!("{:.6}", latitude))
        .meta("longitude", format!("{:.6}", longitude))
        .meta("location_name", name)
        .meta("location_address", address);
}

// =============================================================================
// Zenvia
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZenviaEvent {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    message_id: String,
    message: Option<ZenviaMessage>,
    message_status: Option<ZenviaStatus>,
}

#[derive(Debug, Deserialize)]
struct ZenviaMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    contents: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZenviaContent {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    payload: String,
    #[serde(default)]
    file_url: String,
    #[serde(default)]
    file_mime_type: String,
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    file_caption: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
struct ZenviaStatus {
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    code: String,
    #[serde(default)]
    description: String,
}

fn zenvia(ctx: &ParseContext<'_>, envelope: Value) -> Result<ParsedBatch, GatewayError> {
    let event: ZenviaEvent = envelope_of(envelope)?;
    let mut batch = ParsedBatch::new();

    match (event.kind.as_str(), event.message, event.message_status) {
        ("MESSAGE", Some(message), _) => {
            let mut draft = draft_for(Provider::Zenvia, ContentType::Text);
            draft
                .external_id(message.id)
                .meta("sender_id", message.from.clone())
                .meta("sender_phone", message.from)
                .meta("agent_id", message.to)
                .at(parse_any_timestamp(&event.timestamp));

            let mut texts = Vec::new();
            for (i, raw) in message.contents.into_iter().enumerate() {
                let Some(content) =
                    decode_item::<ZenviaContent>(raw, || format!("message.contents[{}]", i), &mut batch)
                else {
                    continue;
                };
                zenvia_content(&mut draft, content, &mut texts);
            }
            if draft.content.is_empty() {
                draft.content(texts.join("\n"));
            }
            batch.push_message(draft.finish(ctx.channel));
        }
        ("MESSAGE_STATUS", _, Some(status)) => {
            let external_id = if event.message_id.is_empty() {
                event.id
            } else {
                event.message_id
            };
            let mut update = status_update(
                ctx.channel,
                Vocabulary::Rcs,
                external_id,
                &status.code,
                Some(status.description),
            );
            if let Some(at) = parse_any_timestamp(&status.timestamp) {
                update.timestamp = at;
            }
            batch.push_status(update);
        }
        _ => return Ok(ParsedBatch::acknowledged(Ack::Ignored)),
    }
    Ok(batch)
}

fn zenvia_content(draft: &mut InboundDraft, content: ZenviaContent, texts: &mut Vec<String>) {
    match content.kind.as_str() {
        "text" => texts.push(content.text),
        "file" => {
            let kind = content_type_for_mime(&content.file_mime_type);
            if draft.attachments.is_empty() {
                draft.content_type = kind;
            }
            if !content.file_caption.is_empty() {
                texts.push(content.file_caption);
            }
            draft.attach(
                Attachment::new(kind, content.file_url)
                    .mime(Some(&content.file_mime_type))
                    .filename(Some(&content.file_name)),
            );
        }
        "location" => {
            if let (Some(lat), Some(long)) = (content.latitude, content.longitude) {
                locate(draft, lat, long, &content.name, &content.address);
            }
        }
        "postback" | "button" => {
            draft.content_type = ContentType::Interactive;
            draft.meta("postback_data", content.payload);
            texts.push(content.text);
        }
        other => {
            draft.meta("original_type", other);
        }
    }
}

// =============================================================================
// Infobip
// =============================================================================

#[derive(Debug, Deserialize)]
struct InfobipEnvelope {
    results: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InfobipResult {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    received_at: String,
    #[serde(default)]
    done_at: String,
    #[serde(default)]
    text: String,
    message: Option<InfobipMessage>,
    status: Option<Value>,
    error: Option<InfobipError>,
}

#[derive(Debug, Deserialize)]
struct InfobipMessage {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    url: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    #[serde(default, rename = "postbackData")]
    postback_data: String,
}

#[derive(Debug, Deserialize)]
struct InfobipError {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
}

impl InfobipResult {
    /// Status reports carry either a bare string or `{groupName, name}`.
    fn status_name(&self) -> Option<String> {
        match self.status.as_ref()? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Object(o) => o
                .get("groupName")
                .or_else(|| o.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }
}

fn infobip(ctx: &ParseContext<'_>, envelope: Value) -> Result<ParsedBatch, GatewayError> {
    let envelope: InfobipEnvelope = envelope_of(envelope)?;
    let mut batch = ParsedBatch::new();

    for (i, raw) in envelope.results.into_iter().enumerate() {
        let location = || format!("results[{}]", i);
        let Some(result) = decode_item::<InfobipResult>(raw, location, &mut batch) else {
            continue;
        };

        if !result.text.is_empty() || result.message.is_some() {
            batch.push_message(infobip_inbound(ctx, result));
        } else if let Some(raw_status) = result.status_name() {
            let error = result
                .error
                .as_ref()
                .map(|e| if e.description.is_empty() { e.name.clone() } else { e.description.clone() });
            let mut update =
                status_update(ctx.channel, Vocabulary::Rcs, result.message_id.clone(), &raw_status, error);
            if let Some(at) = parse_any_timestamp(&result.done_at) {
                update.timestamp = at;
            }
            batch.push_status(update);
        } else {
            batch.push_failure(location(), "result carries neither text nor status");
        }
    }
    Ok(batch)
}

fn infobip_inbound(ctx: &ParseContext<'_>, result: InfobipResult) -> crate::queue::InboundMessage {
    let mut draft = draft_for(Provider::Infobip, ContentType::Text);
    draft
        .external_id(result.message_id)
        .meta("sender_id", result.from.clone())
        .meta("sender_phone", result.from)
        .meta("agent_id", result.to)
        .at(parse_any_timestamp(&result.received_at))
        .content(result.text);

    if let Some(message) = result.message {
        let kind = message.kind.to_ascii_lowercase();
        match kind.as_str() {
            "location" => {
                if let (Some(lat), Some(long)) = (message.latitude, message.longitude) {
                    locate(&mut draft, lat, long, "", "");
                }
            }
            "suggestion" | "postback" => {
                draft.content_type = ContentType::Interactive;
                draft.content(message.text).meta("postback_data", message.postback_data);
            }
            _ => {
                let content_type = content_type_for(Family::Rcs, &kind).unwrap_or(ContentType::Text);
                if !message.url.is_empty() && content_type != ContentType::Text {
                    draft.content_type = content_type;
                    draft.attach(Attachment::new(content_type, message.url));
                }
                if !message.text.is_empty() {
                    draft.content(message.text);
                }
            }
        }
    }
    draft.finish(ctx.channel)
}

// =============================================================================
// Pontaltech
// =============================================================================

#[derive(Debug, Deserialize)]
struct PontaltechEvent {
    #[serde(default)]
    id: IdValue,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    error: String,
}

fn pontaltech(ctx: &ParseContext<'_>, envelope: Value) -> Result<ParsedBatch, GatewayError> {
    let event: PontaltechEvent = envelope_of(envelope)?;
    let mut batch = ParsedBatch::new();
    let timestamp = parse_any_timestamp(&event.timestamp);

    match event.kind.as_str() {
        "message" => {
            let mut draft = draft_for(Provider::Pontaltech, ContentType::Text);
            draft
                .external_id(event.id.to_string())
                .content(event.content)
                .meta("sender_id", event.from.clone())
                .meta("sender_phone", event.from)
                .meta("agent_id", event.to)
                .at(timestamp);
            batch.push_message(draft.finish(ctx.channel));
        }
        "status" => {
            let mut update = status_update(
                ctx.channel,
                Vocabulary::Rcs,
                event.id.to_string(),
                &event.status,
                Some(event.error),
            );
            if let Some(at) = timestamp {
                update.timestamp = at;
            }
            batch.push_status(update);
        }
        _ => return Ok(ParsedBatch::acknowledged(Ack::Ignored)),
    }
    Ok(batch)
}

// =============================================================================
// Google RBM
// =============================================================================

#[derive(Debug, Deserialize)]
struct PubSubPush {
    message: PubSubMessage,
}

#[derive(Debug, Deserialize)]
struct PubSubMessage {
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RbmEvent {
    #[serde(default)]
    sender_phone_number: String,
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    send_time: String,
    #[serde(default)]
    agent: String,
    #[serde(default)]
    conversation_id: String,
    #[serde(default)]
    text: String,
    suggestion_response: Option<RbmSuggestion>,
    location: Option<RbmLocation>,
    user_file: Option<RbmUserFile>,
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    event_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RbmSuggestion {
    #[serde(default)]
    postback_data: String,
    #[serde(default)]
    text: String,
    #[serde(default, rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct RbmLocation {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct RbmUserFile {
    payload: RbmFile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RbmFile {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    file_uri: String,
    #[serde(default)]
    file_name: String,
    file_size_bytes: Option<IdValue>,
}

fn google(ctx: &ParseContext<'_>, envelope: Value) -> Result<ParsedBatch, GatewayError> {
    let envelope = if envelope.pointer("/message/data").is_some_and(Value::is_string) {
        let push: PubSubPush = envelope_of(envelope)?;
        let decoded = STANDARD
            .decode(push.message.data.trim())
            .map_err(GatewayError::malformed)?;
        decode_envelope::<Value>(&decoded)?
    } else {
        envelope
    };

    let event: RbmEvent = envelope_of(envelope)?;
    let mut batch = ParsedBatch::new();

    if !event.event_type.is_empty() {
        let raw_status = event.event_type.to_ascii_lowercase();
        if raw_status != "delivered" && raw_status != "read" {
            debug!(event_type = %event.event_type, "rbm_event_ignored");
            return Ok(ParsedBatch::acknowledged(Ack::Ignored));
        }
        let mut update = status_update(ctx.channel, Vocabulary::Rcs, event.message_id, &raw_status, None);
        if let Some(at) = parse_any_timestamp(&event.send_time) {
            update.timestamp = at;
        }
        update.metadata.insert("event_id".into(), event.event_id);
        update.metadata.retain(|_, v| !v.is_empty());
        batch.push_status(update);
        return Ok(batch);
    }

    let mut draft = draft_for(Provider::Google, ContentType::Text);
    draft
        .external_id(event.message_id)
        .content(event.text)
        .meta("sender_id", event.sender_phone_number.clone())
        .meta("sender_phone", event.sender_phone_number)
        .meta("agent_id", event.agent)
        .meta("conversation_id", event.conversation_id)
        .at(parse_any_timestamp(&event.send_time));

    if let Some(suggestion) = event.suggestion_response {
        draft.content_type = ContentType::Interactive;
        draft
            .content(suggestion.text)
            .meta("postback_data", suggestion.postback_data)
            .meta("suggestion_type", suggestion.kind);
    } else if let Some(location) = event.location {
        locate(&mut draft, location.latitude, location.longitude, "", "");
    } else if let Some(file) = event.user_file {
        let file = file.payload;
        let kind = content_type_for_mime(&file.mime_type);
        let size = file.file_size_bytes.and_then(|s| s.to_string().parse::<u64>().ok());
        draft.content_type = kind;
        draft.attach(
            Attachment::new(kind, file.file_uri)
                .mime(Some(&file.mime_type))
                .filename(Some(&file.file_name))
                .size(size),
        );
    } else if draft.content.is_empty() {
        return Ok(ParsedBatch::acknowledged(Ack::Ignored));
    }

    batch.push_message(draft.finish(ctx.channel));
    Ok(batch)
}
