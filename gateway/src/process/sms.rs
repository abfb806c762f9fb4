//! Twilio SMS/MMS webhook parser.
//!
//! Twilio posts `application/x-www-form-urlencoded` bodies and expects a
//! TwiML document back, never JSON.

use std::collections::BTreeMap;

use super::envelope::{content_type_for_mime, InboundDraft};
use super::status::{status_update, Vocabulary};
use super::{ParseContext, ParsedBatch, Parser};
use crate::error::GatewayError;
use crate::queue::{Attachment, ContentType, InboundMessage, StatusUpdate};

/// Empty TwiML: acknowledge without replying.
pub const EMPTY_TWIML: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#;

/// Twilio caps MMS at ten media items.
const MAX_MEDIA: usize = 10;

pub struct TwilioParser;

pub type FormFields = BTreeMap<String, String>;

/// Decode a form body. Bodies that are not UTF-8 are rejected.
pub fn decode_form(body: &[u8]) -> Result<FormFields, GatewayError> {
    std::str::from_utf8(body).map_err(GatewayError::malformed)?;
    Ok(url::form_urlencoded::parse(body).into_owned().collect())
}

struct Form(FormFields);

impl Form {
    fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or_default()
    }

    fn message_sid(&self) -> &str {
        let sid = self.get("MessageSid");
        if sid.is_empty() {
            self.get("SmsSid")
        } else {
            sid
        }
    }

    fn status(&self) -> &str {
        let status = self.get("MessageStatus");
        if status.is_empty() {
            self.get("SmsStatus")
        } else {
            status
        }
    }

    /// Inbound messages carry `SmsStatus=received`; anything else with a
    /// status is a delivery callback for a message we sent.
    fn is_status_callback(&self) -> bool {
        let status = self.status();
        !status.is_empty() && !status.eq_ignore_ascii_case("received")
    }
}

impl Parser for TwilioParser {
    fn parse(&self, ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError> {
        let form = Form(decode_form(body)?);

        if form.message_sid().is_empty() {
            return Err(GatewayError::malformed("missing MessageSid"));
        }

        let mut batch = ParsedBatch::new();
        if form.is_status_callback() {
            batch.push_status(status_of(ctx, &form));
        } else {
            batch.push_message(inbound(ctx, &form));
        }
        Ok(batch)
    }
}

fn inbound(ctx: &ParseContext<'_>, form: &Form) -> InboundMessage {
    let num_media = form
        .get("NumMedia")
        .trim()
        .parse::<usize>()
        .unwrap_or(0)
        .min(MAX_MEDIA);

    let mut attachments = Vec::with_capacity(num_media);
    for i in 0..num_media {
        let url = form.get(&format!("MediaUrl{}", i));
        if url.is_empty() {
            continue;
        }
        let mime = form.get(&format!("MediaContentType{}", i));
        attachments.push(Attachment::new(content_type_for_mime(mime), url).mime(Some(mime)));
    }

    let content_type = attachments
        .first()
        .map(|a| a.kind)
        .unwrap_or(ContentType::Text);

    let mut draft = InboundDraft::new(content_type);
    draft
        .external_id(form.message_sid())
        .content(form.get("Body"))
        .meta("sender_id", form.get("From"))
        .meta("from", form.get("From"))
        .meta("to", form.get("To"))
        .meta("account_sid", form.get("AccountSid"))
        .meta("messaging_service_sid", form.get("MessagingServiceSid"))
        .meta("num_segments", form.get("NumSegments"))
        .meta("from_city", form.get("FromCity"))
        .meta("from_state", form.get("FromState"))
        .meta("from_zip", form.get("FromZip"))
        .meta("from_country", form.get("FromCountry"))
        .meta("to_city", form.get("ToCity"))
        .meta("to_state", form.get("ToState"))
        .meta("to_zip", form.get("ToZip"))
        .meta("to_country", form.get("ToCountry"));
    for attachment in attachments {
        draft.attach(attachment);
    }
    draft.finish(ctx.channel)
}

fn status_of(ctx: &ParseContext<'_>, form: &Form) -> StatusUpdate {
    let code = form.get("ErrorCode");
    let message = form.get("ErrorMessage");
    let error = match (code.is_empty(), message.is_empty()) {
        (true, true) => None,
        (false, true) => Some(format!("Twilio error {}", code)),
        (true, false) => Some(message.to_string()),
        (false, false) => Some(format!("{}: {}", code, message)),
    };

    let mut update = status_update(
        ctx.channel,
        Vocabulary::Twilio,
        form.message_sid(),
        form.status(),
        error,
    );
    for (key, field) in [
        ("from", "From"),
        ("to", "To"),
        ("account_sid", "AccountSid"),
        ("error_code", "ErrorCode"),
    ] {
        let value = form.get(field);
        if !value.is_empty() {
            update.metadata.insert(key.to_string(), value.to_string());
        }
    }
    update
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{channel, parse_form};
    use super::*;
    use crate::channel::ChannelType;
    use crate::queue::Status;

    #[test]
    fn test_inbound_sms() {
        let body = b"MessageSid=SM123&AccountSid=AC1&From=%2B15551234567&To=%2B15557654321\
&Body=Hello+there&NumMedia=0&SmsStatus=received&FromCity=AUSTIN";
        let batch = parse_form(&channel(ChannelType::Sms), body).unwrap();

        assert_eq!(batch.messages.len(), 1);
        assert!(batch.statuses.is_empty());
        let msg = &batch.messages[0];
        assert_eq!(msg.external_id, "SM123");
        assert_eq!(msg.content, "Hello there");
        assert_eq!(msg.content_type, ContentType::Text);
        assert_eq!(msg.metadata["sender_id"], "+15551234567");
        assert_eq!(msg.metadata["from_city"], "AUSTIN");
    }

    #[test]
    fn test_inbound_mms_media() {
        let body = b"MessageSid=MM1&From=%2B1&To=%2B2&Body=&NumMedia=2\
&MediaUrl0=https%3A%2F%2Fapi.twilio.com%2Fm0&MediaContentType0=video%2Fmp4\
&MediaUrl1=https%3A%2F%2Fapi.twilio.com%2Fm1&MediaContentType1=image%2Fjpeg";
        let batch = parse_form(&channel(ChannelType::Sms), body).unwrap();

        let msg = &batch.messages[0];
        assert_eq!(msg.content_type, ContentType::Video);
        assert_eq!(msg.attachments.len(), 2);
        assert_eq!(msg.attachments[0].url, "https://api.twilio.com/m0");
        assert_eq!(msg.attachments[1].kind, ContentType::Image);
    }

    #[test]
    fn test_status_callback() {
        let body = b"MessageSid=SM9&MessageStatus=undelivered&ErrorCode=30003\
&ErrorMessage=Unreachable+destination+handset&To=%2B2";
        let batch = parse_form(&channel(ChannelType::Sms), body).unwrap();

        assert!(batch.messages.is_empty());
        let update = &batch.statuses[0];
        assert_eq!(update.external_id, "SM9");
        assert_eq!(update.status, Status::Failed);
        assert_eq!(
            update.error_message.as_deref(),
            Some("30003: Unreachable destination handset")
        );
        assert_eq!(update.metadata["provider_status"], "undelivered");
    }

    #[test]
    fn test_sms_status_field_fallback() {
        let body = b"SmsSid=SM10&SmsStatus=delivered";
        let batch = parse_form(&channel(ChannelType::Sms), body).unwrap();
        assert_eq!(batch.statuses[0].status, Status::Delivered);
        assert_eq!(batch.statuses[0].external_id, "SM10");
    }

    #[test]
    fn test_missing_sid_is_malformed() {
        let result = parse_form(&channel(ChannelType::Sms), b"Body=hi");
        assert!(matches!(result, Err(GatewayError::MalformedEnvelope(_))));
    }
}
