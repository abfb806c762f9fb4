//! Postmark inbound and event webhooks. Both are JSON objects; inbound
//! messages are the ones without a delivery `RecordType`.

use serde::Deserialize;
use serde_json::Value;

use super::{email_status, EmailProvider, IncomingEmail};
use crate::error::GatewayError;
use crate::process::email_parser::{strip_angle_brackets, EmailAttachment};
use crate::process::envelope::parse_any_timestamp;
use crate::process::status::Vocabulary;
use crate::process::{decode_envelope, ParseContext, ParsedBatch};

pub(super) fn parse(ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError> {
    let value: Value = decode_envelope(body)?;
    let record_type = value
        .get("RecordType")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut batch = ParsedBatch::new();
    if record_type.is_empty() || record_type.eq_ignore_ascii_case("inbound") {
        let inbound: Inbound = serde_json::from_value(value).map_err(GatewayError::malformed)?;
        if inbound.from.is_empty() {
            return Err(GatewayError::malformed("missing From"));
        }
        batch.push_message(inbound.into_email().into_message(EmailProvider::Postmark, ctx.channel));
    } else {
        let event: Event = serde_json::from_value(value).map_err(GatewayError::malformed)?;
        batch.push_status(event.into_status(ctx));
    }
    Ok(batch)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inbound {
    #[serde(default)]
    from: String,
    #[serde(default)]
    from_name: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    cc: String,
    #[serde(default)]
    subject: String,
    #[serde(default, rename = "MessageID")]
    message_id: String,
    #[serde(default)]
    text_body: String,
    #[serde(default)]
    html_body: String,
    #[serde(default)]
    stripped_text_reply: String,
    #[serde(default)]
    reply_to: String,
    #[serde(default)]
    original_recipient: String,
    #[serde(default)]
    mailbox_hash: String,
    #[serde(default)]
    date: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    attachments: Vec<AttachmentInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Header {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachmentInfo {
    #[serde(default)]
    name: String,
    #[serde(default)]
    content_type: String,
    content_length: Option<u64>,
    #[serde(default, rename = "ContentID")]
    content_id: String,
}

impl Inbound {
    fn header(&self, name: &str) -> String {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
            .unwrap_or_default()
    }

    fn into_email(self) -> IncomingEmail {
        // Postmark's MessageID is its own id; the RFC Message-ID travels in Headers.
        let rfc_message_id = self.header("Message-ID");
        let from = if self.from_name.is_empty() || self.from.contains('<') {
            self.from.clone()
        } else {
            format!("{} <{}>", self.from_name, self.from)
        };

        let mut email = IncomingEmail {
            message_id: self.message_id.clone(),
            from,
            to: self.to.clone(),
            cc: self.cc.clone(),
            subject: self.subject.clone(),
            text: self.text_body.clone(),
            html: self.html_body.clone(),
            in_reply_to: self.header("In-Reply-To"),
            references: self.header("References"),
            received_at: parse_any_timestamp(&self.date),
            spam_score: self.header("X-Spam-Score").trim().parse().ok(),
            attachments: self
                .attachments
                .iter()
                .map(|a| EmailAttachment {
                    filename: a.name.clone(),
                    mime_type: a.content_type.clone(),
                    size_bytes: a.content_length,
                    content_id: strip_angle_brackets(&a.content_id),
                    reference: String::new(),
                })
                .collect(),
            ..Default::default()
        };
        email
            .meta("rfc_message_id", rfc_message_id)
            .meta("reply_to", self.reply_to)
            .meta("original_recipient", self.original_recipient)
            .meta("mailbox_hash", self.mailbox_hash)
            .meta("stripped_text_reply", self.stripped_text_reply);
        email
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Event {
    record_type: String,
    #[serde(default, rename = "MessageID")]
    message_id: String,
    #[serde(default)]
    recipient: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    delivered_at: String,
    #[serde(default)]
    bounced_at: String,
    #[serde(default)]
    received_at: String,
    #[serde(default, rename = "Type")]
    bounce_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    details: String,
    #[serde(default)]
    tag: String,
}

impl Event {
    fn into_status(self, ctx: &ParseContext<'_>) -> crate::queue::StatusUpdate {
        let recipient = if self.recipient.is_empty() { &self.email } else { &self.recipient };
        let error = match (self.description.is_empty(), self.details.is_empty()) {
            (true, true) => None,
            (false, true) => Some(self.description.clone()),
            (true, false) => Some(self.details.clone()),
            (false, false) => Some(format!("{}: {}", self.description, self.details)),
        };

        let mut update = email_status(
            ctx.channel,
            Vocabulary::Postmark,
            &self.message_id,
            &self.record_type,
            error,
            &[
                ("recipient", recipient.as_str()),
                ("bounce_type", self.bounce_type.as_str()),
                ("tag", self.tag.as_str()),
            ],
        );
        let at = [&self.delivered_at, &self.bounced_at, &self.received_at]
            .into_iter()
            .find_map(|t| parse_any_timestamp(t));
        if let Some(at) = at {
            update.timestamp = at;
        }
        update
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::channel::{Channel, ChannelType};
    use crate::process::test_support::{channel, parse};
    use crate::queue::{ContentType, Status};

    fn postmark() -> Channel {
        channel(ChannelType::Email).with_config("provider", "postmark")
    }

    #[test]
    fn test_inbound() {
        let body = json!({
            "From": "ana@x.test", "FromName": "Ana", "To": "support@acme.test",
            "Subject": "Order", "MessageID": "pm-1", "TextBody": "", "HtmlBody": "<p>where is it</p>",
            "Date": "Tue, 14 Nov 2023 22:13:20 +0000",
            "Headers": [{"Name": "In-Reply-To", "Value": "<out-9@acme.test>"},
                        {"Name": "Message-ID", "Value": "<rfc-1@x.test>"}],
            "Attachments": [
                {"Name": "invoice, march.pdf", "ContentType": "application/pdf", "ContentLength": 10},
                {"Name": "logo.png", "ContentType": "image/png", "ContentLength": 512, "ContentID": "<logo@x.test>"}
            ]
        })
        .to_string();
        let batch = parse(&postmark(), body.as_bytes()).unwrap();

        let msg = &batch.messages[0];
        assert_eq!(msg.external_id, "pm-1");
        assert_eq!(msg.content, "<p>where is it</p>");
        assert_eq!(msg.metadata["sender_name"], "Ana");
        assert_eq!(msg.metadata["sender_id"], "ana@x.test");
        assert_eq!(msg.metadata["reply_to_id"], "out-9@acme.test");
        assert_eq!(msg.metadata["rfc_message_id"], "<rfc-1@x.test>");
        assert_eq!(msg.metadata["attachment_count"], "2");
        let invoice = &msg.attachments[0];
        assert_eq!(invoice.kind, ContentType::Document);
        assert_eq!(invoice.url, "invoice, march.pdf");
        assert_eq!(invoice.filename.as_deref(), Some("invoice, march.pdf"));
        assert_eq!(invoice.mime_type.as_deref(), Some("application/pdf"));
        assert_eq!(invoice.size_bytes, Some(10));
        let logo = &msg.attachments[1];
        assert_eq!(logo.kind, ContentType::Image);
        assert_eq!(logo.url, "cid:logo@x.test");
        assert_eq!(logo.metadata["content_id"], "logo@x.test");
        assert_eq!(msg.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_bounce_event() {
        let body = json!({
            "RecordType": "Bounce", "MessageID": "pm-out-1", "Type": "HardBounce",
            "Email": "bob@x.test", "BouncedAt": "2023-11-14T22:13:20Z",
            "Description": "The server was unable to deliver your message"
        })
        .to_string();
        let batch = parse(&postmark(), body.as_bytes()).unwrap();

        let update = &batch.statuses[0];
        assert_eq!(update.status, Status::Failed);
        assert_eq!(update.external_id, "pm-out-1");
        assert_eq!(update.metadata["recipient"], "bob@x.test");
        assert_eq!(update.metadata["bounce_type"], "HardBounce");
        assert_eq!(update.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_delivery_and_open() {
        for (record, expected) in [("Delivery", Status::Delivered), ("Open", Status::Read)] {
            let body = json!({"RecordType": record, "MessageID": "m", "Recipient": "r@x.test"}).to_string();
            let batch = parse(&postmark(), body.as_bytes()).unwrap();
            assert_eq!(batch.statuses[0].status, expected);
        }
    }
}
