//! Amazon SES notifications delivered through SNS.
//!
//! The SNS envelope wraps the SES notification as a JSON string in
//! `Message`. Subscription confirmations are acknowledged without events.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tracing::{debug, info};

use super::{email_status, EmailProvider, IncomingEmail};
use crate::error::GatewayError;
use crate::process::email_parser::parse_raw_email;
use crate::process::envelope::parse_any_timestamp;
use crate::process::status::Vocabulary;
use crate::process::{decode_envelope, Ack, ParseContext, ParsedBatch};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SnsEnvelope {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    topic_arn: String,
    #[serde(default, rename = "SubscribeURL")]
    subscribe_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Notification {
    #[serde(default)]
    notification_type: String,
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    mail: Mail,
    bounce: Option<Bounce>,
    complaint: Option<Complaint>,
    delivery: Option<Delivery>,
    reject: Option<Reject>,
    receipt: Option<Receipt>,
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Mail {
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Bounce {
    #[serde(default)]
    bounce_type: String,
    #[serde(default)]
    bounce_sub_type: String,
    #[serde(default)]
    bounced_recipients: Vec<Recipient>,
    #[serde(default)]
    timestamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    #[serde(default)]
    email_address: String,
    #[serde(default)]
    diagnostic_code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Complaint {
    #[serde(default)]
    complained_recipients: Vec<Recipient>,
    #[serde(default)]
    complaint_feedback_type: String,
    #[serde(default)]
    timestamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Delivery {
    #[serde(default)]
    recipients: Vec<String>,
    #[serde(default)]
    smtp_response: String,
    #[serde(default)]
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct Reject {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Receipt {
    #[serde(default)]
    action: ReceiptAction,
    #[serde(default)]
    spam_verdict: Verdict,
}

#[derive(Debug, Default, Deserialize)]
struct ReceiptAction {
    #[serde(default)]
    encoding: String,
}

#[derive(Debug, Default, Deserialize)]
struct Verdict {
    #[serde(default)]
    status: String,
}

pub(super) fn parse(ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError> {
    let envelope: SnsEnvelope = decode_envelope(body)?;

    match envelope.kind.as_str() {
        "SubscriptionConfirmation" | "UnsubscribeConfirmation" => {
            info!(
                channel_id = %ctx.channel.id,
                topic_arn = %envelope.topic_arn,
                subscribe_url = %envelope.subscribe_url,
                kind = %envelope.kind,
                "ses_subscription_confirmation_received"
            );
            return Ok(ParsedBatch::acknowledged(Ack::Confirmed));
        }
        "Notification" => {}
        other => return Err(GatewayError::malformed(format!("unexpected SNS message type {}", other))),
    }

    let notification: Notification =
        decode_envelope(envelope.message.as_bytes()).map_err(|_| GatewayError::malformed("SNS Message is not an SES notification"))?;
    let kind = if notification.notification_type.is_empty() {
        notification.event_type.clone()
    } else {
        notification.notification_type.clone()
    };

    let mut batch = ParsedBatch::new();
    if kind == "Received" {
        batch.push_message(received(ctx, notification)?);
        return Ok(batch);
    }
    if kind.is_empty() || kind == "AmazonSnsSubscriptionSucceeded" {
        debug!(channel_id = %ctx.channel.id, "ses_notification_ignored");
        return Ok(ParsedBatch::acknowledged(Ack::Ignored));
    }

    let mail = &notification.mail;
    let mut recipient = String::new();
    let mut error = None;
    let mut extra: Vec<(&str, String)> = Vec::new();
    let mut at = None;

    if let Some(bounce) = &notification.bounce {
        if let Some(first) = bounce.bounced_recipients.first() {
            recipient = first.email_address.clone();
            error = Some(first.diagnostic_code.clone());
        }
        if error.as_deref().map_or(true, str::is_empty) {
            error = Some(format!("{} bounce ({})", bounce.bounce_type, bounce.bounce_sub_type));
        }
        extra.push(("bounce_type", bounce.bounce_type.clone()));
        extra.push(("bounce_sub_type", bounce.bounce_sub_type.clone()));
        at = parse_any_timestamp(&bounce.timestamp);
    } else if let Some(complaint) = &notification.complaint {
        if let Some(first) = complaint.complained_recipients.first() {
            recipient = first.email_address.clone();
        }
        extra.push(("complaint_feedback_type", complaint.complaint_feedback_type.clone()));
        at = parse_any_timestamp(&complaint.timestamp);
    } else if let Some(delivery) = &notification.delivery {
        recipient = delivery.recipients.join(", ");
        extra.push(("smtp_response", delivery.smtp_response.clone()));
        at = parse_any_timestamp(&delivery.timestamp);
    } else if let Some(reject) = &notification.reject {
        error = Some(reject.reason.clone());
    }
    if recipient.is_empty() {
        recipient = mail.destination.join(", ");
    }

    extra.push(("recipient", recipient));
    extra.push(("source", mail.source.clone()));
    let extra: Vec<(&str, &str)> = extra.iter().map(|(k, v)| (*k, v.as_str())).collect();

    let mut update = email_status(ctx.channel, Vocabulary::Ses, &mail.message_id, &kind, error, &extra);
    if let Some(at) = at.or_else(|| parse_any_timestamp(&mail.timestamp)) {
        update.timestamp = at;
    }
    batch.push_status(update);
    Ok(batch)
}

/// Inbound mail from a receipt rule with an SNS action; `content` is the
/// full MIME message.
fn received(ctx: &ParseContext<'_>, notification: Notification) -> Result<crate::queue::InboundMessage, GatewayError> {
    let content = notification
        .content
        .ok_or_else(|| GatewayError::malformed("Received notification without content"))?;
    let receipt = notification.receipt;
    let base64 = receipt
        .as_ref()
        .is_some_and(|r| r.action.encoding.eq_ignore_ascii_case("BASE64"));

    let raw = if base64 {
        STANDARD.decode(content.trim()).map_err(GatewayError::malformed)?
    } else {
        content.into_bytes()
    };
    let parsed = parse_raw_email(&raw).map_err(GatewayError::malformed)?;

    let mail = notification.mail;
    let mut email = IncomingEmail {
        message_id: parsed.message_id.unwrap_or(mail.message_id),
        from: parsed.from.unwrap_or(mail.source),
        to: parsed.to.unwrap_or_else(|| mail.destination.join(", ")),
        cc: parsed.cc.unwrap_or_default(),
        subject: parsed.subject.unwrap_or_default(),
        text: parsed.text.unwrap_or_default(),
        html: parsed.html.unwrap_or_default(),
        in_reply_to: parsed.in_reply_to.unwrap_or_default(),
        references: parsed.references.unwrap_or_default(),
        received_at: parse_any_timestamp(&mail.timestamp),
        attachments: parsed.attachments,
        ..Default::default()
    };
    if let Some(receipt) = receipt {
        email.meta("spam_verdict", receipt.spam_verdict.status);
    }
    Ok(email.into_message(EmailProvider::Ses, ctx.channel))
}
