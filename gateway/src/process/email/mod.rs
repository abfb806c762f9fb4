//! Email webhook parsing.
//!
//! Inbound email and delivery events arrive from whichever sending provider
//! the channel uses, selected by `config.provider`. Without one the body is
//! treated as an email-worker forward carrying the raw MIME message.

mod mailgun;
mod postmark;
mod raw;
mod sendgrid;
mod ses;

use chrono::{DateTime, Utc};
use mailparse::{addrparse, MailAddr};

use super::email_parser::{strip_angle_brackets, EmailAttachment};
use super::envelope::{content_type_for_mime, InboundDraft};
use super::status::{status_update, Vocabulary};
use super::{ParseContext, ParsedBatch, Parser};
use crate::channel::Channel;
use crate::error::GatewayError;
use crate::queue::{Attachment, ContentType, InboundMessage, Metadata, StatusUpdate};

pub use mailgun::MailgunSignature;

pub struct EmailParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailProvider {
    Mailgun,
    SendGrid,
    Postmark,
    Ses,
    Raw,
}

impl EmailProvider {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mailgun" => Some(EmailProvider::Mailgun),
            "sendgrid" => Some(EmailProvider::SendGrid),
            "postmark" => Some(EmailProvider::Postmark),
            "ses" | "amazon_ses" | "aws_ses" => Some(EmailProvider::Ses),
            "raw" | "worker" | "cloudflare" => Some(EmailProvider::Raw),
            _ => None,
        }
    }

    /// Provider for a channel; unset means [`EmailProvider::Raw`].
    pub fn for_channel(channel: &Channel) -> Result<Self, GatewayError> {
        match channel.provider() {
            None => Ok(EmailProvider::Raw),
            Some(name) => Self::from_name(&name)
                .ok_or_else(|| GatewayError::malformed(format!("unknown email provider {}", name))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailProvider::Mailgun => "mailgun",
            EmailProvider::SendGrid => "sendgrid",
            EmailProvider::Postmark => "postmark",
            EmailProvider::Ses => "ses",
            EmailProvider::Raw => "raw",
        }
    }
}

impl Parser for EmailParser {
    fn parse(&self, ctx: &ParseContext<'_>, body: &[u8]) -> Result<ParsedBatch, GatewayError> {
        let batch = match EmailProvider::for_channel(ctx.channel)? {
            EmailProvider::Mailgun => mailgun::parse(ctx, body)?,
            EmailProvider::SendGrid => sendgrid::parse(ctx, body)?,
            EmailProvider::Postmark => postmark::parse(ctx, body)?,
            EmailProvider::Ses => ses::parse(ctx, body)?,
            EmailProvider::Raw => raw::parse(ctx, body)?,
        };
        Ok(batch.settle())
    }
}

// =============================================================================
// Canonical email
// =============================================================================

/// Provider-neutral view of one received email.
#[derive(Debug, Default)]
pub(crate) struct IncomingEmail {
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub in_reply_to: String,
    pub references: String,
    pub received_at: Option<DateTime<Utc>>,
    pub spam_score: Option<f64>,
    pub attachments: Vec<EmailAttachment>,
    pub extra: Metadata,
}

impl IncomingEmail {
    pub fn meta(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        if !value.is_empty() {
            self.extra.insert(key.to_string(), value);
        }
        self
    }

    /// Content is the plain text body, or the HTML body when there is none.
    pub fn into_message(self, provider: EmailProvider, channel: &Channel) -> InboundMessage {
        let (sender_name, sender_id) = split_address(&self.from);
        let message_id = strip_angle_brackets(&self.message_id);
        let in_reply_to = strip_angle_brackets(&self.in_reply_to);
        let has_html = !self.html.trim().is_empty();
        let content = if self.text.trim().is_empty() {
            self.html
        } else {
            self.text
        };

        let mut draft = InboundDraft::new(ContentType::Text);
        draft
            .external_id(message_id.clone())
            .content(content)
            .meta("email_provider", provider.as_str())
            .meta("sender_id", sender_id)
            .meta("sender_name", sender_name)
            .meta("from", self.from)
            .meta("to", self.to)
            .meta("cc", self.cc)
            .meta("subject", self.subject)
            .meta("message_id", message_id)
            .meta("in_reply_to", in_reply_to.clone())
            .meta("references", self.references)
            .reply_to(&in_reply_to)
            .meta_opt("spam_score", self.spam_score.map(|s| format!("{:.2}", s)))
            .at(self.received_at);
        if has_html {
            draft.meta("has_html", "true");
        }
        if !self.attachments.is_empty() {
            draft.meta("attachment_count", self.attachments.len().to_string());
        }
        for (i, attachment) in self.attachments.iter().enumerate() {
            draft.attach(canonical_attachment(i, attachment));
        }
        for (key, value) in self.extra {
            draft.meta(&key, value);
        }
        draft.finish(channel)
    }
}

/// Email parts carry no URL; `url` holds the best handle available:
/// the provider reference, then `cid:<content-id>`, then the filename.
fn canonical_attachment(index: usize, file: &EmailAttachment) -> Attachment {
    let url = if !file.reference.is_empty() {
        file.reference.clone()
    } else if !file.content_id.is_empty() {
        format!("cid:{}", file.content_id)
    } else if !file.filename.is_empty() {
        file.filename.clone()
    } else {
        format!("attachment-{}", index + 1)
    };
    Attachment::new(content_type_for_mime(&file.mime_type), url)
        .mime(Some(file.mime_type.as_str()))
        .filename(Some(file.filename.as_str()))
        .size(file.size_bytes)
        .meta("content_id", file.content_id.clone())
}

/// Split `Name <addr@host>` into display name and address.
pub(crate) fn split_address(raw: &str) -> (String, String) {
    let raw = raw.trim();
    if raw.is_empty() {
        return (String::new(), String::new());
    }
    let first = addrparse(raw).ok().and_then(|list| {
        list.iter().find_map(|addr| match addr {
            MailAddr::Single(info) => Some(info.clone()),
            MailAddr::Group(group) => group.addrs.first().cloned(),
        })
    });
    match first {
        Some(info) => (info.display_name.unwrap_or_default(), info.addr),
        None => (String::new(), raw.to_string()),
    }
}

/// Email delivery event with provider extras attached.
pub(crate) fn email_status(
    channel: &Channel,
    vocabulary: Vocabulary,
    external_id: &str,
    raw_status: &str,
    error: Option<String>,
    extra: &[(&str, &str)],
) -> StatusUpdate {
    let mut update = status_update(
        channel,
        vocabulary,
        strip_angle_brackets(external_id),
        raw_status,
        error,
    );
    for (key, value) in extra {
        if !value.is_empty() {
            update.metadata.insert(key.to_string(), value.to_string());
        }
    }
    update
}
