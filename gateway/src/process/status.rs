//! Provider delivery-status vocabularies mapped onto [`Status`].
//!
//! Every table is matched case-insensitively. A string that no table knows
//! is `pending`: status callbacks are never dropped or rejected for using an
//! unfamiliar word.

use crate::channel::Channel;
use crate::queue::{Status, StatusUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vocabulary {
    WhatsApp,
    Messenger,
    Twilio,
    Rcs,
    SendGrid,
    Mailgun,
    Postmark,
    Ses,
    Generic,
}

use Status::{Delivered, Failed, Pending, Read, Sent};

const WHATSAPP: &[(&str, Status)] = &[
    ("sent", Sent),
    ("delivered", Delivered),
    ("read", Read),
    ("played", Read),
    ("failed", Failed),
];

const MESSENGER: &[(&str, Status)] = &[
    ("sent", Sent),
    ("delivery", Delivered),
    ("delivered", Delivered),
    ("read", Read),
    ("seen", Read),
    ("failed", Failed),
];

const TWILIO: &[(&str, Status)] = &[
    ("queued", Pending),
    ("sending", Pending),
    ("accepted", Pending),
    ("scheduled", Pending),
    ("received", Pending),
    ("sent", Sent),
    ("delivered", Delivered),
    ("read", Read),
    ("undelivered", Failed),
    ("failed", Failed),
    ("canceled", Failed),
];

const RCS: &[(&str, Status)] = &[
    ("pending", Pending),
    ("sent", Sent),
    ("delivered", Delivered),
    ("read", Read),
    ("seen", Read),
    ("failed", Failed),
    ("rejected", Failed),
    ("not_delivered", Failed),
    ("undeliverable", Failed),
    ("error", Failed),
    ("expired", Failed),
];

const SENDGRID: &[(&str, Status)] = &[
    ("processed", Pending),
    ("deferred", Pending),
    ("unsubscribe", Pending),
    ("group_unsubscribe", Pending),
    ("delivered", Delivered),
    ("open", Read),
    ("click", Read),
    ("dropped", Failed),
    ("bounce", Failed),
    ("blocked", Failed),
    ("spam_report", Failed),
];

const MAILGUN: &[(&str, Status)] = &[
    ("accepted", Pending),
    ("unsubscribed", Pending),
    ("delivered", Delivered),
    ("opened", Read),
    ("clicked", Read),
    ("failed", Failed),
    ("rejected", Failed),
    ("complained", Failed),
];

const POSTMARK: &[(&str, Status)] = &[
    ("subscriptionchange", Pending),
    ("delivery", Delivered),
    ("open", Read),
    ("click", Read),
    ("bounce", Failed),
    ("spamcomplaint", Failed),
];

const SES: &[(&str, Status)] = &[
    ("deliverydelay", Pending),
    ("send", Sent),
    ("delivery", Delivered),
    ("open", Read),
    ("click", Read),
    ("bounce", Failed),
    ("complaint", Failed),
    ("reject", Failed),
    ("renderingfailure", Failed),
];

const GENERIC: &[(&str, Status)] = &[
    ("pending", Pending),
    ("queued", Pending),
    ("sent", Sent),
    ("delivered", Delivered),
    ("read", Read),
    ("seen", Read),
    ("failed", Failed),
    ("error", Failed),
    ("undelivered", Failed),
];

impl Vocabulary {
    pub fn table(&self) -> &'static [(&'static str, Status)] {
        match self {
            Vocabulary::WhatsApp => WHATSAPP,
            Vocabulary::Messenger => MESSENGER,
            Vocabulary::Twilio => TWILIO,
            Vocabulary::Rcs => RCS,
            Vocabulary::SendGrid => SENDGRID,
            Vocabulary::Mailgun => MAILGUN,
            Vocabulary::Postmark => POSTMARK,
            Vocabulary::Ses => SES,
            Vocabulary::Generic => GENERIC,
        }
    }
}

pub fn canonicalize(vocabulary: Vocabulary, raw: &str) -> Status {
    let needle = raw.trim();
    vocabulary
        .table()
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(needle))
        .map(|(_, status)| *status)
        .unwrap_or(Pending)
}

/// Build a status update with the raw provider string preserved.
///
/// `metadata.provider_status` always carries `raw_status`; a failure with no
/// provider error text reports the raw status as its error message.
pub fn status_update(
    channel: &Channel,
    vocabulary: Vocabulary,
    external_id: impl Into<String>,
    raw_status: &str,
    error_message: Option<String>,
) -> StatusUpdate {
    let status = canonicalize(vocabulary, raw_status);
    let mut update = StatusUpdate::for_channel(channel, external_id.into(), status);
    update
        .metadata
        .insert("provider_status".to_string(), raw_status.to_string());

    update.error_message = error_message.filter(|e| !e.trim().is_empty());
    if status == Failed && update.error_message.is_none() {
        update.error_message = Some(raw_status.to_string());
    }
    update
}
