//! RFC 5322 Email Parser using mailparse.
//!
//! Used for providers that hand us the raw MIME message (email workers,
//! SES receipt rules) rather than pre-extracted fields.

use anyhow::{Context, Result};
use mailparse::{parse_mail, DispositionType, MailHeaderMap, ParsedMail};
use tracing::{debug, warn};

/// Parsed email result.
#[derive(Debug, Default)]
pub struct ParsedEmail {
    /// Message-Id header value (without angle brackets)
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    /// Raw `Date` header
    pub date: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    /// Plain text body
    pub text: Option<String>,
    /// HTML body content
    pub html: Option<String>,
    /// File parts (attachments and inline non-text parts), in MIME order
    pub attachments: Vec<EmailAttachment>,
}

/// One attached file as described by its MIME part or provider record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailAttachment {
    pub filename: String,
    pub mime_type: String,
    /// Decoded size in bytes, when known
    pub size_bytes: Option<u64>,
    /// `Content-ID` without angle brackets
    pub content_id: String,
    /// Provider handle for the file, e.g. the form field it was posted in
    pub reference: String,
}

/// Parse raw RFC 5322 email content.
///
/// Returns the threading headers plus the plain text and HTML bodies found
/// anywhere in the MIME tree.
pub fn parse_raw_email(raw_content: &[u8]) -> Result<ParsedEmail> {
    let mail = parse_mail(raw_content).context("Failed to parse email")?;
    let header = |name: &str| {
        mail.headers
            .get_first_value(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let mut attachments = Vec::new();
    collect_attachments(&mail, &mut attachments);

    let result = ParsedEmail {
        message_id: header("Message-Id").map(|id| strip_angle_brackets(&id)),
        subject: header("Subject"),
        from: header("From"),
        to: header("To"),
        cc: header("Cc"),
        date: header("Date"),
        in_reply_to: header("In-Reply-To").map(|id| strip_angle_brackets(&id)),
        references: header("References"),
        text: find_body(&mail, "text/plain"),
        html: extract_html_body(&mail),
        attachments,
    };

    debug!(
        has_message_id = result.message_id.is_some(),
        has_text = result.text.is_some(),
        has_html = result.html.is_some(),
        attachment_count = result.attachments.len(),
        "email_parse_complete"
    );

    Ok(result)
}

pub fn strip_angle_brackets(id: &str) -> String {
    id.trim().trim_matches(|c| c == '<' || c == '>').to_string()
}

/// Extract HTML body from a parsed email.
///
/// Handles various email structures:
/// - text/html (direct HTML content)
/// - multipart/alternative (prefers HTML over plain text)
/// - multipart/related (finds HTML part within)
/// - multipart/mixed (searches for HTML part)
fn extract_html_body(mail: &ParsedMail) -> Option<String> {
    let content_type = mail.ctype.mimetype.as_str();

    if content_type == "text/html" || content_type.starts_with("multipart/") {
        return find_body(mail, "text/html");
    }

    // Not HTML and not multipart - check if it contains HTML anyway
    if content_type == "text/plain" {
        let body = extract_body_text(mail)?;
        let body_lower = body.to_lowercase();
        if body_lower.contains("<html") || body_lower.contains("<body") {
            debug!("email_plain_contains_html");
            return Some(body);
        }
    }
    None
}

/// Body of the given MIME type, searching nested multiparts. Several
/// matching parts are joined with newlines.
fn find_body(mail: &ParsedMail, mimetype: &str) -> Option<String> {
    if mail.subparts.is_empty() {
        return if mail.ctype.mimetype == mimetype && !is_attachment(mail) {
            extract_body_text(mail)
        } else {
            None
        };
    }

    let mut parts: Vec<String> = mail
        .subparts
        .iter()
        .filter_map(|part| find_body(part, mimetype))
        .collect();

    match parts.len() {
        0 => None,
        1 => Some(parts.remove(0)),
        _ => Some(parts.join("\n")),
    }
}

fn is_attachment(part: &ParsedMail) -> bool {
    matches!(
        part.get_content_disposition().disposition,
        DispositionType::Attachment
    )
}

/// Explicit attachments plus inline leaf parts that are not text, such as
/// embedded images referenced by Content-ID.
fn is_file_part(part: &ParsedMail) -> bool {
    let mimetype = part.ctype.mimetype.as_str();
    is_attachment(part)
        || (part.subparts.is_empty() && !mimetype.starts_with("text/") && !mimetype.starts_with("multipart/"))
}

fn collect_attachments(mail: &ParsedMail, found: &mut Vec<EmailAttachment>) {
    for part in &mail.subparts {
        if is_file_part(part) {
            let disposition = part.get_content_disposition();
            let filename = disposition
                .params
                .get("filename")
                .or_else(|| part.ctype.params.get("name"))
                .cloned()
                .unwrap_or_default();
            found.push(EmailAttachment {
                filename,
                mime_type: part.ctype.mimetype.clone(),
                size_bytes: part.get_body_raw().ok().map(|body| body.len() as u64),
                content_id: part
                    .headers
                    .get_first_value("Content-ID")
                    .map(|id| strip_angle_brackets(&id))
                    .unwrap_or_default(),
                reference: String::new(),
            });
        }
        collect_attachments(part, found);
    }
}

/// Extract the body text from a mail part.
fn extract_body_text(mail: &ParsedMail) -> Option<String> {
    match mail.get_body() {
        Ok(body) => {
            if body.trim().is_empty() {
                None
            } else {
                Some(body)
            }
        }
        Err(e) => {
            warn!(error = %e, "email_body_extraction_failed");
            None
        }
    }
}
