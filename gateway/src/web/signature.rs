//! Webhook signature primitives.
//!
//! Each provider signs callbacks its own way:
//! - Meta, RCS aggregators, payment-style hooks: hex HMAC-SHA256 of the raw body
//! - Twilio: base64 HMAC-SHA1 of the URL plus the sorted form parameters
//! - Mailgun: hex HMAC-SHA256 of `timestamp + token`
//! - Telegram, Postmark: a shared secret echoed in a header
//!
//! Every comparison here runs in constant time.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// Hex HMAC-SHA256 of `body` keyed with `secret`.
pub fn hmac_sha256_hex(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Whether a `sha256=` prefix is part of the header format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    /// Meta always sends `sha256=<hex>`.
    Required,
    /// Aggregators send either form.
    Optional,
}

/// Verify a hex HMAC-SHA256 signature of the raw body.
pub fn verify_body_signature(secret: &str, body: &[u8], provided: &str, prefix: Prefix) -> bool {
    let provided = provided.trim();
    let digest = match (provided.strip_prefix("sha256="), prefix) {
        (Some(digest), _) => digest,
        (None, Prefix::Optional) => provided,
        (None, Prefix::Required) => {
            warn!("body_signature_missing_prefix");
            return false;
        }
    };

    match hmac_sha256_hex(secret, body) {
        Some(expected) => constant_time_compare(&expected, &digest.to_ascii_lowercase()),
        None => false,
    }
}

/// Verify `X-Twilio-Signature`.
///
/// Twilio signs the full webhook URL followed by every POST parameter,
/// sorted by name, as `name + value` with no separators.
pub fn verify_twilio_signature(
    auth_token: &str,
    url: &str,
    params: &BTreeMap<String, String>,
    provided: &str,
) -> bool {
    let mut mac = match HmacSha1::new_from_slice(auth_token.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(url.as_bytes());
    for (name, value) in params {
        mac.update(name.as_bytes());
        mac.update(value.as_bytes());
    }
    let expected = STANDARD.encode(mac.finalize().into_bytes());
    constant_time_compare(&expected, provided.trim())
}

/// Compare a header value against a configured shared secret.
pub fn verify_shared_secret(expected: &str, provided: &str) -> bool {
    !expected.is_empty() && constant_time_compare(expected, provided.trim())
}

/// Verify a Mailgun webhook signature.
///
/// Mailgun webhooks include three fields for signature verification:
/// - timestamp: Unix epoch seconds when the webhook was generated
/// - token: A randomly generated string
/// - signature: HMAC-SHA256 hex digest of timestamp + token
///
/// # Arguments
///
/// * `signing_key` - Your Mailgun HTTP webhook signing key
/// * `timestamp` - The 'timestamp' field from the webhook payload
/// * `token` - The 'token' field from the webhook payload
/// * `signature` - The 'signature' field from the webhook payload
/// * `max_age_seconds` - Maximum allowed age of the timestamp (prevents replay attacks)
///
/// # Returns
///
/// `true` if the signature is valid and not stale, `false` otherwise.
pub fn verify_mailgun_signature(
    signing_key: &str,
    timestamp: &str,
    token: &str,
    signature: &str,
    max_age_seconds: u64,
) -> bool {
    if signing_key.is_empty() || timestamp.is_empty() || token.is_empty() || signature.is_empty() {
        warn!(
            has_signing_key = !signing_key.is_empty(),
            has_timestamp = !timestamp.is_empty(),
            has_token = !token.is_empty(),
            has_signature = !signature.is_empty(),
            "mailgun_signature_missing_fields"
        );
        return false;
    }

    let webhook_time: u64 = match timestamp.parse() {
        Ok(t) => t,
        Err(_) => {
            warn!(timestamp = %timestamp, "mailgun_signature_invalid_timestamp");
            return false;
        }
    };

    let current_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let age = current_time.abs_diff(webhook_time);
    if age > max_age_seconds {
        warn!(
            webhook_time = webhook_time,
            current_time = current_time,
            age_seconds = age,
            max_age_seconds = max_age_seconds,
            "mailgun_signature_stale"
        );
        return false;
    }

    let expected_signature = match hmac_sha256_hex(signing_key, format!("{}{}", timestamp, token).as_bytes()) {
        Some(sig) => sig,
        None => {
            warn!("mailgun_signature_invalid_key");
            return false;
        }
    };

    let valid = constant_time_compare(&expected_signature, signature);
    if !valid {
        warn!(
            expected_length = expected_signature.len(),
            actual_length = signature.len(),
            "mailgun_signature_mismatch"
        );
    }
    valid
}

/// Constant-time string comparison to prevent timing attacks.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}
