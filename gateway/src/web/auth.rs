//! Per-channel webhook authentication.
//!
//! The scheme is picked from the channel type (and, for email, the
//! configured provider). A channel with no secret configured is accepted
//! with a warning so that sandboxes keep working.

use axum::http::HeaderMap;
use tracing::warn;

use super::signature::{
    verify_body_signature, verify_mailgun_signature, verify_shared_secret, verify_twilio_signature, Prefix,
};
use crate::channel::{Channel, ChannelType};
use crate::config::Config;
use crate::error::GatewayError;
use crate::process::email::{EmailProvider, MailgunSignature};
use crate::process::sms::decode_form;
use crate::process::ParseContext;

const META_SIGNATURE_HEADERS: &[&str] = &["x-hub-signature-256"];
const RCS_SIGNATURE_HEADERS: &[&str] = &["x-signature", "x-hub-signature-256"];
const GENERIC_SIGNATURE_HEADERS: &[&str] = &[
    "x-webhook-signature",
    "x-razorpay-signature",
    "x-pagseguro-signature",
];

/// How a channel's webhooks prove where they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme<'a> {
    /// Hex HMAC-SHA256 of the body in the first present header.
    BodyHmac {
        secret: &'a str,
        headers: &'static [&'static str],
        prefix: Prefix,
    },
    /// A secret echoed verbatim in a header.
    SharedSecret { expected: &'a str, header: &'static str },
    Twilio { auth_token: &'a str },
    Mailgun { signing_key: &'a str },
    Unconfigured,
}

impl<'a> AuthScheme<'a> {
    pub fn for_channel(channel: &'a Channel) -> Self {
        let scheme = match channel.channel_type {
            ChannelType::WhatsappOfficial | ChannelType::Facebook | ChannelType::Instagram => channel
                .first_credential(&["app_secret", "webhook_secret"])
                .map(|secret| AuthScheme::BodyHmac {
                    secret,
                    headers: META_SIGNATURE_HEADERS,
                    prefix: Prefix::Required,
                }),
            ChannelType::Rcs => channel.credential("webhook_secret").map(|secret| AuthScheme::BodyHmac {
                secret,
                headers: RCS_SIGNATURE_HEADERS,
                prefix: Prefix::Optional,
            }),
            ChannelType::Telegram => channel
                .first_credential(&["webhook_secret", "secret_token"])
                .map(|expected| AuthScheme::SharedSecret {
                    expected,
                    header: "x-telegram-bot-api-secret-token",
                }),
            ChannelType::Sms => channel
                .credential("auth_token")
                .map(|auth_token| AuthScheme::Twilio { auth_token }),
            ChannelType::Email => email_scheme(channel),
            ChannelType::Generic => generic_scheme(channel),
        };
        scheme.unwrap_or(AuthScheme::Unconfigured)
    }
}

fn email_scheme(channel: &Channel) -> Option<AuthScheme<'_>> {
    let provider = channel.provider().and_then(|name| EmailProvider::from_name(&name));
    match provider {
        Some(EmailProvider::Mailgun) => channel
            .first_credential(&["signing_key", "webhook_signing_key", "webhook_secret"])
            .map(|signing_key| AuthScheme::Mailgun { signing_key }),
        Some(EmailProvider::Postmark) => channel
            .credential("webhook_secret")
            .map(|expected| AuthScheme::SharedSecret {
                expected,
                header: "authorization",
            }),
        _ => generic_scheme(channel),
    }
}

fn generic_scheme(channel: &Channel) -> Option<AuthScheme<'_>> {
    channel.credential("webhook_secret").map(|secret| AuthScheme::BodyHmac {
        secret,
        headers: GENERIC_SIGNATURE_HEADERS,
        prefix: Prefix::Optional,
    })
}

/// Authenticate one webhook request against its channel.
pub fn authenticate(
    config: &Config,
    channel: &Channel,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), GatewayError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let outcome = match AuthScheme::for_channel(channel) {
        AuthScheme::Unconfigured => {
            warn!(
                channel_id = %channel.id,
                channel_type = %channel.channel_type,
                "webhook_verification_skipped"
            );
            return Ok(());
        }
        AuthScheme::BodyHmac { secret, headers: names, prefix } => {
            match names.iter().find_map(|name| header(name)) {
                Some(provided) => verified(verify_body_signature(secret, body, provided, prefix)),
                None => Err("signature header missing"),
            }
        }
        AuthScheme::SharedSecret { expected, header: name } => match header(name) {
            Some(provided) => {
                let provided = provided.strip_prefix("Basic ").unwrap_or(provided);
                verified(verify_shared_secret(expected, provided))
            }
            None => Err("secret header missing"),
        },
        AuthScheme::Twilio { auth_token } => twilio(channel, auth_token, header("x-twilio-signature"), body),
        AuthScheme::Mailgun { signing_key } => {
            let ctx = ParseContext::new(channel, headers);
            match MailgunSignature::extract(&ctx, body) {
                Some(sig) => verified(verify_mailgun_signature(
                    signing_key,
                    &sig.timestamp,
                    &sig.token,
                    &sig.signature,
                    config.mailgun_signature_max_age,
                )),
                None => Err("signature fields missing"),
            }
        }
    };

    outcome.map_err(|reason| {
        warn!(
            channel_id = %channel.id,
            channel_type = %channel.channel_type,
            reason,
            "webhook_authentication_failed"
        );
        GatewayError::AuthenticationFailed(reason.to_string())
    })
}

fn verified(ok: bool) -> Result<(), &'static str> {
    if ok {
        Ok(())
    } else {
        Err("signature mismatch")
    }
}

/// Twilio signs the public URL it posted to, which the gateway cannot see
/// behind a proxy, so it must be configured per channel.
fn twilio(channel: &Channel, auth_token: &str, provided: Option<&str>, body: &[u8]) -> Result<(), &'static str> {
    let provided = provided.ok_or("signature header missing")?;
    let url = channel.config_value("webhook_url").ok_or("webhook_url not configured")?;
    let params = decode_form(body).map_err(|_| "form body unreadable")?;
    verified(verify_twilio_signature(auth_token, url, &params, provided))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use axum::http::HeaderValue;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use hmac::{Hmac, Mac};
    use sha1::Sha1;

    use super::*;
    use crate::web::signature::hmac_sha256_hex;

    fn config() -> Config {
        Config::default()
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_scheme_selection() {
        let meta = Channel::new("c", "t", ChannelType::Instagram).with_credential("webhook_secret", "w");
        assert!(matches!(
            AuthScheme::for_channel(&meta),
            AuthScheme::BodyHmac { secret: "w", prefix: Prefix::Required, .. }
        ));

        let mailgun = Channel::new("c", "t", ChannelType::Email)
            .with_config("provider", "Mailgun")
            .with_credential("signing_key", "k");
        assert_eq!(AuthScheme::for_channel(&mailgun), AuthScheme::Mailgun { signing_key: "k" });

        let ses = Channel::new("c", "t", ChannelType::Email)
            .with_config("provider", "ses")
            .with_credential("webhook_secret", "s");
        match AuthScheme::for_channel(&ses) {
            AuthScheme::BodyHmac { headers, .. } => assert_eq!(headers, GENERIC_SIGNATURE_HEADERS),
            other => panic!("unexpected scheme {:?}", other),
        }

        let bare = Channel::new("c", "t", ChannelType::Sms);
        assert_eq!(AuthScheme::for_channel(&bare), AuthScheme::Unconfigured);
    }

    #[test]
    fn test_unconfigured_channel_is_accepted() {
        let channel = Channel::new("c", "t", ChannelType::Generic);
        assert!(authenticate(&config(), &channel, &HeaderMap::new(), b"{}").is_ok());
    }

    #[test]
    fn test_meta_signature() {
        let channel = Channel::new("c", "t", ChannelType::WhatsappOfficial).with_credential("app_secret", "s3");
        let body = br#"{"object":"whatsapp_business_account","entry":[]}"#;
        let sig = format!("sha256={}", hmac_sha256_hex("s3", body).unwrap());

        let good = headers(&[("x-hub-signature-256", &sig)]);
        assert!(authenticate(&config(), &channel, &good, body).is_ok());

        let mut tampered = body.to_vec();
        tampered[3] = b'X';
        assert!(matches!(
            authenticate(&config(), &channel, &good, &tampered),
            Err(GatewayError::AuthenticationFailed(_))
        ));
        assert!(authenticate(&config(), &channel, &HeaderMap::new(), body).is_err());
    }

    #[test]
    fn test_rcs_accepts_either_header() {
        let channel = Channel::new("c", "t", ChannelType::Rcs).with_credential("webhook_secret", "k");
        let body = br#"{"type":"MESSAGE"}"#;
        let sig = hmac_sha256_hex("k", body).unwrap();

        let plain = headers(&[("x-signature", &sig)]);
        assert!(authenticate(&config(), &channel, &plain, body).is_ok());
        let hub = headers(&[("x-hub-signature-256", &format!("sha256={}", sig))]);
        assert!(authenticate(&config(), &channel, &hub, body).is_ok());
    }

    #[test]
    fn test_telegram_secret_token() {
        let channel = Channel::new("c", "t", ChannelType::Telegram).with_credential("webhook_secret", "tg-secret");
        let good = headers(&[("x-telegram-bot-api-secret-token", "tg-secret")]);
        let bad = headers(&[("x-telegram-bot-api-secret-token", "tg-secreT")]);
        assert!(authenticate(&config(), &channel, &good, b"{}").is_ok());
        assert!(authenticate(&config(), &channel, &bad, b"{}").is_err());
    }

    #[test]
    fn test_postmark_authorization_header() {
        let channel = Channel::new("c", "t", ChannelType::Email)
            .with_config("provider", "postmark")
            .with_credential("webhook_secret", "dXNlcjpwYXNz");
        let basic = headers(&[("authorization", "Basic dXNlcjpwYXNz")]);
        assert!(authenticate(&config(), &channel, &basic, b"{}").is_ok());
        let wrong = headers(&[("authorization", "Basic b3RoZXI6cGFzcw==")]);
        assert!(authenticate(&config(), &channel, &wrong, b"{}").is_err());
    }

    #[test]
    fn test_twilio_signature() {
        let url = "https://hooks.acme.test/webhooks/sms/ch-1";
        let channel = Channel::new("c", "t", ChannelType::Sms)
            .with_credential("auth_token", "tok")
            .with_config("webhook_url", url);
        let body = b"To=%2B15550001&From=%2B15550002&Body=hi+there&MessageSid=SM1";

        let params: BTreeMap<String, String> = url::form_urlencoded::parse(body).into_owned().collect();
        let mut mac = Hmac::<Sha1>::new_from_slice(b"tok").unwrap();
        mac.update(url.as_bytes());
        for (k, v) in &params {
            mac.update(k.as_bytes());
            mac.update(v.as_bytes());
        }
        let sig = STANDARD.encode(mac.finalize().into_bytes());

        let good = headers(&[("x-twilio-signature", &sig)]);
        assert!(authenticate(&config(), &channel, &good, body).is_ok());
        assert!(authenticate(&config(), &channel, &good, b"To=%2B15550001&Body=changed").is_err());

        let no_url = Channel::new("c", "t", ChannelType::Sms).with_credential("auth_token", "tok");
        assert!(authenticate(&config(), &no_url, &good, body).is_err());
    }

    #[test]
    fn test_mailgun_form_signature() {
        let channel = Channel::new("c", "t", ChannelType::Email)
            .with_config("provider", "mailgun")
            .with_credential("signing_key", "mg-key");
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let sig = hmac_sha256_hex("mg-key", format!("{}tok", timestamp).as_bytes()).unwrap();
        let body = format!(
            "recipient=support%40acme.test&sender=a%40x.test&timestamp={}&token=tok&signature={}",
            timestamp, sig
        );
        let form = headers(&[("content-type", "application/x-www-form-urlencoded")]);

        assert!(authenticate(&config(), &channel, &form, body.as_bytes()).is_ok());
        let forged = body.replace(&sig, &"0".repeat(64));
        assert!(authenticate(&config(), &channel, &form, forged.as_bytes()).is_err());
    }
}
