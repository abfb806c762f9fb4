//! End-to-end tests through the axum router with an in-memory bus.

use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use inlet::web::signature::hmac_sha256_hex;
use inlet::{
    router, AppState, Channel, ChannelType, Config, EventPublisher, InMemoryChannelRegistry, InboundMessage,
    StatusUpdate,
};

#[derive(Default)]
struct RecordingPublisher {
    inbound: Mutex<Vec<InboundMessage>>,
    statuses: Mutex<Vec<StatusUpdate>>,
    reject_all: bool,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish_inbound(&self, message: &InboundMessage) -> anyhow::Result<()> {
        if self.reject_all {
            bail!("broker unavailable");
        }
        self.inbound.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn publish_status_update(&self, update: &StatusUpdate) -> anyhow::Result<()> {
        if self.reject_all {
            bail!("broker unavailable");
        }
        self.statuses.lock().unwrap().push(update.clone());
        Ok(())
    }
}

fn channels() -> Vec<Channel> {
    vec![
        Channel::new("wa-1", "tenant-a", ChannelType::WhatsappOfficial)
            .with_credential("app_secret", "meta-secret")
            .with_credential("verify_token", "vt-123"),
        Channel::new("tg-1", "tenant-a", ChannelType::Telegram),
        Channel::new("sms-1", "tenant-b", ChannelType::Sms),
        Channel::new("gen-1", "tenant-b", ChannelType::Generic),
    ]
}

fn app_with(publisher: Arc<RecordingPublisher>, config: Config) -> Router {
    let registry = Arc::new(InMemoryChannelRegistry::from_channels(channels()));
    router(AppState::new(config, registry, publisher))
}

fn app(publisher: Arc<RecordingPublisher>) -> Router {
    app_with(publisher, Config::default())
}

async fn body_text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn whatsapp_body() -> String {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{"id": "WABA", "changes": [{"field": "messages", "value": {
            "messaging_product": "whatsapp",
            "metadata": {"display_phone_number": "1555", "phone_number_id": "PN"},
            "contacts": [{"wa_id": "5511999", "profile": {"name": "Ana"}}],
            "messages": [
                {"id": "wamid.1", "from": "5511999", "timestamp": "1700000000", "type": "text", "text": {"body": "hello"}},
                {"id": 12, "from": ["bad"], "type": 7},
                {"id": "wamid.2", "from": "5511999", "timestamp": "1700000001", "type": "text", "text": {"body": "again"}},
                {"id": "wamid.3", "from": "5511999", "timestamp": "1700000002", "type": "text", "text": {"body": "third"}}
            ]
        }}]}]
    })
    .to_string()
}

fn signed_whatsapp(body: &str) -> Request<Body> {
    let signature = format!("sha256={}", hmac_sha256_hex("meta-secret", body.as_bytes()).unwrap());
    Request::builder()
        .method("POST")
        .uri("/webhooks/whatsapp/wa-1")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-hub-signature-256", signature)
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let response = app(Arc::default())
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_handshake_echoes_challenge() {
    let uri = "/webhooks/whatsapp/wa-1?hub.mode=subscribe&hub.verify_token=vt-123&hub.challenge=1158201444";
    let response = app(Arc::default())
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
        "text/plain"
    );
    assert_eq!(body_text(response).await, "1158201444");
}

#[tokio::test]
async fn test_handshake_wrong_token_is_forbidden_without_echo() {
    let uri = "/webhooks/whatsapp/wa-1?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=1158201444";
    let response = app(Arc::default())
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let text = body_text(response).await;
    assert!(!text.contains("1158201444"));
    assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), json!({"error": "verification failed"}));
}

#[tokio::test]
async fn test_handshake_on_provider_without_one_is_405() {
    let response = app(Arc::default())
        .oneshot(Request::get("/webhooks/telegram/tg-1?hub.mode=subscribe").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_unknown_channel_and_mismatched_provider_are_404() {
    let publisher = Arc::new(RecordingPublisher::default());

    let missing = app(publisher.clone())
        .oneshot(post_json("/webhooks/telegram/nope", "{}"))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let mismatched = app(publisher.clone())
        .oneshot(post_json("/webhooks/instagram/tg-1", "{}"))
        .await
        .unwrap();
    assert_eq!(mismatched.status(), StatusCode::NOT_FOUND);

    let unknown_provider = app(publisher)
        .oneshot(post_json("/webhooks/fax/tg-1", "{}"))
        .await
        .unwrap();
    assert_eq!(unknown_provider.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_valid_items_published_despite_malformed_sibling() {
    let publisher = Arc::new(RecordingPublisher::default());
    let response = app(publisher.clone())
        .oneshot(signed_whatsapp(&whatsapp_body()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"status": "ok"}));

    let inbound = publisher.inbound.lock().unwrap();
    let ids: Vec<&str> = inbound.iter().map(|m| m.external_id.as_str()).collect();
    assert_eq!(ids, vec!["wamid.1", "wamid.2", "wamid.3"]);
    assert_eq!(inbound[0].content, "hello");
    assert_eq!(inbound[0].tenant_id, "tenant-a");
    assert_eq!(inbound[0].channel_id, "wa-1");
}

#[tokio::test]
async fn test_tampered_signature_is_401() {
    let publisher = Arc::new(RecordingPublisher::default());
    let body = whatsapp_body();
    let mut request = signed_whatsapp(&body);
    *request.body_mut() = Body::from(body.replace("hello", "hellO"));

    let response = app(publisher.clone()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await, json!({"error": "unauthorized"}));
    assert!(publisher.inbound.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_envelope_is_400() {
    let response = app(Arc::default())
        .oneshot(post_json("/webhooks/generic/gen-1", "{not json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_sms_replies_with_empty_twiml() {
    let publisher = Arc::new(RecordingPublisher::default());
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/twilio/sms-1")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(
            "MessageSid=SM1&SmsStatus=received&From=%2B15550002&To=%2B15550001&Body=hi&NumMedia=0",
        ))
        .unwrap();

    let response = app(publisher.clone()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE].to_str().unwrap(), "text/xml");
    assert_eq!(
        body_text(response).await,
        r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#
    );
    assert_eq!(publisher.inbound.lock().unwrap()[0].content, "hi");
}

#[tokio::test]
async fn test_status_callback_published() {
    let publisher = Arc::new(RecordingPublisher::default());
    let body = json!({"external_id": "out-9", "status": "delivered"}).to_string();
    let response = app(publisher.clone())
        .oneshot(post_json("/webhooks/generic/gen-1", &body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(publisher.statuses.lock().unwrap()[0].external_id, "out-9");
}

#[tokio::test]
async fn test_callback_without_events_is_ignored() {
    let body = json!({"update_id": 5, "poll": {"id": "p"}}).to_string();
    let response = app(Arc::default())
        .oneshot(post_json("/webhooks/telegram/tg-1", &body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"status": "ignored"}));
}

#[tokio::test]
async fn test_all_publishes_failing_is_500() {
    let publisher = Arc::new(RecordingPublisher {
        reject_all: true,
        ..Default::default()
    });
    let response = app(publisher)
        .oneshot(signed_whatsapp(&whatsapp_body()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_oversized_body_is_413() {
    let config = Config {
        max_body_bytes: 64,
        ..Config::default()
    };
    let body = json!({"content": "x".repeat(200)}).to_string();
    let response = app_with(Arc::default(), config)
        .oneshot(post_json("/webhooks/generic/gen-1", &body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
