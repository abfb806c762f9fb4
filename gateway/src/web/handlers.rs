//! Webhook endpoint handlers.
//!
//! A POST runs the whole pipeline inline:
//! 1. Resolve the channel from the path
//! 2. Read the body under the size cap
//! 3. Authenticate
//! 4. Parse into canonical events
//! 5. Publish, bounded by the request deadline
//!
//! Providers retry on non-2xx, so a 200 means every event that could be
//! parsed was offered to the bus and at least one (if any) was accepted.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::auth::authenticate;
use super::handshake::{verify_subscription, HubQuery};
use crate::channel::{Channel, ChannelRegistry, ChannelType};
use crate::dispatch::publish_batch;
use crate::error::GatewayError;
use crate::process::sms::EMPTY_TWIML;
use crate::process::{parser_for, ParseContext};
use crate::queue::EventPublisher;
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<dyn ChannelRegistry>,
    pub publisher: Arc<dyn EventPublisher>,
}

impl AppState {
    pub fn new(config: Config, registry: Arc<dyn ChannelRegistry>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            publisher,
        }
    }
}

/// All gateway routes, with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/webhooks/:provider/:channel_id",
            get(verify_webhook).post(receive_webhook),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Channel Resolution
// =============================================================================

/// The channel must exist, be enabled, and match the provider path segment.
async fn resolve_channel(
    state: &AppState,
    provider: &str,
    channel_id: &str,
) -> Result<Arc<Channel>, GatewayError> {
    let not_found = || GatewayError::ChannelNotFound(channel_id.to_string());

    let Some(channel_type) = ChannelType::from_path_segment(provider) else {
        info!(provider = %provider, channel_id = %channel_id, "webhook_unknown_provider");
        return Err(not_found());
    };

    match state.registry.resolve(channel_id).await {
        Some(channel) if channel.channel_type == channel_type => Ok(channel),
        Some(channel) => {
            info!(
                provider = %provider,
                channel_id = %channel_id,
                channel_type = %channel.channel_type,
                "webhook_provider_mismatch"
            );
            Err(not_found())
        }
        None => {
            info!(provider = %provider, channel_id = %channel_id, "webhook_channel_not_found");
            Err(not_found())
        }
    }
}

// =============================================================================
// Subscription Handshake
// =============================================================================

/// `GET /webhooks/{provider}/{channelId}`.
pub async fn verify_webhook(
    State(state): State<AppState>,
    Path((provider, channel_id)): Path<(String, String)>,
    Query(query): Query<HubQuery>,
) -> Result<Response, GatewayError> {
    let channel = resolve_channel(&state, &provider, &channel_id).await?;
    let challenge = verify_subscription(&channel, query)?;
    Ok(([(header::CONTENT_TYPE, "text/plain")], challenge).into_response())
}

// =============================================================================
// Webhook Ingestion
// =============================================================================

/// Webhook response.
#[derive(Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
}

/// `POST /webhooks/{provider}/{channelId}`.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path((provider, channel_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, GatewayError> {
    let deadline = Instant::now() + state.config.request_timeout();
    let channel = resolve_channel(&state, &provider, &channel_id).await?;

    let limit = state.config.max_body_bytes;
    let declared_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_length.is_some_and(|len| len > limit) {
        return Err(GatewayError::PayloadTooLarge);
    }
    // A read error here is almost always the cap being hit mid-stream.
    let body = to_bytes(body, limit)
        .await
        .map_err(|_| GatewayError::PayloadTooLarge)?;

    info!(
        channel_id = %channel.id,
        tenant_id = %channel.tenant_id,
        channel_type = %channel.channel_type,
        body_length = body.len(),
        "webhook_received"
    );

    authenticate(&state.config, &channel, &headers, &body)?;

    let ctx = ParseContext::new(&channel, &headers);
    let batch = parser_for(channel.channel_type).parse(&ctx, &body).map_err(|e| {
        info!(channel_id = %channel.id, error = %e, "webhook_envelope_rejected");
        e
    })?;

    let report = publish_batch(state.publisher.as_ref(), &channel, &batch, deadline).await;
    if report.all_failed() {
        error!(
            channel_id = %channel.id,
            failed = report.failed,
            "webhook_publish_failed"
        );
        return Err(GatewayError::PublishFailed(format!(
            "{} events failed to publish",
            report.failed
        )));
    }

    info!(
        channel_id = %channel.id,
        ack = batch.ack.as_str(),
        published = report.published,
        failed = report.failed,
        item_failures = batch.failures.len(),
        "webhook_processed"
    );

    if channel.channel_type == ChannelType::Sms {
        return Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/xml")],
            EMPTY_TWIML,
        )
            .into_response());
    }
    Ok(Json(WebhookResponse {
        status: batch.ack.as_str(),
    })
    .into_response())
}
