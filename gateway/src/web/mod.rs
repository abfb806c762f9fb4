//! HTTP surface of the gateway.
//!
//! - `GET /health`
//! - `GET /webhooks/{provider}/{channelId}`: subscription handshake
//! - `POST /webhooks/{provider}/{channelId}`: authenticate, parse, publish

pub mod auth;
pub mod handlers;
pub mod handshake;
pub mod signature;

pub use auth::{authenticate, AuthScheme};
pub use handlers::{health, receive_webhook, router, verify_webhook, AppState, HealthResponse, WebhookResponse};
pub use handshake::{verify_subscription, HubQuery};
