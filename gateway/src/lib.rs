//! Inlet - multi-tenant webhook ingestion gateway.
//!
//! Messaging providers (WhatsApp, Telegram, Twilio SMS, Facebook,
//! Instagram, RCS aggregators, email services and generic JSON senders)
//! post callbacks to one HTTP surface. Each callback is authenticated
//! against its channel, parsed into canonical events and published to
//! RabbitMQ.
//!
//! ## Architecture
//!
//! ```text
//! Provider → /webhooks/{provider}/{channelId} → auth → Parser → EventPublisher → RabbitMQ
//! ```

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod process;
pub mod queue;
pub mod web;

// Re-export commonly used types
pub use channel::{Channel, ChannelRegistry, ChannelType, InMemoryChannelRegistry};
pub use config::Config;
pub use dispatch::{publish_batch, DispatchReport};
pub use error::GatewayError;
pub use process::{parser_for, ParseContext, ParsedBatch, Parser};
pub use queue::{EventPublisher, InboundMessage, Publisher, StatusUpdate};
pub use web::{router, AppState};
