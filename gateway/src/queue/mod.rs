//! Message bus boundary.
//!
//! Canonical events are published to a RabbitMQ topic exchange:
//! - `messages.inbound.<channel_type>` → `inbound_messages` queue
//! - `messages.status.<channel_type>` → `status_updates` queue

pub mod publisher;
pub mod types;

pub use publisher::{EventPublisher, Publisher};
pub use types::{
    Attachment, ContentType, InboundMessage, Metadata, Status, StatusUpdate, INBOUND_QUEUE,
    STATUS_QUEUE,
};
