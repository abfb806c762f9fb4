//! Channel lookup by identifier.
//!
//! The registry is owned by [`crate::web::AppState`]; nothing here is global.
//! Channel management calls `upsert` when a channel is created or updated and
//! `remove` when it is deleted.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::Channel;

/// Read-side contract used by the webhook handlers.
#[async_trait]
pub trait ChannelRegistry: Send + Sync {
    /// Resolve a channel; `None` means no tenant context exists for the id.
    async fn resolve(&self, channel_id: &str) -> Option<Arc<Channel>>;
}

#[derive(Default)]
pub struct InMemoryChannelRegistry {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl InMemoryChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_channels(channels: impl IntoIterator<Item = Channel>) -> Self {
        let map = channels
            .into_iter()
            .map(|c| (c.id.clone(), Arc::new(c)))
            .collect();
        Self {
            channels: RwLock::new(map),
        }
    }

    /// Load a JSON array of channel records.
    pub async fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read channels file {}", path.display()))?;
        let channels: Vec<Channel> =
            serde_json::from_slice(&raw).context("Failed to parse channels file")?;

        info!(
            path = %path.display(),
            channel_count = channels.len(),
            "channel_registry_loaded"
        );

        Ok(Self::from_channels(channels))
    }

    pub async fn upsert(&self, channel: Channel) {
        let id = channel.id.clone();
        let previous = self
            .channels
            .write()
            .await
            .insert(id.clone(), Arc::new(channel));
        info!(channel_id = %id, replaced = previous.is_some(), "channel_registry_upsert");
    }

    pub async fn remove(&self, channel_id: &str) -> Option<Arc<Channel>> {
        let removed = self.channels.write().await.remove(channel_id);
        if removed.is_some() {
            info!(channel_id = %channel_id, "channel_registry_removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }
}

#[async_trait]
impl ChannelRegistry for InMemoryChannelRegistry {
    async fn resolve(&self, channel_id: &str) -> Option<Arc<Channel>> {
        let channel = self.channels.read().await.get(channel_id).cloned()?;
        if !channel.enabled {
            warn!(channel_id = %channel_id, "channel_disabled");
            return None;
        }
        Some(channel)
    }
}
