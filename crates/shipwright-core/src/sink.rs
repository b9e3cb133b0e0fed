//! Where replies go.
//!
//! Handlers talk to a [`ConversationSink`] and never learn whether they are
//! answering a message, posting to one channel, or announcing to all of them.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::channels::Channels;

/// Outbound half of the chat transport.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn post_message(&self, channel_id: &str, text: &str, thread_ts: Option<&str>) -> Result<()>;
}

#[async_trait]
pub trait ConversationSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}

/// Answer in the channel (and thread) a message arrived on.
pub struct Reply {
    api: Arc<dyn ChatApi>,
    channel_id: String,
    thread_ts: Option<String>,
}

impl Reply {
    pub fn new(api: Arc<dyn ChatApi>, channel_id: impl Into<String>, thread_ts: Option<String>) -> Self {
        Self {
            api,
            channel_id: channel_id.into(),
            thread_ts,
        }
    }
}

#[async_trait]
impl ConversationSink for Reply {
    async fn send(&self, text: &str) -> Result<()> {
        self.api
            .post_message(&self.channel_id, text, self.thread_ts.as_deref())
            .await
    }
}

/// Post to one fixed channel.
pub struct ChannelSink {
    api: Arc<dyn ChatApi>,
    channel_id: String,
}

impl ChannelSink {
    pub fn new(api: Arc<dyn ChatApi>, channel_id: impl Into<String>) -> Self {
        Self {
            api,
            channel_id: channel_id.into(),
        }
    }
}

#[async_trait]
impl ConversationSink for ChannelSink {
    async fn send(&self, text: &str) -> Result<()> {
        self.api.post_message(&self.channel_id, text, None).await
    }
}

/// Fan out to every group channel the bot belongs to at the time of sending.
pub struct Broadcast {
    api: Arc<dyn ChatApi>,
    channels: Arc<RwLock<Channels>>,
}

impl Broadcast {
    pub fn new(api: Arc<dyn ChatApi>, channels: Arc<RwLock<Channels>>) -> Self {
        Self { api, channels }
    }
}

#[async_trait]
impl ConversationSink for Broadcast {
    /// Tries every channel; reports the first failure after the fan-out.
    async fn send(&self, text: &str) -> Result<()> {
        let ids = self.channels.read().await.broadcast_ids();
        let mut first_err = None;
        for id in ids {
            if let Err(e) = self.api.post_message(&id, text, None).await {
                warn!(channel = %id, "broadcast failed: {e:#}");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Send and log on failure. Replies are best effort: a lost message must not
/// abort the work that produced it.
pub async fn notify(sink: &dyn ConversationSink, text: &str) {
    if let Err(e) = sink.send(text).await {
        warn!("failed to send message: {e:#}");
    }
}
