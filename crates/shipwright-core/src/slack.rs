//! Slack Web API transport.
//!
//! Inbound traffic is polled: channel membership via `users.conversations`,
//! messages via `conversations.history`. Everything is turned into
//! [`ChatEvent`]s on an mpsc channel; outbound messages go through
//! `chat.postMessage`.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    sink::ChatApi,
    types::{BotIdentity, ChannelInfo, ChannelKind, ChatEvent, IncomingMessage, Membership},
};

pub const API_BASE: &str = "https://slack.com/api";

/// Membership is re-read every this many polls.
const MEMBERSHIP_EVERY: u32 = 15;
const PAGE_LIMIT: &str = "200";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Wait used when Slack rate-limits without saying for how long.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10);

const AUTH_ERRORS: [&str; 6] = [
    "invalid_auth",
    "not_authed",
    "account_inactive",
    "token_revoked",
    "token_expired",
    "missing_scope",
];

#[derive(Debug, Error)]
pub enum SlackError {
    #[error("slack rejected the credentials: {0}")]
    Auth(String),
    #[error("slack request failed: {0}")]
    Transient(#[from] reqwest::Error),
    #[error("slack rate limit hit, retry after {0:?}")]
    RateLimited(Duration),
    #[error("slack api error: {0}")]
    Api(String),
}

impl SlackError {
    pub fn from_code(code: &str) -> Self {
        if AUTH_ERRORS.contains(&code) {
            Self::Auth(code.to_string())
        } else if code == "ratelimited" {
            Self::RateLimited(DEFAULT_RETRY_AFTER)
        } else {
            Self::Api(code.to_string())
        }
    }

    /// Worth retrying: network trouble and rate limiting.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) | Self::RateLimited(_) => true,
            Self::Api(code) => code == "internal_error",
            Self::Auth(_) => false,
        }
    }
}

/// Seconds from a `Retry-After` header, falling back to [`DEFAULT_RETRY_AFTER`].
pub fn retry_after(header: Option<&str>) -> Duration {
    header
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs)
}

/// Unwrap a Web API envelope: `{"ok": true, ...}` or `{"ok": false, "error": code}`.
pub fn check_ok(resp: Value) -> Result<Value, SlackError> {
    if resp["ok"].as_bool() == Some(true) {
        Ok(resp)
    } else {
        let code = resp["error"].as_str().unwrap_or("unknown_error");
        Err(SlackError::from_code(code))
    }
}

pub struct Slack {
    token: String,
    base_url: String,
    client: Client,
}

impl Slack {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            base_url: API_BASE.to_string(),
            client: Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn call(&self, method: &str, params: &[(&str, &str)]) -> Result<Value, SlackError> {
        let resp = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .bearer_auth(&self.token)
            .form(params)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            let header = resp.headers().get(RETRY_AFTER).and_then(|v| v.to_str().ok());
            return Err(SlackError::RateLimited(retry_after(header)));
        }
        check_ok(resp.json().await?)
    }

    /// Who the token belongs to.
    pub async fn auth_test(&self) -> Result<BotIdentity, SlackError> {
        let resp = self.call("auth.test", &[]).await?;
        let id = resp["user_id"].as_str().unwrap_or_default();
        let name = resp["user"].as_str().unwrap_or_default();
        info!(bot = name, team = resp["team"].as_str().unwrap_or(""), "authenticated");
        Ok(BotIdentity::new(id, name))
    }

    /// Every conversation the bot is a member of, following pagination.
    pub async fn list_channels(&self, include_dm: bool) -> Result<Vec<ChannelInfo>, SlackError> {
        let types = if include_dm {
            "public_channel,private_channel,im"
        } else {
            "public_channel,private_channel"
        };
        let mut channels = Vec::new();
        let mut cursor = String::new();
        loop {
            let mut params = vec![
                ("types", types),
                ("exclude_archived", "true"),
                ("limit", PAGE_LIMIT),
            ];
            if !cursor.is_empty() {
                params.push(("cursor", cursor.as_str()));
            }
            let resp = self.call("users.conversations", &params).await?;
            if let Some(list) = resp["channels"].as_array() {
                channels.extend(list.iter().filter_map(parse_channel));
            }
            match resp["response_metadata"]["next_cursor"].as_str() {
                Some(next) if !next.is_empty() => cursor = next.to_string(),
                _ => break,
            }
        }
        Ok(channels)
    }

    /// Messages newer than `oldest`, oldest first. Pages are followed
    /// while Slack reports `has_more`.
    pub async fn history(&self, channel_id: &str, oldest: &str) -> Result<Vec<Value>, SlackError> {
        let mut messages = Vec::new();
        let mut cursor = String::new();
        loop {
            let mut params = vec![
                ("channel", channel_id),
                ("oldest", oldest),
                ("limit", PAGE_LIMIT),
            ];
            if !cursor.is_empty() {
                params.push(("cursor", cursor.as_str()));
            }
            let resp = self.call("conversations.history", &params).await?;
            if let Some(page) = resp["messages"].as_array() {
                messages.extend(page.iter().cloned());
            }
            if resp["has_more"].as_bool() != Some(true) {
                break;
            }
            match resp["response_metadata"]["next_cursor"].as_str() {
                Some(next) if !next.is_empty() => cursor = next.to_string(),
                _ => break,
            }
        }
        // Newest first across pages.
        messages.reverse();
        Ok(messages)
    }

    /// Poll Slack until `cancel` fires, feeding events into `tx`.
    ///
    /// `Connected` is always the first event; `Disconnected { intentional:
    /// true }` the last one after cancellation. An auth failure ends the
    /// loop after an `AuthError` event. When rate-limited the rest of the
    /// cycle is skipped and polling resumes after the requested wait.
    pub fn run_events(
        self: Arc<Self>,
        identity: BotIdentity,
        channels: Vec<ChannelInfo>,
        include_dm: bool,
        poll_interval: Duration,
        tx: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if tx.send(ChatEvent::Connected(identity)).await.is_err() {
                return;
            }
            let mut known = channels;
            let start = now_ts();
            let mut cursors: HashMap<String, String> =
                known.iter().map(|c| (c.id.clone(), start.clone())).collect();
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut polls: u32 = 0;

            'poll: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(ChatEvent::Disconnected { intentional: true }).await;
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                polls = polls.wrapping_add(1);

                if polls % MEMBERSHIP_EVERY == 0 {
                    match self.list_channels(include_dm).await {
                        Ok(current) => {
                            for (channel, change) in diff_membership(&known, &current) {
                                match change {
                                    Membership::Joined => {
                                        cursors.insert(channel.id.clone(), now_ts());
                                    }
                                    Membership::Left => {
                                        cursors.remove(&channel.id);
                                    }
                                }
                                if tx.send(ChatEvent::MembershipChanged { channel, change }).await.is_err() {
                                    return;
                                }
                            }
                            known = current;
                        }
                        Err(SlackError::Auth(e)) => {
                            let _ = tx.send(ChatEvent::AuthError(e)).await;
                            return;
                        }
                        Err(SlackError::RateLimited(wait)) => {
                            warn!(?wait, "rate limited listing channels");
                            if !pause(&cancel, wait).await {
                                let _ = tx.send(ChatEvent::Disconnected { intentional: true }).await;
                                return;
                            }
                            ticker.reset();
                            continue 'poll;
                        }
                        Err(e) => {
                            let _ = tx.send(ChatEvent::ConnectionError(e.to_string())).await;
                        }
                    }
                }

                for channel in &known {
                    let oldest = cursors.get(&channel.id).cloned().unwrap_or_else(now_ts);
                    let messages = match self.history(&channel.id, &oldest).await {
                        Ok(m) => m,
                        Err(SlackError::Auth(e)) => {
                            let _ = tx.send(ChatEvent::AuthError(e)).await;
                            return;
                        }
                        Err(SlackError::RateLimited(wait)) => {
                            warn!(channel = %channel.id, ?wait, "rate limited polling history");
                            if !pause(&cancel, wait).await {
                                let _ = tx.send(ChatEvent::Disconnected { intentional: true }).await;
                                return;
                            }
                            ticker.reset();
                            continue 'poll;
                        }
                        Err(e) => {
                            debug!(channel = %channel.id, "history poll failed: {e}");
                            let _ = tx.send(ChatEvent::ConnectionError(e.to_string())).await;
                            continue;
                        }
                    };
                    for raw in &messages {
                        if let Some(ts) = raw["ts"].as_str() {
                            cursors.insert(channel.id.clone(), ts.to_string());
                        }
                        if let Some(msg) = parse_history_message(raw, channel) {
                            if tx.send(ChatEvent::Message(msg)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ChatApi for Slack {
    async fn post_message(&self, channel_id: &str, text: &str, thread_ts: Option<&str>) -> Result<()> {
        let mut params = vec![("channel", channel_id), ("text", text)];
        if let Some(ts) = thread_ts {
            params.push(("thread_ts", ts));
        }
        self.call("chat.postMessage", &params).await?;
        Ok(())
    }
}

/// List channels, retrying transient failures with a linearly growing
/// delay (`step` per failed attempt, or longer if Slack asks for it).
/// Auth errors are returned at once.
pub async fn list_channels_with_retry(
    slack: &Slack,
    include_dm: bool,
    attempts: u32,
    step: Duration,
) -> Result<Vec<ChannelInfo>, SlackError> {
    let mut attempt = 1;
    loop {
        match slack.list_channels(include_dm).await {
            Ok(channels) => return Ok(channels),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(attempt, attempts, "listing channels failed: {e}");
                let mut delay = step * attempt;
                if let SlackError::RateLimited(wait) = &e {
                    delay = delay.max(*wait);
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sleep for `wait` unless cancelled first. Returns false on cancellation.
async fn pause(cancel: &CancellationToken, wait: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

/// Slack-style timestamp for the current instant.
fn now_ts() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:06}", now.as_secs(), now.subsec_micros())
}

pub fn parse_channel(v: &Value) -> Option<ChannelInfo> {
    let id = v["id"].as_str()?;
    if v["is_im"].as_bool() == Some(true) {
        let user = v["user"].as_str().unwrap_or(id);
        return Some(ChannelInfo::new(id, user, ChannelKind::Direct));
    }
    let name = v["name"].as_str().unwrap_or(id);
    let kind = if v["is_private"].as_bool() == Some(true) || v["is_group"].as_bool() == Some(true) {
        ChannelKind::Group
    } else {
        ChannelKind::Channel
    };
    Some(ChannelInfo::new(id, name, kind))
}

/// A plain user message. Joins, edits, bot posts and other subtypes are
/// dropped.
pub fn parse_history_message(v: &Value, channel: &ChannelInfo) -> Option<IncomingMessage> {
    if v.get("subtype").is_some() || v.get("bot_id").is_some() {
        return None;
    }
    let text = v["text"].as_str()?;
    let sender = v["user"].as_str()?;
    Some(IncomingMessage {
        text: text.to_string(),
        sender_id: sender.to_string(),
        channel_id: channel.id.clone(),
        thread_ts: v["thread_ts"].as_str().map(str::to_string),
        is_direct: channel.kind == ChannelKind::Direct,
    })
}

/// Channels that appeared in or vanished from `current` relative to `known`.
pub fn diff_membership(known: &[ChannelInfo], current: &[ChannelInfo]) -> Vec<(ChannelInfo, Membership)> {
    let mut changes: Vec<(ChannelInfo, Membership)> = current
        .iter()
        .filter(|c| !known.iter().any(|k| k.id == c.id))
        .map(|c| (c.clone(), Membership::Joined))
        .collect();
    changes.extend(
        known
            .iter()
            .filter(|k| !current.iter().any(|c| c.id == k.id))
            .map(|k| (k.clone(), Membership::Left)),
    );
    changes
}
