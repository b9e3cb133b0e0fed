use serde::{Deserialize, Serialize};

// ── Transport / Messaging ────────────────────────────────────────────────

/// Who the bot is on the chat service, as reported on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub id: String,
    pub name: String,
}

impl BotIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// The literal text a user types to address the bot.
    pub fn mention(&self) -> String {
        format!("<@{}>", self.id)
    }

    /// Use `fallback` as the display name when Slack didn't report one, so
    /// plain-name addressing still gets a hint.
    pub fn or_named(mut self, fallback: &str) -> Self {
        if self.name.trim().is_empty() {
            self.name = fallback.to_string();
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Public channel.
    Channel,
    /// Private channel / group.
    Group,
    /// One-to-one direct message.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    pub kind: ChannelKind,
}

impl ChannelInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Joined,
    Left,
}

/// A chat message as delivered by the transport. `text` still carries the
/// bot mention; trigger detection strips it.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub text: String,
    pub sender_id: String,
    pub channel_id: String,
    /// Thread the message belongs to, so replies land in the same thread.
    pub thread_ts: Option<String>,
    pub is_direct: bool,
}

/// Everything the transport can report. Closed on purpose: adding a variant
/// forces every consumer to decide what to do with it.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Connected(BotIdentity),
    Message(IncomingMessage),
    MembershipChanged {
        channel: ChannelInfo,
        change: Membership,
    },
    Disconnected {
        intentional: bool,
    },
    ConnectionError(String),
    AuthError(String),
}

// ── Commands ─────────────────────────────────────────────────────────────

/// A tokenized command: first word is the verb, the rest are arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: String,
    pub args: Vec<String>,
}

impl Command {
    /// Split on whitespace, dropping empty tokens. `None` for blank text.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace().map(str::to_string);
        let verb = parts.next()?;
        Some(Self {
            verb,
            args: parts.collect(),
        })
    }
}

// ── Container runtime ────────────────────────────────────────────────────

/// Credentials for the image registry. All fields empty = anonymous pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub email: String,
    pub server_address: String,
}

impl RegistryAuth {
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
    }
}

/// What a finished container run produced.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub exit_code: i64,
    /// stdout followed by stderr.
    pub output: Vec<u8>,
}
