//! Decide whether a message is addressed to the bot.

use crate::types::{BotIdentity, IncomingMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Addressed to us; the command text with the mention stripped.
    Command(String),
    /// Starts with our plain name rather than a proper mention.
    NameOnly,
    Ignore,
}

pub fn classify(msg: &IncomingMessage, identity: &BotIdentity, enable_dm: bool) -> Trigger {
    if msg.sender_id == identity.id {
        return Trigger::Ignore;
    }

    let text = msg.text.trim();
    if let Some(rest) = text.strip_prefix(&identity.mention()) {
        return Trigger::Command(strip_separators(rest));
    }
    if !identity.name.is_empty() && starts_with_ignore_case(text, &identity.name) {
        return Trigger::NameOnly;
    }
    if msg.is_direct && enable_dm {
        return Trigger::Command(strip_separators(text));
    }
    Trigger::Ignore
}

/// "please mention me" reply for [`Trigger::NameOnly`].
pub fn mention_hint(msg: &IncomingMessage, identity: &BotIdentity) -> String {
    let greeting = if msg.sender_id.is_empty() {
        "Are you talking to me?".to_string()
    } else {
        format!("<@{}> are you talking to me?", msg.sender_id)
    };
    format!("{greeting} Please mention me directly as {}.", identity.mention())
}

fn strip_separators(s: &str) -> String {
    s.trim_matches(|c: char| c == ':' || c.is_whitespace()).to_string()
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.get(..prefix.len())
        .map(|head| head.eq_ignore_ascii_case(prefix))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn me() -> BotIdentity {
        BotIdentity::new("UBOT", "shipwright")
    }

    fn msg(text: &str, direct: bool) -> IncomingMessage {
        IncomingMessage {
            text: text.into(),
            sender_id: "UALICE".into(),
            channel_id: if direct { "D1".into() } else { "C1".into() },
            thread_ts: None,
            is_direct: direct,
        }
    }

    #[test]
    fn mention_prefix_is_stripped() {
        assert_eq!(
            classify(&msg("<@UBOT>: run web api", false), &me(), false),
            Trigger::Command("run web api".into())
        );
    }

    #[test]
    fn bare_mention_is_empty_command() {
        assert_eq!(classify(&msg("<@UBOT>", false), &me(), false), Trigger::Command(String::new()));
    }

    #[test]
    fn plain_name_gets_a_hint() {
        assert_eq!(classify(&msg("Shipwright run web", false), &me(), false), Trigger::NameOnly);
        let hint = mention_hint(&msg("shipwright", false), &me());
        assert!(hint.contains("<@UALICE>"));
        assert!(hint.contains("<@UBOT>"));
    }

    #[test]
    fn own_messages_are_ignored() {
        let mut m = msg("<@UBOT> run", false);
        m.sender_id = "UBOT".into();
        assert_eq!(classify(&m, &me(), true), Trigger::Ignore);
    }

    #[test]
    fn direct_messages_need_dm_mode() {
        assert_eq!(classify(&msg("list", true), &me(), false), Trigger::Ignore);
        assert_eq!(classify(&msg("list", true), &me(), true), Trigger::Command("list".into()));
    }

    #[test]
    fn unrelated_chatter_is_ignored() {
        assert_eq!(classify(&msg("lunch?", false), &me(), true), Trigger::Ignore);
    }

    #[test]
    fn multibyte_text_does_not_panic() {
        assert_eq!(classify(&msg("é", false), &me(), false), Trigger::Ignore);
    }
}
