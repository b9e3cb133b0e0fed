use std::collections::HashMap;

use crate::types::{ChannelInfo, ChannelKind};

/// Channels the bot currently belongs to, keyed by channel ID.
///
/// Read on every message for authorization, written on join/leave events;
/// callers keep it behind a `RwLock`.
#[derive(Debug, Clone, Default)]
pub struct Channels {
    by_id: HashMap<String, ChannelInfo>,
}

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, channel: ChannelInfo) {
        self.by_id.insert(channel.id.clone(), channel);
    }

    pub fn remove(&mut self, id: &str) -> Option<ChannelInfo> {
        self.by_id.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&ChannelInfo> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Group-visible channels (DMs excluded), sorted for stable fan-out order.
    pub fn broadcast_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .by_id
            .values()
            .filter(|c| c.kind != ChannelKind::Direct)
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl FromIterator<ChannelInfo> for Channels {
    fn from_iter<I: IntoIterator<Item = ChannelInfo>>(iter: I) -> Self {
        let mut channels = Self::new();
        for c in iter {
            channels.add(c);
        }
        channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_skips_direct_messages() {
        let channels: Channels = [
            ChannelInfo::new("C2", "ops", ChannelKind::Channel),
            ChannelInfo::new("D1", "", ChannelKind::Direct),
            ChannelInfo::new("G1", "infra", ChannelKind::Group),
        ]
        .into_iter()
        .collect();
        assert_eq!(channels.broadcast_ids(), vec!["C2", "G1"]);
    }

    #[test]
    fn add_and_remove() {
        let mut channels = Channels::new();
        channels.add(ChannelInfo::new("C1", "ops", ChannelKind::Channel));
        assert!(channels.contains("C1"));
        assert_eq!(channels.remove("C1").map(|c| c.name), Some("ops".into()));
        assert!(!channels.contains("C1"));
    }
}
