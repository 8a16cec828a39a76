//! Presence tracking over roster snapshots.
//!
//! Every sync replaces the live roster. Names of players whose key vanished
//! stay listed for a grace period, so a quick reconnect does not flicker the
//! player list; the online count only ever reflects the live roster.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use bingo_common::{Role, Roster};
use tokio::time::Instant;

/// Derived view of a channel's presence
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSummary {
    /// Live connections, counting duplicate tabs
    pub online_count: usize,
    /// Sorted, deduplicated player names, including recently departed ones
    pub player_names: Vec<String>,
    pub host_online: bool,
    /// Keys that appeared in this sync
    pub joined: Vec<String>,
    /// Keys that disappeared in this sync
    pub left: Vec<String>,
}

#[derive(Debug)]
struct Departed {
    name: String,
    at: Instant,
}

#[derive(Debug)]
pub struct PresenceTracker {
    grace: Duration,
    live: Roster,
    departed: BTreeMap<String, Departed>,
}

impl PresenceTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            live: Roster::new(),
            departed: BTreeMap::new(),
        }
    }

    /// Replace the roster with a fresh snapshot
    pub fn apply_sync(&mut self, roster: Roster, now: Instant) -> PresenceSummary {
        let joined: Vec<String> = roster
            .keys()
            .filter(|key| !self.live.contains_key(*key))
            .cloned()
            .collect();
        let left: Vec<String> = self
            .live
            .keys()
            .filter(|key| !roster.contains_key(*key))
            .cloned()
            .collect();

        for key in &left {
            if let Some(name) = player_name(&self.live[key]) {
                self.departed.insert(key.clone(), Departed { name, at: now });
            }
        }
        for key in roster.keys() {
            self.departed.remove(key);
        }
        self.live = roster;

        PresenceSummary {
            joined,
            left,
            ..self.summary(now)
        }
    }

    /// When the oldest lingering name falls out of the list
    pub fn next_expiry(&self) -> Option<Instant> {
        self.departed.values().map(|d| d.at + self.grace).min()
    }

    /// Current view, expiring departed names older than the grace period
    pub fn summary(&mut self, now: Instant) -> PresenceSummary {
        let grace = self.grace;
        self.departed
            .retain(|_, d| now.saturating_duration_since(d.at) < grace);

        let mut names: BTreeSet<String> = self.live.values().filter_map(|m| player_name(m)).collect();
        names.extend(self.departed.values().map(|d| d.name.clone()));

        PresenceSummary {
            online_count: self.live.values().map(Vec::len).sum(),
            player_names: names.into_iter().collect(),
            host_online: self
                .live
                .values()
                .flatten()
                .any(|m| m.role == Role::Host),
            joined: Vec::new(),
            left: Vec::new(),
        }
    }
}

fn player_name(metas: &[bingo_common::PresenceMeta]) -> Option<String> {
    metas
        .iter()
        .filter(|m| m.role == Role::Player)
        .find_map(|m| m.username.clone())
}
