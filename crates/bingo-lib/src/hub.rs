// ============================
// bingo-lib/src/hub.rs
// ============================
//! In-process broadcast + presence relay.
//!
//! A channel is a set of members. Each member has a bounded outbound queue;
//! frames are pushed with `try_send`, so a slow member loses frames instead of
//! stalling the channel. Broadcasts never echo back to their sender.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bingo_common::{ClientFrame, PresenceMeta, RoomEvent, Roster, ServerFrame};
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::metrics::{HUB_BROADCAST, HUB_CHANNELS, HUB_DROPPED};
use crate::validation;

pub type MemberId = u64;

struct Member {
    presence_key: String,
    meta: Option<PresenceMeta>,
    tx: mpsc::Sender<ServerFrame>,
}

#[derive(Default)]
struct Channel {
    members: HashMap<MemberId, Member>,
}

impl Channel {
    fn roster(&self) -> Roster {
        let mut roster = Roster::new();
        for member in self.members.values() {
            if let Some(meta) = &member.meta {
                roster
                    .entry(member.presence_key.clone())
                    .or_default()
                    .push(meta.clone());
            }
        }
        for metas in roster.values_mut() {
            metas.sort_by_key(|m| m.online_at);
        }
        roster
    }

    fn push_presence(&self) {
        let roster = self.roster();
        for member in self.members.values() {
            deliver(&member.tx, ServerFrame::PresenceSync {
                roster: roster.clone(),
            });
        }
    }
}

fn deliver(tx: &mpsc::Sender<ServerFrame>, frame: ServerFrame) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(_) => {
            counter!(HUB_DROPPED).increment(1);
            false
        },
    }
}

/// Registry of live channels
pub struct ChannelHub {
    channels: DashMap<String, Channel>,
    next_member: AtomicU64,
    capacity: usize,
}

impl ChannelHub {
    /// `capacity` bounds each member's outbound queue
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            next_member: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Open a connection; frames for it arrive on the returned receiver
    pub fn connect(self: &Arc<Self>) -> (HubConnection, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let member = self.next_member.fetch_add(1, Ordering::Relaxed);
        let conn = HubConnection {
            hub: Arc::clone(self),
            member,
            tx,
            channel: None,
        };
        (conn, rx)
    }

    fn join(&self, channel: &str, member: MemberId, presence_key: &str, tx: mpsc::Sender<ServerFrame>) {
        let mut entry = self.channels.entry(channel.to_string()).or_default();
        entry.members.insert(member, Member {
            presence_key: presence_key.to_string(),
            meta: None,
            tx: tx.clone(),
        });
        drop(entry);
        gauge!(HUB_CHANNELS).set(self.channels.len() as f64);

        deliver(&tx, ServerFrame::Subscribed {
            channel: channel.to_string(),
        });
        debug!(channel, member, presence_key, "member joined");
    }

    fn track(&self, channel: &str, member: MemberId, meta: PresenceMeta) {
        if let Some(mut entry) = self.channels.get_mut(channel) {
            if let Some(m) = entry.members.get_mut(&member) {
                m.meta = Some(meta);
            }
            entry.push_presence();
        }
    }

    /// Relay to every member but `from`. Returns how many accepted the frame.
    fn broadcast(&self, channel: &str, from: MemberId, event: RoomEvent) -> usize {
        let Some(entry) = self.channels.get(channel) else {
            return 0;
        };
        counter!(HUB_BROADCAST).increment(1);
        entry
            .members
            .iter()
            .filter(|(id, _)| **id != from)
            .filter(|(_, m)| {
                deliver(&m.tx, ServerFrame::Broadcast {
                    event: event.clone(),
                })
            })
            .count()
    }

    fn leave(&self, channel: &str, member: MemberId) {
        let mut emptied = false;
        if let Some(mut entry) = self.channels.get_mut(channel) {
            if let Some(removed) = entry.members.remove(&member) {
                debug!(channel, member, presence_key = %removed.presence_key, "member left");
                if removed.meta.is_some() {
                    entry.push_presence();
                }
            }
            emptied = entry.members.is_empty();
        }
        if emptied {
            self.channels.remove_if(channel, |_, c| c.members.is_empty());
            info!(channel, "channel closed");
        }
        gauge!(HUB_CHANNELS).set(self.channels.len() as f64);
    }

    /// Presence snapshot of a channel
    pub fn roster(&self, channel: &str) -> Roster {
        self.channels
            .get(channel)
            .map(|c| c.roster())
            .unwrap_or_default()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn member_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|c| c.members.len()).unwrap_or(0)
    }
}

/// One client's link into the hub. Leaves its channel when dropped.
pub struct HubConnection {
    hub: Arc<ChannelHub>,
    member: MemberId,
    tx: mpsc::Sender<ServerFrame>,
    channel: Option<String>,
}

impl HubConnection {
    pub fn member_id(&self) -> MemberId {
        self.member
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// Apply one client frame
    pub fn handle(&mut self, frame: ClientFrame) -> Result<(), AppError> {
        match frame {
            ClientFrame::Join {
                channel,
                presence_key,
            } => {
                validation::validate_channel(&channel)?;
                validation::validate_presence_key(&presence_key)?;
                self.leave();
                self.hub.join(&channel, self.member, &presence_key, self.tx.clone());
                self.channel = Some(channel);
                Ok(())
            },
            ClientFrame::Track { meta } => {
                let channel = self.joined()?;
                self.hub.track(channel, self.member, meta);
                Ok(())
            },
            ClientFrame::Broadcast { event } => {
                let channel = self.joined()?;
                let delivered = self.hub.broadcast(channel, self.member, event);
                debug!(channel, delivered, "relayed broadcast");
                Ok(())
            },
            ClientFrame::Leave => {
                self.leave();
                Ok(())
            },
        }
    }

    /// Apply a frame, reporting failures back to the client as an error frame
    pub fn process(&mut self, frame: ClientFrame) {
        if let Err(e) = self.handle(frame) {
            warn!(member = self.member, error = %e, "rejected client frame");
            self.reply_error(&e);
        }
    }

    pub fn reply_error(&self, error: &AppError) {
        deliver(&self.tx, ServerFrame::Error {
            code: error.error_code().to_string(),
            message: error.to_string(),
        });
    }

    fn joined(&self) -> Result<&str, AppError> {
        self.channel
            .as_deref()
            .ok_or_else(|| AppError::Channel("not subscribed to a channel".to_string()))
    }

    fn leave(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.hub.leave(&channel, self.member);
        }
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bingo_common::{Role, RoomState};

    const CHANNEL: &str = "bingo:room-abc123";

    fn join(conn: &mut HubConnection, key: &str) {
        conn.handle(ClientFrame::Join {
            channel: CHANNEL.to_string(),
            presence_key: key.to_string(),
        })
        .unwrap();
    }

    fn drain(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let hub = Arc::new(ChannelHub::new(8));
        let (mut a, mut a_rx) = hub.connect();
        let (mut b, mut b_rx) = hub.connect();
        join(&mut a, "host");
        join(&mut b, "player");
        drain(&mut a_rx);
        drain(&mut b_rx);

        a.handle(ClientFrame::Broadcast {
            event: RoomEvent::State(RoomState::default()),
        })
        .unwrap();

        assert!(drain(&mut a_rx).is_empty());
        let got = drain(&mut b_rx);
        assert_eq!(got.len(), 1);
        assert!(matches!(got[0], ServerFrame::Broadcast { event: RoomEvent::State(_) }));
    }

    #[test]
    fn test_join_confirms_subscription() {
        let hub = Arc::new(ChannelHub::new(8));
        let (mut a, mut a_rx) = hub.connect();
        join(&mut a, "host");

        let got = drain(&mut a_rx);
        assert_eq!(got, vec![ServerFrame::Subscribed {
            channel: CHANNEL.to_string()
        }]);
        assert_eq!(a.channel(), Some(CHANNEL));
    }

    #[test]
    fn test_presence_groups_connections_by_key() {
        let hub = Arc::new(ChannelHub::new(8));
        let (mut tab1, _rx1) = hub.connect();
        let (mut tab2, _rx2) = hub.connect();
        let (mut host, mut host_rx) = hub.connect();
        join(&mut host, "host-key");
        join(&mut tab1, "player-key");
        join(&mut tab2, "player-key");

        for conn in [&mut tab1, &mut tab2] {
            conn.handle(ClientFrame::Track {
                meta: PresenceMeta::new(Role::Player, Some("ada".to_string())),
            })
            .unwrap();
        }

        let roster = hub.roster(CHANNEL);
        assert_eq!(roster.len(), 1);
        assert_eq!(roster["player-key"].len(), 2);

        // the host saw both syncs even without tracking itself
        let syncs = drain(&mut host_rx)
            .into_iter()
            .filter(|f| matches!(f, ServerFrame::PresenceSync { .. }))
            .count();
        assert_eq!(syncs, 2);

        drop(tab1);
        assert_eq!(hub.roster(CHANNEL)["player-key"].len(), 1);
    }

    #[test]
    fn test_empty_channels_are_removed() {
        let hub = Arc::new(ChannelHub::new(8));
        let (mut a, _rx) = hub.connect();
        join(&mut a, "host");
        assert_eq!(hub.channel_count(), 1);
        a.handle(ClientFrame::Leave).unwrap();
        assert_eq!(hub.channel_count(), 0);
        assert_eq!(hub.member_count(CHANNEL), 0);
    }

    #[test]
    fn test_full_queue_drops_frames() {
        let hub = Arc::new(ChannelHub::new(1));
        let (mut a, _a_rx) = hub.connect();
        let (mut b, mut b_rx) = hub.connect();
        join(&mut a, "host");
        join(&mut b, "player");
        // b's queue still holds its Subscribed frame

        a.handle(ClientFrame::Broadcast {
            event: RoomEvent::RequestState {
                requester: "x".to_string(),
            },
        })
        .unwrap();

        let got = drain(&mut b_rx);
        assert_eq!(got.len(), 1);
        assert!(matches!(got[0], ServerFrame::Subscribed { .. }));
    }

    #[test]
    fn test_frames_before_join_are_rejected() {
        let hub = Arc::new(ChannelHub::new(8));
        let (mut a, mut a_rx) = hub.connect();
        let err = a
            .handle(ClientFrame::Broadcast {
                event: RoomEvent::RequestState {
                    requester: "x".to_string(),
                },
            })
            .unwrap_err();
        assert!(matches!(err, AppError::Channel(_)));

        a.process(ClientFrame::Join {
            channel: "lobby".to_string(),
            presence_key: "k".to_string(),
        });
        assert!(matches!(
            drain(&mut a_rx).as_slice(),
            [ServerFrame::Error { .. }]
        ));
    }
}
