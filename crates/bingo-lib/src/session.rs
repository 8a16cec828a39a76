// ============================
// bingo-lib/src/session.rs
// ============================
//! Channel sessions: one subscription to one room channel.
//!
//! A [`Connector`] produces a raw [`Link`] to a relay, either in-process
//! ([`LocalConnector`]) or over a websocket ([`WsConnector`]). A
//! [`ChannelSession`] joins the room channel on that link, tracks presence
//! once subscribed and turns relay frames into [`SessionEvent`]s.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bingo_common::{ClientFrame, PresenceMeta, RoomEvent, Roster, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::hub::ChannelHub;
use crate::validation;

/// Outbound queue length on the client side of a link
const LINK_CAPACITY: usize = 64;

/// How long a websocket handshake may take
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A bidirectional frame pipe to a relay. Its pump tasks stop on drop.
pub struct Link {
    outbound: mpsc::Sender<ClientFrame>,
    inbound: mpsc::Receiver<ServerFrame>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    pub fn new(
        outbound: mpsc::Sender<ClientFrame>,
        inbound: mpsc::Receiver<ServerFrame>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            tasks,
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Opens links to a relay
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Link, AppError>;
}

/// Connects straight into an in-process hub
pub struct LocalConnector {
    hub: Arc<ChannelHub>,
}

impl LocalConnector {
    pub fn new(hub: Arc<ChannelHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self) -> Result<Link, AppError> {
        let (mut conn, inbound) = self.hub.connect();
        let (outbound, mut frames) = mpsc::channel::<ClientFrame>(LINK_CAPACITY);

        let pump = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                conn.process(frame);
            }
        });

        Ok(Link::new(outbound, inbound, vec![pump]))
    }
}

/// Connects to a relay's `/ws` route
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, AppError> {
        let handshake = tokio_tungstenite::connect_async(self.url.as_str());
        let (ws, _response) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| AppError::Timeout(format!("connect to {} after {:?}", self.url, self.connect_timeout)))?
            .map_err(|e| AppError::Channel(format!("connect to {} failed: {e}", self.url)))?;
        let (mut write, mut read) = ws.split();

        let (outbound, mut frames) = mpsc::channel::<ClientFrame>(LINK_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel::<ServerFrame>(LINK_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to encode frame");
                        continue;
                    },
                };
                if write.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(Ok(message)) = read.next().await {
                match message {
                    Message::Text(text) => match serde_json::from_str::<ServerFrame>(text.as_str()) {
                        Ok(frame) => {
                            if inbound_tx.send(frame).await.is_err() {
                                break;
                            }
                        },
                        Err(e) => warn!(error = %e, "malformed frame from relay"),
                    },
                    Message::Close(_) => break,
                    _ => {},
                }
            }
            // dropping inbound_tx closes the session
        });

        Ok(Link::new(outbound, inbound, vec![writer, reader]))
    }
}

/// What a session yields to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The relay confirmed the subscription. Sends are delivered from now on.
    Subscribed,
    Event(RoomEvent),
    PresenceSync(Roster),
    /// The link dropped. The session must be reopened to continue.
    Closed,
}

/// One subscription to a room channel
pub struct ChannelSession {
    channel: String,
    presence_key: String,
    meta: PresenceMeta,
    link: Option<Link>,
    subscribed: bool,
}

impl ChannelSession {
    /// Connect and request a subscription. Completes before the relay confirms.
    pub async fn open(
        connector: &dyn Connector,
        room_id: &str,
        presence_key: &str,
        meta: PresenceMeta,
    ) -> Result<Self, AppError> {
        validation::validate_room_id(room_id)?;
        validation::validate_presence_key(presence_key)?;

        let mut session = Self {
            channel: validation::channel_name(room_id),
            presence_key: presence_key.to_string(),
            meta,
            link: None,
            subscribed: false,
        };
        session.reconnect(connector).await?;
        Ok(session)
    }

    /// Drop the current link, if any, and join again on a fresh one.
    pub async fn reconnect(&mut self, connector: &dyn Connector) -> Result<(), AppError> {
        self.link = None;
        self.subscribed = false;

        let link = connector.connect().await?;
        link.outbound
            .send(ClientFrame::Join {
                channel: self.channel.clone(),
                presence_key: self.presence_key.clone(),
            })
            .await?;
        self.link = Some(link);
        debug!(channel = %self.channel, "join requested");
        Ok(())
    }

    pub fn channel_name(&self) -> &str {
        &self.channel
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Broadcast to the other members. Dropped, returning false, unless the
    /// subscription is confirmed and the outbound queue has room.
    pub fn send(&self, event: RoomEvent) -> bool {
        let Some(link) = self.link.as_ref().filter(|_| self.subscribed) else {
            debug!(channel = %self.channel, event = event.name(), "not subscribed, dropping send");
            return false;
        };
        match link.outbound.try_send(ClientFrame::Broadcast { event }) {
            Ok(()) => true,
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "outbound queue full, dropping send");
                false
            },
        }
    }

    /// Next event from the relay. Cancel-safe; pends forever once closed.
    pub async fn next_event(&mut self) -> SessionEvent {
        loop {
            let Some(link) = self.link.as_mut() else {
                return std::future::pending().await;
            };

            match link.inbound.recv().await {
                Some(ServerFrame::Subscribed { channel }) if channel == self.channel => {
                    self.subscribed = true;
                    let _ = link.outbound.try_send(ClientFrame::Track {
                        meta: self.meta.clone(),
                    });
                    return SessionEvent::Subscribed;
                },
                Some(ServerFrame::Subscribed { channel }) => {
                    warn!(expected = %self.channel, got = %channel, "subscribed to unexpected channel");
                },
                Some(ServerFrame::Broadcast { event }) => return SessionEvent::Event(event),
                Some(ServerFrame::PresenceSync { roster }) => return SessionEvent::PresenceSync(roster),
                Some(ServerFrame::Error { code, message }) => {
                    warn!(channel = %self.channel, code = %code, message = %message, "relay reported an error");
                },
                None => {
                    self.link = None;
                    self.subscribed = false;
                    return SessionEvent::Closed;
                },
            }
        }
    }

    /// Unsubscribe and drop the link. Pending sends are lost.
    pub fn close(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = link.outbound.try_send(ClientFrame::Leave);
        }
        self.subscribed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bingo_common::{Role, RoomState};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn open(hub: &Arc<ChannelHub>, key: &str, role: Role) -> ChannelSession {
        let connector = LocalConnector::new(hub.clone());
        ChannelSession::open(&connector, "abc123", key, PresenceMeta::new(role, None))
            .await
            .unwrap()
    }

    async fn next(session: &mut ChannelSession) -> SessionEvent {
        timeout(Duration::from_secs(2), session.next_event()).await.unwrap()
    }

    #[tokio::test]
    async fn test_send_before_subscribed_is_dropped() {
        let hub = Arc::new(ChannelHub::new(16));
        let mut session = open(&hub, "host", Role::Host).await;
        assert!(!session.send(RoomEvent::State(RoomState::default())));

        assert_eq!(next(&mut session).await, SessionEvent::Subscribed);
        assert!(session.is_subscribed());
        assert_eq!(session.channel_name(), "bingo:room-abc123");
    }

    #[tokio::test]
    async fn test_events_flow_between_sessions() {
        let hub = Arc::new(ChannelHub::new(16));
        let mut host = open(&hub, "host", Role::Host).await;
        assert_eq!(next(&mut host).await, SessionEvent::Subscribed);
        let mut player = open(&hub, "player", Role::Player).await;
        assert_eq!(next(&mut player).await, SessionEvent::Subscribed);

        assert!(player.send(RoomEvent::RequestState {
            requester: "player".to_string()
        }));

        // the host sees presence updates and the request, in some order
        let mut got_request = false;
        for _ in 0..4 {
            match next(&mut host).await {
                SessionEvent::Event(RoomEvent::RequestState { requester }) => {
                    assert_eq!(requester, "player");
                    got_request = true;
                    break;
                },
                SessionEvent::PresenceSync(_) => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(got_request);
    }

    #[tokio::test]
    async fn test_close_leaves_channel() {
        let hub = Arc::new(ChannelHub::new(16));
        let mut session = open(&hub, "host", Role::Host).await;
        assert_eq!(next(&mut session).await, SessionEvent::Subscribed);
        assert_eq!(hub.member_count("bingo:room-abc123"), 1);

        session.close();
        assert!(!session.is_connected());
        timeout(Duration::from_secs(2), async {
            while hub.member_count("bingo:room-abc123") > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_room_is_rejected() {
        let hub = Arc::new(ChannelHub::new(16));
        let connector = LocalConnector::new(hub);
        let err = ChannelSession::open(
            &connector,
            "Bad Room",
            "host",
            PresenceMeta::new(Role::Host, None),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_ws_handshake_times_out() {
        // accepts connections and never answers the upgrade
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let connector = WsConnector::new(format!("ws://{addr}/ws")).with_connect_timeout(Duration::from_millis(100));
        let result = timeout(Duration::from_secs(2), connector.connect()).await.unwrap();
        assert!(matches!(result, Err(AppError::Timeout(_))));
    }
}
