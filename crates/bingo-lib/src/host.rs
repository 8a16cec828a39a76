// ============================
// bingo-lib/src/host.rs
// ============================
//! The host actor: sole writer of a room's document.
//!
//! [`spawn_host`] opens the room channel and runs a task that owns the
//! [`HostState`], the channel session and the draw spinner. Operators talk
//! to it through a cloneable [`HostHandle`]; every mutation is broadcast as
//! a full snapshot first and persisted best-effort afterwards.
use std::sync::Arc;
use std::time::Duration;

use bingo_common::{Ball, ClaimRequest, PatternId, PresenceMeta, Role, RoomEvent, RoomState, WinnerClaim};
use chrono::Utc;
use metrics::counter;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::animation::{self, SpinStep, Spinner};
use crate::config::{DrawSettings, Settings};
use crate::error::AppError;
use crate::local_store::DeviceStore;
use crate::metrics::{CLAIM_ACCEPTED, CLAIM_DUPLICATE, CLAIM_REJECTED, DRAW_COMMITTED, ROOM_RESET};
use crate::presence::{PresenceSummary, PresenceTracker};
use crate::reconcile::{Phase, Reaction, Reconciler};
use crate::session::{ChannelSession, Connector, SessionEvent};
use crate::state::{ClaimOutcome, HostState, StateError};
use crate::storage::{BestEffort, BingoCall};

const COMMAND_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub room_id: String,
    /// Also the presence key
    pub client_id: String,
    pub username: Option<String>,
    pub draw: DrawSettings,
    pub reconnect_delay: Duration,
    pub departure_grace: Duration,
}

impl HostConfig {
    pub fn from_settings(room_id: impl Into<String>, client_id: impl Into<String>, settings: &Settings) -> Self {
        Self {
            room_id: room_id.into(),
            client_id: client_id.into(),
            username: None,
            draw: settings.draw.clone(),
            reconnect_delay: settings.session.reconnect_delay(),
            departure_grace: settings.presence.departure_grace(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, AppError>>;

enum HostCommand {
    /// Replies with the committed ball once the spin ends
    Draw(Reply<Ball>),
    SetPattern {
        pattern: PatternId,
        custom: Option<Vec<usize>>,
        reply: Reply<()>,
    },
    Approve {
        id: String,
        reply: Reply<WinnerClaim>,
    },
    Reject {
        id: String,
        reply: Reply<WinnerClaim>,
    },
    Reset(Reply<u64>),
    Shutdown(oneshot::Sender<()>),
}

/// Operator side of a running host
#[derive(Clone)]
pub struct HostHandle {
    commands: mpsc::Sender<HostCommand>,
    state: watch::Receiver<RoomState>,
    display: watch::Receiver<Option<Ball>>,
    presence: watch::Receiver<PresenceSummary>,
    phase: watch::Receiver<Phase>,
}

impl HostHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> HostCommand) -> Result<T, AppError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).await?;
        rx.await?
    }

    /// Draw one ball. Resolves with the ball once the spin has committed it.
    pub async fn draw(&self) -> Result<Ball, AppError> {
        self.request(HostCommand::Draw).await
    }

    pub async fn set_pattern(&self, pattern: PatternId, custom: Option<Vec<usize>>) -> Result<(), AppError> {
        self.request(|reply| HostCommand::SetPattern { pattern, custom, reply })
            .await
    }

    pub async fn approve(&self, id: &str) -> Result<WinnerClaim, AppError> {
        let id = id.to_string();
        self.request(|reply| HostCommand::Approve { id, reply }).await
    }

    pub async fn reject(&self, id: &str) -> Result<WinnerClaim, AppError> {
        let id = id.to_string();
        self.request(|reply| HostCommand::Reject { id, reply }).await
    }

    /// Clear the round. Returns the new reset count.
    pub async fn reset(&self) -> Result<u64, AppError> {
        self.request(HostCommand::Reset).await
    }

    /// Leave the channel and wait for queued persistence writes.
    pub async fn shutdown(&self) -> Result<(), AppError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(HostCommand::Shutdown(tx)).await?;
        rx.await?;
        Ok(())
    }

    /// Last published document
    pub fn current(&self) -> RoomState {
        self.state.borrow().clone()
    }

    pub fn state(&self) -> watch::Receiver<RoomState> {
        self.state.clone()
    }

    /// The ball on the host's own display, spin frames included
    pub fn display(&self) -> watch::Receiver<Option<Ball>> {
        self.display.clone()
    }

    pub fn presence(&self) -> watch::Receiver<PresenceSummary> {
        self.presence.clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn phase_watch(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }
}

/// Open the room channel as its host and start the actor.
pub async fn spawn_host(
    config: HostConfig,
    connector: Arc<dyn Connector>,
    store: BestEffort,
    device: DeviceStore,
) -> Result<HostHandle, AppError> {
    let meta = PresenceMeta::new(Role::Host, config.username.clone());
    let session = ChannelSession::open(connector.as_ref(), &config.room_id, &config.client_id, meta).await?;

    let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
    let (state_tx, state) = watch::channel(RoomState::default());
    let (display_tx, display) = watch::channel(None);
    let (presence_tx, presence) = watch::channel(PresenceSummary::default());
    let (phase_tx, phase) = watch::channel(Phase::Connecting);

    info!(room_id = %config.room_id, "hosting room");
    let actor = HostActor {
        reconciler: Reconciler::new(Role::Host, config.client_id.clone()),
        presence: PresenceTracker::new(config.departure_grace),
        config,
        connector,
        session,
        store,
        device,
        commands,
        room: None,
        spinner: None,
        pending_draw: None,
        reconnect_at: None,
        state_tx,
        display_tx,
        presence_tx,
        phase_tx,
    };
    tokio::spawn(actor.run());

    Ok(HostHandle {
        commands: commands_tx,
        state,
        display,
        presence,
        phase,
    })
}

struct HostActor {
    config: HostConfig,
    connector: Arc<dyn Connector>,
    session: ChannelSession,
    store: BestEffort,
    device: DeviceStore,
    commands: mpsc::Receiver<HostCommand>,
    reconciler: Reconciler,
    presence: PresenceTracker,
    /// `None` until the room is loaded
    room: Option<HostState>,
    spinner: Option<Spinner>,
    pending_draw: Option<Reply<Ball>>,
    reconnect_at: Option<Instant>,
    state_tx: watch::Sender<RoomState>,
    display_tx: watch::Sender<Option<Ball>>,
    presence_tx: watch::Sender<PresenceSummary>,
    phase_tx: watch::Sender<Phase>,
}

impl HostActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(HostCommand::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    },
                    Some(command) => self.on_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    },
                },
                event = self.session.next_event() => self.on_session_event(event).await,
                step = animation::next_step(&mut self.spinner) => self.on_spin(step),
                _ = sleep_until(self.reconnect_at) => self.reconnect().await,
                _ = sleep_until(self.presence.next_expiry()) => {
                    self.presence_tx.send_replace(self.presence.summary(Instant::now()));
                },
            }
        }
        debug!(room_id = %self.config.room_id, "host actor stopped");
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        let reaction = match event {
            SessionEvent::Subscribed => {
                info!(channel = %self.session.channel_name(), "subscribed");
                self.reconciler.on_subscribed()
            },
            SessionEvent::Event(event) => self.reconciler.on_event(event),
            SessionEvent::PresenceSync(roster) => {
                let summary = self.presence.apply_sync(roster, Instant::now());
                for key in &summary.joined {
                    debug!(presence_key = %key, "member joined");
                }
                self.presence_tx.send_replace(summary);
                self.reconciler.on_presence_sync()
            },
            SessionEvent::Closed => {
                warn!(room_id = %self.config.room_id, "link dropped, reconnecting");
                self.reconciler.on_disconnected();
                self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
                Reaction::Ignore
            },
        };
        self.phase_tx.send_replace(self.reconciler.phase());

        match reaction {
            Reaction::LoadThenAnnounce => {
                let loaded = self.load().await;
                self.room = Some(HostState::new(loaded));
                self.reconciler.mark_loaded();
                // players check the durable record before joining
                self.publish(true);
                self.phase_tx.send_replace(self.reconciler.phase());
            },
            Reaction::AnnounceState => self.announce(),
            Reaction::ReviewClaim(request) => self.review_claim(request),
            Reaction::Ignore | Reaction::SendRequestState | Reaction::Replace(_) => {},
        }
    }

    /// Durable snapshot, else the device cache, else a fresh room. A cache
    /// from a later round wins over a stale durable record.
    async fn load(&self) -> RoomState {
        let room_id = &self.config.room_id;
        let durable = self.store.fetch(room_id).await;
        let cached = self.device.cached_room(room_id);

        let (state, source) = match (durable, cached) {
            (Some(durable), Some(cached)) if cached.reset_count > durable.reset_count => (cached, "cache"),
            (Some(durable), _) => (durable, "store"),
            (None, Some(cached)) => (cached, "cache"),
            (None, None) => (RoomState::default(), "new"),
        };
        info!(
            room_id = %room_id,
            source,
            drawn = state.drawn_balls.len(),
            reset_count = state.reset_count,
            "room loaded"
        );
        state
    }

    fn on_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Draw(reply) => self.begin_draw(reply),
            HostCommand::SetPattern { pattern, custom, reply } => {
                let result = self.mutate(|room| room.set_pattern(pattern, custom));
                if result.is_ok() {
                    info!(pattern = %pattern, "pattern set");
                    self.publish(true);
                }
                let _ = reply.send(result);
            },
            HostCommand::Approve { id, reply } => {
                let result = self.mutate(|room| room.approve(&id).cloned());
                if let Ok(claim) = &result {
                    info!(claim_id = %claim.id, username = %claim.username, "claim approved");
                    self.publish(true);
                    self.store.record_call(
                        &self.config.room_id,
                        BingoCall {
                            id: claim.id.clone(),
                            room_id: self.config.room_id.clone(),
                            username: claim.username.clone(),
                            card_version: claim.card_version,
                            pattern: claim.pattern,
                            called_at: Utc::now(),
                        },
                    );
                }
                let _ = reply.send(result);
            },
            HostCommand::Reject { id, reply } => {
                let result = self.mutate(|room| room.reject(&id).cloned());
                if let Ok(claim) = &result {
                    info!(claim_id = %claim.id, username = %claim.username, "claim rejected");
                    self.publish(true);
                }
                let _ = reply.send(result);
            },
            HostCommand::Reset(reply) => {
                let result = self.reset();
                let _ = reply.send(result);
            },
            // handled by the run loop
            HostCommand::Shutdown(done) => {
                let _ = done.send(());
            },
        }
    }

    /// Run `op` against the loaded room, mapping its error
    fn mutate<T>(&mut self, op: impl FnOnce(&mut HostState) -> Result<T, StateError>) -> Result<T, AppError> {
        let room = self.room.as_mut().ok_or(AppError::NotReady)?;
        Ok(op(room)?)
    }

    fn begin_draw(&mut self, reply: Reply<Ball>) {
        if let Err(e) = self.mutate(|room| room.begin_draw()) {
            let _ = reply.send(Err(e));
            return;
        }
        let drawn = self.room.as_ref().map(|r| r.snapshot().drawn_balls.clone()).unwrap_or_default();
        let Some(spinner) = Spinner::bounded(self.config.draw.steps.max(1), self.config.draw.step_interval(), &drawn)
        else {
            if let Some(room) = self.room.as_mut() {
                room.abort_draw();
            }
            let _ = reply.send(Err(StateError::AllBallsDrawn.into()));
            return;
        };

        // players start their own spin from this
        self.publish(false);
        self.spinner = Some(spinner);
        self.pending_draw = Some(reply);
    }

    fn on_spin(&mut self, step: SpinStep) {
        let ball = match step {
            SpinStep::Frame(ball) => {
                self.display_tx.send_replace(Some(ball));
                return;
            },
            SpinStep::Final(ball) => ball,
        };
        self.spinner = None;

        let result = self.mutate(|room| room.commit_draw(ball));
        match &result {
            Ok(()) => {
                counter!(DRAW_COMMITTED).increment(1);
                info!(ball, "ball drawn");
                self.display_tx.send_replace(Some(ball));
                self.publish(true);
            },
            Err(e) => {
                warn!(ball, error = %e, "draw could not be committed");
                if let Some(room) = self.room.as_mut() {
                    room.abort_draw();
                }
                self.publish(false);
            },
        }
        if let Some(reply) = self.pending_draw.take() {
            let _ = reply.send(result.map(|()| ball));
        }
    }

    fn review_claim(&mut self, request: ClaimRequest) {
        let Some(room) = self.room.as_mut() else {
            return;
        };
        let username = request.username.clone();
        let card_version = request.card_version;

        match room.submit_claim(request) {
            ClaimOutcome::Accepted(id) => {
                counter!(CLAIM_ACCEPTED).increment(1);
                info!(claim_id = %id, username = %username, card_version, "claim pending review");
                self.publish(true);
            },
            ClaimOutcome::Duplicate => {
                counter!(CLAIM_DUPLICATE).increment(1);
                debug!(username = %username, card_version, "duplicate claim dropped");
            },
            ClaimOutcome::Rejected(reason) => {
                counter!(CLAIM_REJECTED).increment(1);
                warn!(username = %username, card_version, reason = %reason, "claim failed verification");
            },
        }
    }

    fn reset(&mut self) -> Result<u64, AppError> {
        let room = self.room.as_mut().ok_or(AppError::NotReady)?;
        // an abandoned spin never commits
        self.spinner = None;
        if let Some(reply) = self.pending_draw.take() {
            let _ = reply.send(Err(StateError::NotDrawing.into()));
        }

        let reset_count = room.reset();
        let snapshot = room.snapshot().clone();
        counter!(ROOM_RESET).increment(1);
        info!(room_id = %self.config.room_id, reset_count, "room reset");

        self.display_tx.send_replace(None);
        self.announce();
        self.state_tx.send_replace(snapshot.clone());
        self.device.cache_room(&self.config.room_id, &snapshot);
        self.store.clear(&self.config.room_id);
        Ok(reset_count)
    }

    fn announce(&self) {
        if let Some(room) = &self.room {
            self.session.send(RoomEvent::State(room.snapshot().clone()));
        }
    }

    /// Broadcast, update watchers, then persist when asked. A document with a
    /// draw in flight is never persisted.
    fn publish(&self, persist: bool) {
        let Some(room) = &self.room else {
            return;
        };
        let snapshot = room.snapshot().clone();
        self.announce();
        self.state_tx.send_replace(snapshot.clone());

        if persist && !snapshot.is_drawing {
            self.device.cache_room(&self.config.room_id, &snapshot);
            self.store.save(&self.config.room_id, snapshot);
        }
    }

    async fn reconnect(&mut self) {
        self.reconnect_at = None;
        match self.session.reconnect(self.connector.as_ref()).await {
            Ok(()) => debug!(room_id = %self.config.room_id, "rejoin requested"),
            Err(e) => {
                warn!(room_id = %self.config.room_id, error = %e, "reconnect failed");
                self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
            },
        }
    }

    async fn shutdown(&mut self) {
        self.spinner = None;
        self.pending_draw = None;
        self.session.close();
        self.store.flush().await;
        info!(room_id = %self.config.room_id, "host stopped");
    }
}

pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::ChannelHub;
    use crate::session::LocalConnector;
    use crate::storage::{MemoryStorage, RoomRepository};
    use tokio::time::timeout;

    fn config() -> HostConfig {
        HostConfig {
            room_id: "abc123".to_string(),
            client_id: "host-1".to_string(),
            username: None,
            draw: DrawSettings {
                steps: 3,
                step_interval_ms: 5,
            },
            reconnect_delay: Duration::from_millis(20),
            departure_grace: Duration::from_millis(100),
        }
    }

    async fn start(memory: &MemoryStorage, device: &DeviceStore) -> HostHandle {
        let hub = Arc::new(ChannelHub::new(64));
        let host = spawn_host(
            config(),
            Arc::new(LocalConnector::new(hub)),
            BestEffort::new(Arc::new(memory.clone())),
            device.clone(),
        )
        .await
        .unwrap();
        let mut phase = host.phase_watch();
        timeout(Duration::from_secs(2), phase.wait_for(|p| *p == Phase::Converged))
            .await
            .unwrap()
            .unwrap();
        host
    }

    #[tokio::test]
    async fn draws_are_committed_and_persisted() {
        let memory = MemoryStorage::new();
        let device = DeviceStore::in_memory();
        let host = start(&memory, &device).await;

        let first = host.draw().await.unwrap();
        let second = host.draw().await.unwrap();
        assert_ne!(first, second);

        let state = host.current();
        assert_eq!(state.drawn_balls, vec![first, second]);
        assert_eq!(state.current_ball, Some(second));
        assert!(!state.is_drawing);

        host.shutdown().await.unwrap();
        assert_eq!(memory.snapshot("abc123"), Some(state.clone()));
        assert_eq!(device.cached_room("abc123"), Some(state));
    }

    #[tokio::test]
    async fn reload_prefers_the_durable_record() {
        let memory = MemoryStorage::new();
        let mut saved = RoomState::default();
        saved.drawn_balls = vec![7, 19];
        saved.current_ball = Some(19);
        saved.is_drawing = true;
        memory.save("abc123", &saved).await.unwrap();

        let host = start(&memory, &DeviceStore::in_memory()).await;
        let state = host.current();
        assert_eq!(state.drawn_balls, vec![7, 19]);
        assert!(!state.is_drawing);
    }

    #[tokio::test]
    async fn reset_clears_the_durable_record_but_not_the_cache() {
        let memory = MemoryStorage::new();
        let device = DeviceStore::in_memory();
        let host = start(&memory, &device).await;

        host.set_pattern(PatternId::Blackout, None).await.unwrap();
        host.draw().await.unwrap();
        assert_eq!(host.reset().await.unwrap(), 1);
        host.shutdown().await.unwrap();

        assert_eq!(memory.snapshot("abc123"), None);
        let cached = device.cached_room("abc123").unwrap();
        assert_eq!(cached.reset_count, 1);
        assert_eq!(cached.pattern, Some(PatternId::Blackout));
        assert!(cached.drawn_balls.is_empty());
    }

    #[tokio::test]
    async fn unreachable_store_does_not_block_play() {
        let memory = MemoryStorage::new();
        memory.set_unavailable(true);
        let host = start(&memory, &DeviceStore::in_memory()).await;

        host.draw().await.unwrap();
        assert_eq!(host.current().drawn_balls.len(), 1);
        host.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_claims_are_refused() {
        let host = start(&MemoryStorage::new(), &DeviceStore::in_memory()).await;
        let err = host.approve("missing").await.unwrap_err();
        assert!(matches!(err, AppError::State(StateError::ClaimNotFound(_))));
    }
}
