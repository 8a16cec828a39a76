// ============================
// bingo-lib/src/player.rs
// ============================
//! The player actor: a read-only replica plus a local card.
//!
//! A player never writes the room document. It renders the latest snapshot,
//! keeps its card and punches on the device, and submits claims for the host
//! to verify. The claimed flag is fenced by the room's reset count so a stale
//! lock-out cannot outlive a reset.
use std::sync::Arc;
use std::time::Duration;

use bingo_common::{
    verify, Ball, Card, ClaimRejection, ClaimRequest, ClaimStatus, PresenceMeta, PunchSet, Role, RoomEvent,
    RoomState, FREE_CELL, GRID_CELLS,
};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::animation::{self, SpinStep, Spinner};
use crate::config::Settings;
use crate::error::AppError;
use crate::host::sleep_until;
use crate::local_store::DeviceStore;
use crate::presence::{PresenceSummary, PresenceTracker};
use crate::reconcile::{Phase, Reaction, Reconciler};
use crate::session::{ChannelSession, Connector, SessionEvent};
use crate::state::Replica;
use crate::validation;

const COMMAND_CAPACITY: usize = 32;
const NOTICE_CAPACITY: usize = 32;

/// Why a card action was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlayerError {
    #[error("the card can only be refreshed before the first ball")]
    CardLocked,

    #[error("a claim was already submitted for this card")]
    AlreadyClaimed,

    #[error("claim not ready: {0}")]
    ClaimNotReady(ClaimRejection),

    #[error("cell {0} cannot be punched")]
    InvalidCell(usize),
}

/// A player's card for one room, backed by the device store
#[derive(Debug, Clone)]
pub struct CardState {
    room_id: String,
    client_id: String,
    version: u32,
    card: Card,
    punched: PunchSet,
    claimed: bool,
}

impl CardState {
    pub fn load(device: &DeviceStore, room_id: &str, client_id: &str) -> Self {
        let version = device.card_version(room_id, client_id);
        Self {
            room_id: room_id.to_string(),
            client_id: client_id.to_string(),
            version,
            card: Card::for_player(room_id, client_id, version),
            punched: device.punches(room_id, client_id, version),
            claimed: device.is_claimed(room_id, client_id, version),
        }
    }

    pub fn card(&self) -> &Card {
        &self.card
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn punched(&self) -> PunchSet {
        self.punched
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed
    }

    /// Flip a cell. Returns whether it is now punched.
    pub fn toggle(&mut self, device: &DeviceStore, index: usize) -> Result<bool, PlayerError> {
        if index >= GRID_CELLS || index == FREE_CELL {
            return Err(PlayerError::InvalidCell(index));
        }
        self.punched.toggle(index);
        device.set_punches(&self.room_id, &self.client_id, self.version, self.punched);
        Ok(self.punched.contains(index))
    }

    /// Move to the next card version. Only allowed before any ball is drawn.
    pub fn refresh(&mut self, device: &DeviceStore, room: &RoomState) -> Result<u32, PlayerError> {
        if !room.drawn_balls.is_empty() {
            return Err(PlayerError::CardLocked);
        }
        let version = self.version + 1;
        device.set_card_version(&self.room_id, &self.client_id, version);
        *self = Self::load(device, &self.room_id, &self.client_id);
        Ok(version)
    }

    /// The local gate for the claim button
    pub fn claim_readiness(&self, room: &RoomState) -> Result<(), PlayerError> {
        if self.claimed {
            return Err(PlayerError::AlreadyClaimed);
        }
        verify(
            &self.card,
            self.punched,
            &room.drawn_balls,
            room.pattern,
            room.custom_pattern.as_deref(),
        )
        .map_err(PlayerError::ClaimNotReady)
    }

    /// Snapshot the card and punches into a claim against `room`
    pub fn build_claim(&self, room: &RoomState, username: &str) -> ClaimRequest {
        ClaimRequest {
            username: username.to_string(),
            client_id: self.client_id.clone(),
            card_version: self.version,
            claimed_at: Utc::now(),
            ball_number: room.current_ball,
            pattern: room.pattern,
            custom_pattern: room.custom_pattern.clone(),
            card_numbers: self.card.clone(),
            punched_indexes: self.punched,
        }
    }

    pub fn mark_claimed(&mut self, device: &DeviceStore) {
        self.claimed = true;
        device.set_claimed(&self.room_id, &self.client_id, self.version, true);
    }

    /// Apply the room's fencing token. When it differs from the last one this
    /// device saw, every claimed flag for this client is cleared, and the
    /// punches too if an earlier round was seen. Returns whether anything was
    /// fenced.
    pub fn observe_reset(&mut self, device: &DeviceStore, reset_count: u64) -> bool {
        let seen = device.last_reset_seen(&self.room_id, &self.client_id);
        if seen == Some(reset_count) {
            return false;
        }

        for version in 1..=self.version {
            device.set_claimed(&self.room_id, &self.client_id, version, false);
        }
        self.claimed = false;
        if seen.is_some() {
            self.punched = PunchSet::with_free();
            device.set_punches(&self.room_id, &self.client_id, self.version, self.punched);
        }
        device.set_last_reset_seen(&self.room_id, &self.client_id, reset_count);
        true
    }
}

/// One-off things worth telling the player about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Someone else's claim was approved
    WinnerAnnounced { id: String, username: String },
    /// This player's own claim left pending
    ClaimResolved { id: String, status: ClaimStatus },
    /// The host started a new round
    Reset { reset_count: u64 },
}

/// What a player sees
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerView {
    /// `None` until the first snapshot arrives
    pub room: Option<RoomState>,
    pub card: Card,
    pub card_version: u32,
    pub punched: PunchSet,
    pub claimed: bool,
    /// The local claim gate passes
    pub can_claim: bool,
}

impl PlayerView {
    fn new(replica: &Replica, card: &CardState) -> Self {
        let room = replica.get().cloned();
        let can_claim = room
            .as_ref()
            .is_some_and(|room| card.claim_readiness(room).is_ok());
        Self {
            room,
            card: card.card().clone(),
            card_version: card.version(),
            punched: card.punched(),
            claimed: card.is_claimed(),
            can_claim,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub room_id: String,
    /// Also the presence key
    pub client_id: String,
    pub username: String,
    /// Frame period of the local spin while the host draws
    pub spin_interval: Duration,
    pub reconnect_delay: Duration,
    pub departure_grace: Duration,
}

impl PlayerConfig {
    pub fn from_settings(
        room_id: impl Into<String>,
        client_id: impl Into<String>,
        username: impl Into<String>,
        settings: &Settings,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            client_id: client_id.into(),
            username: username.into(),
            spin_interval: settings.draw.step_interval(),
            reconnect_delay: settings.session.reconnect_delay(),
            departure_grace: settings.presence.departure_grace(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, AppError>>;

enum PlayerCommand {
    Punch { index: usize, reply: Reply<bool> },
    Claim(Reply<()>),
    RefreshCard(Reply<u32>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct PlayerHandle {
    commands: mpsc::Sender<PlayerCommand>,
    view: watch::Receiver<PlayerView>,
    display: watch::Receiver<Option<Ball>>,
    presence: watch::Receiver<PresenceSummary>,
    phase: watch::Receiver<Phase>,
    notices: broadcast::Sender<Notice>,
}

impl PlayerHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> PlayerCommand) -> Result<T, AppError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).await?;
        rx.await?
    }

    /// Toggle a cell. Returns whether it is now punched.
    pub async fn punch(&self, index: usize) -> Result<bool, AppError> {
        self.request(|reply| PlayerCommand::Punch { index, reply }).await
    }

    /// Submit a claim for the host to verify
    pub async fn claim(&self) -> Result<(), AppError> {
        self.request(PlayerCommand::Claim).await
    }

    /// Switch to a new card. Returns the new card version.
    pub async fn refresh_card(&self) -> Result<u32, AppError> {
        self.request(PlayerCommand::RefreshCard).await
    }

    pub async fn shutdown(&self) -> Result<(), AppError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(PlayerCommand::Shutdown(tx)).await?;
        rx.await?;
        Ok(())
    }

    pub fn view(&self) -> PlayerView {
        self.view.borrow().clone()
    }

    pub fn view_watch(&self) -> watch::Receiver<PlayerView> {
        self.view.clone()
    }

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

    /// Notices published from now on
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }
}

/// Join a room as a player and start the actor.
pub async fn spawn_player(
    mut config: PlayerConfig,
    connector: Arc<dyn Connector>,
    device: DeviceStore,
) -> Result<PlayerHandle, AppError> {
    config.username = validation::validate_username(&config.username)?.to_string();
    let meta = PresenceMeta::new(Role::Player, Some(config.username.clone()));
    let session = ChannelSession::open(connector.as_ref(), &config.room_id, &config.client_id, meta).await?;

    let card = CardState::load(&device, &config.room_id, &config.client_id);
    let replica = Replica::new();

    let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
    let (view_tx, view) = watch::channel(PlayerView::new(&replica, &card));
    let (display_tx, display) = watch::channel(None);
    let (presence_tx, presence) = watch::channel(PresenceSummary::default());
    let (phase_tx, phase) = watch::channel(Phase::Connecting);
    let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

    info!(room_id = %config.room_id, username = %config.username, card_version = card.version(), "joining room");
    let actor = PlayerActor {
        reconciler: Reconciler::new(Role::Player, config.client_id.clone()),
        presence: PresenceTracker::new(config.departure_grace),
        config,
        connector,
        session,
        device,
        commands,
        replica,
        card,
        spinner: None,
        reconnect_at: None,
        view_tx,
        display_tx,
        presence_tx,
        phase_tx,
        notices: notices.clone(),
    };
    tokio::spawn(actor.run());

    Ok(PlayerHandle {
        commands: commands_tx,
        view,
        display,
        presence,
        phase,
        notices,
    })
}

struct PlayerActor {
    config: PlayerConfig,
    connector: Arc<dyn Connector>,
    session: ChannelSession,
    device: DeviceStore,
    commands: mpsc::Receiver<PlayerCommand>,
    reconciler: Reconciler,
    presence: PresenceTracker,
    replica: Replica,
    card: CardState,
    spinner: Option<Spinner>,
    reconnect_at: Option<Instant>,
    view_tx: watch::Sender<PlayerView>,
    display_tx: watch::Sender<Option<Ball>>,
    presence_tx: watch::Sender<PresenceSummary>,
    phase_tx: watch::Sender<Phase>,
    notices: broadcast::Sender<Notice>,
}

impl PlayerActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PlayerCommand::Shutdown(done)) => {
                        self.session.close();
                        let _ = done.send(());
                        break;
                    },
                    Some(command) => self.on_command(command),
                    None => {
                        self.session.close();
                        break;
                    },
                },
                event = self.session.next_event() => self.on_session_event(event),
                step = animation::next_step(&mut self.spinner) => {
                    let (SpinStep::Frame(ball) | SpinStep::Final(ball)) = step;
                    self.display_tx.send_replace(Some(ball));
                },
                _ = sleep_until(self.reconnect_at) => self.reconnect().await,
                _ = sleep_until(self.presence.next_expiry()) => {
                    self.presence_tx.send_replace(self.presence.summary(Instant::now()));
                },
            }
        }
        debug!(room_id = %self.config.room_id, "player actor stopped");
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        let reaction = match event {
            SessionEvent::Subscribed => self.reconciler.on_subscribed(),
            SessionEvent::Event(event) => self.reconciler.on_event(event),
            SessionEvent::PresenceSync(roster) => {
                let summary = self.presence.apply_sync(roster, Instant::now());
                self.presence_tx.send_replace(summary);
                self.reconciler.on_presence_sync()
            },
            SessionEvent::Closed => {
                warn!(room_id = %self.config.room_id, "link dropped, reconnecting");
                self.reconciler.on_disconnected();
                self.spinner = None;
                self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
                Reaction::Ignore
            },
        };

        match reaction {
            Reaction::SendRequestState => {
                debug!(room_id = %self.config.room_id, "requesting state");
                self.session.send(self.reconciler.request_state());
            },
            Reaction::Replace(state) => self.on_state(state),
            Reaction::Ignore
            | Reaction::LoadThenAnnounce
            | Reaction::AnnounceState
            | Reaction::ReviewClaim(_) => {},
        }
        self.phase_tx.send_replace(self.reconciler.phase());
    }

    fn on_state(&mut self, state: RoomState) {
        let previous = self.replica.replace(state.clone());

        if self.card.observe_reset(&self.device, state.reset_count) {
            if let Some(previous) = previous.as_ref().filter(|p| p.reset_count != state.reset_count) {
                info!(from = previous.reset_count, to = state.reset_count, "room was reset");
                self.notify(Notice::Reset {
                    reset_count: state.reset_count,
                });
            }
        }

        for winner in &state.winners {
            if winner.client_id == self.config.client_id {
                let was_pending = previous
                    .as_ref()
                    .and_then(|p| p.winner(&winner.id))
                    .is_some_and(|w| w.status == ClaimStatus::Pending);
                if was_pending && winner.status != ClaimStatus::Pending {
                    self.notify(Notice::ClaimResolved {
                        id: winner.id.clone(),
                        status: winner.status,
                    });
                }
            } else if winner.status == ClaimStatus::Approved
                && self.device.mark_announced(&self.config.room_id, &winner.id)
            {
                self.notify(Notice::WinnerAnnounced {
                    id: winner.id.clone(),
                    username: winner.username.clone(),
                });
            }
        }

        if state.is_drawing {
            if self.spinner.is_none() {
                self.spinner = Some(Spinner::endless(self.config.spin_interval, &state.drawn_balls));
            }
        } else {
            self.spinner = None;
            self.display_tx.send_replace(state.current_ball);
        }
        self.publish_view();
    }

    fn on_command(&mut self, command: PlayerCommand) {
        match command {
            PlayerCommand::Punch { index, reply } => {
                let result = self
                    .card
                    .toggle(&self.device, index)
                    .map_err(AppError::from);
                self.publish_view();
                let _ = reply.send(result);
            },
            PlayerCommand::Claim(reply) => {
                let result = self.claim();
                self.publish_view();
                let _ = reply.send(result);
            },
            PlayerCommand::RefreshCard(reply) => {
                let result = match self.replica.get() {
                    Some(room) => self.card.refresh(&self.device, room).map_err(AppError::from),
                    None => Err(AppError::NotReady),
                };
                if let Ok(version) = result {
                    info!(card_version = version, "card refreshed");
                }
                self.publish_view();
                let _ = reply.send(result);
            },
            PlayerCommand::Shutdown(done) => {
                let _ = done.send(());
            },
        }
    }

    /// Gate locally, lock the card, then broadcast the claim
    fn claim(&mut self) -> Result<(), AppError> {
        let room = self.replica.get().ok_or(AppError::NotReady)?;
        if !self.session.is_subscribed() {
            return Err(AppError::NotReady);
        }
        self.card.claim_readiness(room)?;

        let request = self.card.build_claim(room, &self.config.username);
        self.card.mark_claimed(&self.device);
        info!(
            username = %self.config.username,
            card_version = self.card.version(),
            "claiming bingo"
        );
        if !self.session.send(RoomEvent::ClaimBingo(request)) {
            warn!(room_id = %self.config.room_id, "claim could not be sent");
        }
        Ok(())
    }

    fn notify(&self, notice: Notice) {
        // no receivers is fine
        let _ = self.notices.send(notice);
    }

    fn publish_view(&self) {
        self.view_tx
            .send_replace(PlayerView::new(&self.replica, &self.card));
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
}
