//! Join and convergence protocol.
//!
//! [`Reconciler`] is the per-client state machine both actors drive. It
//! decides, for every session event, what the actor must do; it never
//! touches the network or the stores itself.
//!
//! ```text
//! Connecting --subscribed--> Subscribed --state / loaded--> Converged
//!      ^                                                        |
//!      +---------------------- link dropped --------------------+
//! ```
use bingo_common::{ClaimRequest, Role, RoomEvent, RoomState};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Subscribed,
    Converged,
}

/// What the owning actor should do next
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    Ignore,
    /// Player: ask the host for a snapshot
    SendRequestState,
    /// Host: load the room, then announce it and call `mark_loaded`
    LoadThenAnnounce,
    /// Host: broadcast the current document
    AnnounceState,
    /// Player: replace the replica
    Replace(RoomState),
    /// Host: review a claim
    ReviewClaim(ClaimRequest),
}

#[derive(Debug)]
pub struct Reconciler {
    role: Role,
    client_id: String,
    phase: Phase,
    loaded: bool,
}

impl Reconciler {
    pub fn new(role: Role, client_id: impl Into<String>) -> Self {
        Self {
            role,
            client_id: client_id.into(),
            phase: Phase::Connecting,
            loaded: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The relay confirmed the subscription. Every (re)join lands here.
    pub fn on_subscribed(&mut self) -> Reaction {
        match self.role {
            Role::Player => {
                self.phase = Phase::Subscribed;
                Reaction::SendRequestState
            },
            Role::Host if self.loaded => {
                // the room survives a reconnect in memory
                self.phase = Phase::Converged;
                Reaction::AnnounceState
            },
            Role::Host => {
                self.phase = Phase::Subscribed;
                Reaction::LoadThenAnnounce
            },
        }
    }

    /// The host finished loading its room
    pub fn mark_loaded(&mut self) {
        self.loaded = true;
        if self.phase == Phase::Subscribed {
            self.phase = Phase::Converged;
        }
    }

    pub fn on_event(&mut self, event: RoomEvent) -> Reaction {
        match (self.role, event) {
            (Role::Player, RoomEvent::State(state)) => {
                self.phase = Phase::Converged;
                Reaction::Replace(state)
            },
            (Role::Host, RoomEvent::State(_)) => {
                debug!(client_id = %self.client_id, "ignoring state from another writer");
                Reaction::Ignore
            },
            (Role::Host, RoomEvent::RequestState { requester }) if self.loaded => {
                debug!(requester = %requester, "state requested");
                Reaction::AnnounceState
            },
            (Role::Host, RoomEvent::ClaimBingo(claim)) if self.loaded => Reaction::ReviewClaim(claim),
            _ => Reaction::Ignore,
        }
    }

    /// A roster snapshot arrived. The host re-announces so a joiner whose
    /// request raced its subscription still converges.
    pub fn on_presence_sync(&mut self) -> Reaction {
        if self.role == Role::Host && self.loaded && self.phase != Phase::Connecting {
            Reaction::AnnounceState
        } else {
            Reaction::Ignore
        }
    }

    pub fn on_disconnected(&mut self) {
        self.phase = Phase::Connecting;
    }

    /// Payload for a `request_state` event
    pub fn request_state(&self) -> RoomEvent {
        RoomEvent::RequestState {
            requester: self.client_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn player_requests_then_converges_on_first_state() {
        let mut player = Reconciler::new(Role::Player, "p1");
        assert_eq!(player.phase(), Phase::Connecting);
        assert_eq!(player.on_subscribed(), Reaction::SendRequestState);
        assert_eq!(player.phase(), Phase::Subscribed);
        assert_eq!(
            player.request_state(),
            RoomEvent::RequestState {
                requester: "p1".to_string()
            }
        );

        let state = RoomState {
            drawn_balls: vec![3],
            ..RoomState::default()
        };
        assert_eq!(
            player.on_event(RoomEvent::State(state.clone())),
            Reaction::Replace(state)
        );
        assert_eq!(player.phase(), Phase::Converged);
    }

    #[test]
    fn players_never_answer_requests_or_review_claims() {
        let mut player = Reconciler::new(Role::Player, "p1");
        player.on_subscribed();
        assert_eq!(
            player.on_event(RoomEvent::RequestState {
                requester: "p2".to_string()
            }),
            Reaction::Ignore
        );
        assert_eq!(player.on_presence_sync(), Reaction::Ignore);
    }

    #[test]
    fn host_loads_once_and_reannounces_after_reconnect() {
        let mut host = Reconciler::new(Role::Host, "h");
        assert_eq!(host.on_subscribed(), Reaction::LoadThenAnnounce);
        // nothing to announce before the load completes
        assert_eq!(host.on_presence_sync(), Reaction::Ignore);
        host.mark_loaded();
        assert_eq!(host.phase(), Phase::Converged);

        host.on_disconnected();
        assert_eq!(host.phase(), Phase::Connecting);
        assert_eq!(host.on_presence_sync(), Reaction::Ignore);
        assert_eq!(host.on_subscribed(), Reaction::AnnounceState);
        assert_eq!(host.phase(), Phase::Converged);
    }

    #[test]
    fn host_answers_every_request_and_sync() {
        let mut host = Reconciler::new(Role::Host, "h");
        host.on_subscribed();
        host.mark_loaded();
        for _ in 0..3 {
            assert_eq!(
                host.on_event(RoomEvent::RequestState {
                    requester: "p1".to_string()
                }),
                Reaction::AnnounceState
            );
            assert_eq!(host.on_presence_sync(), Reaction::AnnounceState);
        }
        assert_eq!(
            host.on_event(RoomEvent::State(RoomState::default())),
            Reaction::Ignore
        );
    }
}
