// ============================
// bingo-lib/src/state.rs
// ============================
//! Room state stores.
//!
//! [`HostState`] is the only writer of a room's document. [`Replica`] is the
//! read-only copy a player keeps, replaced whole on every `state` event.
use bingo_common::pattern::normalize_custom;
use bingo_common::{
    verify, Ball, ClaimRejection, ClaimRequest, ClaimStatus, PatternId, RoomState, WinnerClaim, MAX_BALL,
};
use thiserror::Error;
use uuid::Uuid;

/// Why a host mutation was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("a draw is already in progress")]
    AlreadyDrawing,

    #[error("all 75 balls have been drawn")]
    AllBallsDrawn,

    #[error("no draw is in progress")]
    NotDrawing,

    #[error("ball {0} cannot be drawn")]
    InvalidBall(Ball),

    #[error("claim {0} not found")]
    ClaimNotFound(String),

    #[error("claim {id} is already {status:?}")]
    ClaimNotPending { id: String, status: ClaimStatus },

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
}

/// Result of reviewing an incoming claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Appended as pending under this id
    Accepted(String),
    /// A claim for this client and card version already exists
    Duplicate,
    /// Failed re-verification
    Rejected(ClaimRejection),
}

/// Host-side authoritative room document
#[derive(Debug, Clone, Default)]
pub struct HostState {
    state: RoomState,
}

impl HostState {
    /// Adopt a loaded document. A draw cannot survive a reload, so any
    /// in-flight flag is cleared.
    pub fn new(mut state: RoomState) -> Self {
        state.is_drawing = false;
        Self { state }
    }

    pub fn snapshot(&self) -> &RoomState {
        &self.state
    }

    /// Start a draw
    pub fn begin_draw(&mut self) -> Result<(), StateError> {
        if self.state.is_drawing {
            return Err(StateError::AlreadyDrawing);
        }
        if self.state.is_exhausted() {
            return Err(StateError::AllBallsDrawn);
        }
        self.state.is_drawing = true;
        Ok(())
    }

    /// Balls still in the pool
    pub fn undrawn(&self) -> Vec<Ball> {
        (1..=MAX_BALL).filter(|b| !self.state.is_drawn(*b)).collect()
    }

    /// Finish the draw in progress with `ball`
    pub fn commit_draw(&mut self, ball: Ball) -> Result<(), StateError> {
        if !self.state.is_drawing {
            return Err(StateError::NotDrawing);
        }
        if !(1..=MAX_BALL).contains(&ball) || self.state.is_drawn(ball) {
            return Err(StateError::InvalidBall(ball));
        }
        self.state.drawn_balls.push(ball);
        self.state.current_ball = Some(ball);
        self.state.is_drawing = false;
        Ok(())
    }

    /// Abandon the draw in progress, if any
    pub fn abort_draw(&mut self) {
        self.state.is_drawing = false;
    }

    /// Change the active pattern. Custom cells are normalized; named
    /// patterns drop any custom set.
    pub fn set_pattern(&mut self, pattern: PatternId, custom: Option<Vec<usize>>) -> Result<(), StateError> {
        match pattern {
            PatternId::Custom => {
                let cells = normalize_custom(custom.as_deref().unwrap_or_default());
                if cells.is_empty() {
                    return Err(StateError::InvalidPattern(
                        "a custom pattern needs at least one cell".to_string(),
                    ));
                }
                self.state.pattern = Some(PatternId::Custom);
                self.state.custom_pattern = Some(cells);
            },
            named => {
                self.state.pattern = Some(named);
                self.state.custom_pattern = None;
            },
        }
        Ok(())
    }

    /// Review an incoming claim.
    ///
    /// Duplicates are checked first. The claim's own card and punches are
    /// then re-verified against this room's drawn balls and active pattern.
    pub fn submit_claim(&mut self, request: ClaimRequest) -> ClaimOutcome {
        if self.state.has_claim_for(&request.client_id, request.card_version) {
            return ClaimOutcome::Duplicate;
        }

        if let Err(reason) = verify(
            &request.card_numbers,
            request.punched_indexes,
            &self.state.drawn_balls,
            self.state.pattern,
            self.state.custom_pattern.as_deref(),
        ) {
            return ClaimOutcome::Rejected(reason);
        }

        let id = Uuid::new_v4().to_string();
        self.state.winners.push(WinnerClaim::pending(id.clone(), request));
        ClaimOutcome::Accepted(id)
    }

    pub fn approve(&mut self, id: &str) -> Result<&WinnerClaim, StateError> {
        self.resolve(id, ClaimStatus::Approved)
    }

    pub fn reject(&mut self, id: &str) -> Result<&WinnerClaim, StateError> {
        self.resolve(id, ClaimStatus::Rejected)
    }

    fn resolve(&mut self, id: &str, next: ClaimStatus) -> Result<&WinnerClaim, StateError> {
        let claim = self
            .state
            .winners
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| StateError::ClaimNotFound(id.to_string()))?;
        if !claim.status.can_become(next) {
            return Err(StateError::ClaimNotPending {
                id: id.to_string(),
                status: claim.status,
            });
        }
        claim.status = next;
        Ok(claim)
    }

    /// Clear the round and bump the fencing token. The pattern survives.
    pub fn reset(&mut self) -> u64 {
        self.state = RoomState {
            pattern: self.state.pattern,
            custom_pattern: self.state.custom_pattern.take(),
            reset_count: self.state.reset_count + 1,
            ..RoomState::default()
        };
        self.state.reset_count
    }
}

/// A player's read-only copy of the room
#[derive(Debug, Clone, Default)]
pub struct Replica {
    state: Option<RoomState>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole document. Returns the previous one.
    pub fn replace(&mut self, next: RoomState) -> Option<RoomState> {
        self.state.replace(next)
    }

    pub fn get(&self) -> Option<&RoomState> {
        self.state.as_ref()
    }

    /// A `state` event has been received
    pub fn is_converged(&self) -> bool {
        self.state.is_some()
    }
}
