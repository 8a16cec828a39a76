//! The replicated room document and win claims.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::card::{Card, PunchSet};
use crate::pattern::{required_cells, PatternId};
use crate::{Ball, MAX_BALL};

/// The single authoritative document per room.
///
/// Written only by the host; every other client holds a replaced-whole copy.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomState {
    /// Call order, no duplicates, at most 75 entries.
    pub drawn_balls: Vec<Ball>,
    pub current_ball: Option<Ball>,
    pub pattern: Option<PatternId>,
    /// Only meaningful when `pattern` is `custom`.
    pub custom_pattern: Option<Vec<usize>>,
    pub winners: Vec<WinnerClaim>,
    pub is_drawing: bool,
    /// Fencing token, bumped on every reset.
    pub reset_count: u64,
}

impl RoomState {
    pub fn is_drawn(&self, ball: Ball) -> bool {
        self.drawn_balls.contains(&ball)
    }

    /// All 75 balls are out.
    pub fn is_exhausted(&self) -> bool {
        self.drawn_balls.len() >= usize::from(MAX_BALL)
    }

    pub fn required_cells(&self) -> &[usize] {
        required_cells(self.pattern, self.custom_pattern.as_deref())
    }

    /// A pattern is set and requires at least one cell.
    pub fn has_active_pattern(&self) -> bool {
        !self.required_cells().is_empty()
    }

    pub fn winner(&self, id: &str) -> Option<&WinnerClaim> {
        self.winners.iter().find(|w| w.id == id)
    }

    /// Any claim, whatever its status, for this card of this client.
    pub fn has_claim_for(&self, client_id: &str, card_version: u32) -> bool {
        self.winners
            .iter()
            .any(|w| w.client_id == client_id && w.card_version == card_version)
    }

    pub fn pending_claims(&self) -> impl Iterator<Item = &WinnerClaim> {
        self.winners.iter().filter(|w| w.status == ClaimStatus::Pending)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Pending,
    Approved,
    Rejected,
}

impl ClaimStatus {
    /// Only pending claims may be resolved; resolved claims are final.
    pub fn can_become(self, next: ClaimStatus) -> bool {
        matches!(
            (self, next),
            (ClaimStatus::Pending, ClaimStatus::Approved) | (ClaimStatus::Pending, ClaimStatus::Rejected)
        )
    }
}

/// A claim as submitted by a player. The host assigns `id` and `status`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub username: String,
    pub client_id: String,
    pub card_version: u32,
    pub claimed_at: DateTime<Utc>,
    /// The draw that completed the pattern.
    pub ball_number: Option<Ball>,
    pub pattern: Option<PatternId>,
    #[serde(default)]
    pub custom_pattern: Option<Vec<usize>>,
    pub card_numbers: Card,
    pub punched_indexes: PunchSet,
}

/// A claim accepted into `RoomState::winners`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WinnerClaim {
    pub id: String,
    pub username: String,
    pub client_id: String,
    pub card_version: u32,
    pub claimed_at: DateTime<Utc>,
    pub ball_number: Option<Ball>,
    pub pattern: Option<PatternId>,
    #[serde(default)]
    pub custom_pattern: Option<Vec<usize>>,
    pub status: ClaimStatus,
    pub card_numbers: Card,
    pub punched_indexes: PunchSet,
}

impl WinnerClaim {
    /// Admit a request as a new pending claim.
    pub fn pending(id: String, request: ClaimRequest) -> Self {
        let ClaimRequest {
            username,
            client_id,
            card_version,
            claimed_at,
            ball_number,
            pattern,
            custom_pattern,
            card_numbers,
            punched_indexes,
        } = request;

        WinnerClaim {
            id,
            username,
            client_id,
            card_version,
            claimed_at,
            ball_number,
            pattern,
            custom_pattern,
            status: ClaimStatus::Pending,
            card_numbers,
            punched_indexes,
        }
    }
}
