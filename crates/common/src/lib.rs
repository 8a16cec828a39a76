// ================
// common/src/lib.rs
// ================
//! Common types shared by the bingo relay and its clients.
//! Defines the room document, win claims, the verification predicate and the
//! relay wire protocol.

pub mod card;
pub mod pattern;
pub mod protocol;
pub mod room;
pub mod verify;

pub use card::{Card, PunchSet};
pub use pattern::{PatternId, UnknownPattern};
pub use protocol::{ClientFrame, PresenceMeta, RoomEvent, Role, Roster, ServerFrame};
pub use room::{ClaimRequest, ClaimStatus, RoomState, WinnerClaim};
pub use verify::{verify, ClaimRejection};

/// A called number, 1 through 75.
pub type Ball = u8;

/// Highest ball number; also the total number of balls.
pub const MAX_BALL: Ball = 75;

/// Cells on a card.
pub const GRID_CELLS: usize = 25;

/// Index of the free center cell.
pub const FREE_CELL: usize = 12;
