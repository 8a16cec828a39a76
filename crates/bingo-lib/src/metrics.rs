// ==============
// crates/bingo-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_DISCONNECTION: &str = "ws.disconnection";
pub const WS_ACTIVE: &str = "ws.active";
pub const HUB_CHANNELS: &str = "hub.channels";
pub const HUB_BROADCAST: &str = "hub.broadcast";
pub const HUB_DROPPED: &str = "hub.dropped";
pub const DRAW_COMMITTED: &str = "room.draw.committed";
pub const ROOM_RESET: &str = "room.reset";
pub const CLAIM_ACCEPTED: &str = "claim.accepted";
pub const CLAIM_DUPLICATE: &str = "claim.duplicate";
pub const CLAIM_REJECTED: &str = "claim.rejected";
pub const PERSIST_FAILED: &str = "persist.failed";
