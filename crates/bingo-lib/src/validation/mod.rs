// ============================
// crates/bingo-lib/src/validation/mod.rs
// ============================
//! Room id, channel and name validation.

use rand::Rng;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

const ROOM_ID_LENGTH: usize = 6;
const MAX_ROOM_ID_LENGTH: usize = 32;
const MAX_USERNAME_LENGTH: usize = 32;
const MAX_PRESENCE_KEY_LENGTH: usize = 64;
const ROOM_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Prefix of every room channel name
pub const CHANNEL_PREFIX: &str = "bingo:room-";

static ROOM_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").unwrap());
static PRESENCE_KEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Possible validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid room ID: {0}")]
    InvalidRoomId(String),

    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    #[error("Invalid presence key: {0}")]
    InvalidPresenceKey(String),

    #[error("Invalid channel name: {0}")]
    InvalidChannel(String),
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate a room ID
pub fn validate_room_id(room_id: &str) -> ValidationResult<&str> {
    if room_id.is_empty() {
        return Err(ValidationError::InvalidRoomId(
            "Room ID must not be empty".to_string(),
        ));
    }

    if room_id.len() > MAX_ROOM_ID_LENGTH {
        return Err(ValidationError::InvalidRoomId(format!(
            "Room ID cannot exceed {MAX_ROOM_ID_LENGTH} characters"
        )));
    }

    if !ROOM_ID_REGEX.is_match(room_id) {
        return Err(ValidationError::InvalidRoomId(
            "Room ID must contain only lowercase letters, digits and hyphens".to_string(),
        ));
    }

    Ok(room_id)
}

/// Validate a display name, returning it trimmed
pub fn validate_username(username: &str) -> ValidationResult<&str> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidUsername(
            "Username must not be empty".to_string(),
        ));
    }

    if trimmed.chars().count() > MAX_USERNAME_LENGTH {
        return Err(ValidationError::InvalidUsername(format!(
            "Username cannot exceed {MAX_USERNAME_LENGTH} characters"
        )));
    }

    if trimmed.chars().any(char::is_control) {
        return Err(ValidationError::InvalidUsername(
            "Username must not contain control characters".to_string(),
        ));
    }

    Ok(trimmed)
}

/// Validate a presence key (the client identity)
pub fn validate_presence_key(key: &str) -> ValidationResult<&str> {
    if key.is_empty() || key.len() > MAX_PRESENCE_KEY_LENGTH || !PRESENCE_KEY_REGEX.is_match(key) {
        return Err(ValidationError::InvalidPresenceKey(key.to_string()));
    }
    Ok(key)
}

/// Validate a channel name and return the room it belongs to
pub fn validate_channel(channel: &str) -> ValidationResult<&str> {
    let room_id = channel
        .strip_prefix(CHANNEL_PREFIX)
        .ok_or_else(|| ValidationError::InvalidChannel(channel.to_string()))?;
    validate_room_id(room_id).map_err(|_| ValidationError::InvalidChannel(channel.to_string()))
}

/// Channel carrying a room's events and presence
pub fn channel_name(room_id: &str) -> String {
    format!("{CHANNEL_PREFIX}{room_id}")
}

/// Random six character base36 room id
pub fn generate_room_id() -> String {
    let mut rng = rand::rng();
    (0..ROOM_ID_LENGTH)
        .map(|_| char::from(ROOM_ID_ALPHABET[rng.random_range(0..ROOM_ID_ALPHABET.len())]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_room_id() {
        assert!(validate_room_id("abc123").is_ok());
        assert!(validate_room_id("friday-night").is_ok());
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("ABC123").is_err());
        assert!(validate_room_id("room/../etc").is_err());
        assert!(validate_room_id(&"a".repeat(33)).is_err());
    }

    #[test]
    fn test_validate_username() {
        assert_eq!(validate_username("  Ada  ").unwrap(), "Ada");
        assert!(validate_username("   ").is_err());
        assert!(validate_username("bad\u{7}name").is_err());
        assert!(validate_username(&"x".repeat(33)).is_err());
    }

    #[test]
    fn test_channel_names() {
        let channel = channel_name("abc123");
        assert_eq!(channel, "bingo:room-abc123");
        assert_eq!(validate_channel(&channel).unwrap(), "abc123");
        assert!(validate_channel("other:abc123").is_err());
        assert!(validate_channel("bingo:room-").is_err());
    }

    #[test]
    fn test_presence_keys() {
        assert!(validate_presence_key("6f1c2e8a-4b7d-4e0f-9a51-2c3d4e5f6a7b").is_ok());
        assert!(validate_presence_key("").is_err());
        assert!(validate_presence_key("has space").is_err());
    }

    #[test]
    fn test_generate_room_id() {
        for _ in 0..50 {
            let id = generate_room_id();
            assert_eq!(id.len(), ROOM_ID_LENGTH);
            assert!(validate_room_id(&id).is_ok());
        }
    }
}
