//! Per-device key-value storage.
//!
//! [`LocalStore`] is the raw port: string values under composite keys.
//! [`DeviceStore`] layers typed accessors on top and treats anything it
//! cannot parse as absent.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bingo_common::{PunchSet, RoomState};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

/// Every key a device stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalKey<'a> {
    ClientId,
    DisplayName,
    /// Host's last known state of a room
    CachedRoom { room_id: &'a str },
    Punches { room_id: &'a str, client_id: &'a str, card_version: u32 },
    Claimed { room_id: &'a str, client_id: &'a str, card_version: u32 },
    CardVersion { room_id: &'a str, client_id: &'a str },
    LastResetSeen { room_id: &'a str, client_id: &'a str },
    AnnouncedWinners { room_id: &'a str },
}

impl LocalKey<'_> {
    pub fn storage_key(&self) -> String {
        match self {
            LocalKey::ClientId => "bingo_client_id".to_string(),
            LocalKey::DisplayName => "bingo_username".to_string(),
            LocalKey::CachedRoom { room_id } => format!("game:{room_id}"),
            LocalKey::Punches { room_id, client_id, card_version } => {
                format!("punches:{room_id}:{client_id}:{card_version}")
            },
            LocalKey::Claimed { room_id, client_id, card_version } => {
                format!("claimed:{room_id}:{client_id}:{card_version}")
            },
            LocalKey::CardVersion { room_id, client_id } => {
                format!("card_version:{room_id}:{client_id}")
            },
            LocalKey::LastResetSeen { room_id, client_id } => {
                format!("reset_seen:{room_id}:{client_id}")
            },
            LocalKey::AnnouncedWinners { room_id } => format!("announced:{room_id}"),
        }
    }
}

/// Raw device storage. Implementations swallow their own I/O failures.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn delete(&self, key: &str);
}

#[derive(Default)]
pub struct MemoryLocalStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries.lock().insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// All keys in one JSON object on disk, rewritten on every change.
pub struct FileLocalStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileLocalStore {
    /// Open `path`, starting empty if it is missing or unreadable.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "device store is corrupt, starting fresh");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    /// Write to a sibling tmp file, then rename over the real one.
    fn persist(&self, entries: &BTreeMap<String, String>) {
        let result = serde_json::to_string_pretty(entries)
            .map_err(std::io::Error::from)
            .and_then(|json| {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let tmp = self.tmp_path();
                std::fs::write(&tmp, json)?;
                std::fs::rename(&tmp, &self.path)
            });
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "device store write failed");
        }
    }
}

impl LocalStore for FileLocalStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value);
        self.persist(&entries);
    }

    fn delete(&self, key: &str) {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.persist(&entries);
        }
    }
}

/// Typed view of a device's storage
#[derive(Clone)]
pub struct DeviceStore {
    store: Arc<dyn LocalStore>,
}

impl DeviceStore {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLocalStore::new()))
    }

    fn read<T: DeserializeOwned>(&self, key: LocalKey<'_>) -> Option<T> {
        let storage_key = key.storage_key();
        let raw = self.store.get(&storage_key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %storage_key, error = %e, "malformed local value, using default");
                None
            },
        }
    }

    fn write<T: Serialize>(&self, key: LocalKey<'_>, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => self.store.set(&key.storage_key(), json),
            Err(e) => warn!(error = %e, "could not encode local value"),
        }
    }

    fn remove(&self, key: LocalKey<'_>) {
        self.store.delete(&key.storage_key());
    }

    /// Stable device identity, created on first use
    pub fn client_id(&self) -> String {
        if let Some(id) = self.read::<String>(LocalKey::ClientId) {
            if !id.is_empty() {
                return id;
            }
        }
        let id = Uuid::new_v4().to_string();
        self.write(LocalKey::ClientId, &id);
        id
    }

    pub fn display_name(&self) -> Option<String> {
        self.read(LocalKey::DisplayName)
    }

    pub fn set_display_name(&self, name: &str) {
        self.write(LocalKey::DisplayName, &name);
    }

    pub fn cached_room(&self, room_id: &str) -> Option<RoomState> {
        self.read(LocalKey::CachedRoom { room_id })
    }

    pub fn cache_room(&self, room_id: &str, state: &RoomState) {
        self.write(LocalKey::CachedRoom { room_id }, state);
    }

    /// Punched cells, or just the free center when nothing valid is stored
    pub fn punches(&self, room_id: &str, client_id: &str, card_version: u32) -> PunchSet {
        self.read::<Vec<bool>>(LocalKey::Punches { room_id, client_id, card_version })
            .and_then(|flags| PunchSet::from_flags(&flags))
            .map(|mut set| {
                set.insert(bingo_common::FREE_CELL);
                set
            })
            .unwrap_or_else(PunchSet::with_free)
    }

    pub fn set_punches(&self, room_id: &str, client_id: &str, card_version: u32, punched: PunchSet) {
        self.write(
            LocalKey::Punches { room_id, client_id, card_version },
            &punched.to_flags(),
        );
    }

    pub fn is_claimed(&self, room_id: &str, client_id: &str, card_version: u32) -> bool {
        self.read(LocalKey::Claimed { room_id, client_id, card_version })
            .unwrap_or(false)
    }

    pub fn set_claimed(&self, room_id: &str, client_id: &str, card_version: u32, claimed: bool) {
        let key = LocalKey::Claimed { room_id, client_id, card_version };
        if claimed {
            self.write(key, &true);
        } else {
            self.remove(key);
        }
    }

    /// Card version for this room, starting at 1
    pub fn card_version(&self, room_id: &str, client_id: &str) -> u32 {
        self.read::<u32>(LocalKey::CardVersion { room_id, client_id })
            .filter(|v| *v >= 1)
            .unwrap_or(1)
    }

    pub fn set_card_version(&self, room_id: &str, client_id: &str, card_version: u32) {
        self.write(LocalKey::CardVersion { room_id, client_id }, &card_version);
    }

    pub fn last_reset_seen(&self, room_id: &str, client_id: &str) -> Option<u64> {
        self.read(LocalKey::LastResetSeen { room_id, client_id })
    }

    pub fn set_last_reset_seen(&self, room_id: &str, client_id: &str, reset_count: u64) {
        self.write(LocalKey::LastResetSeen { room_id, client_id }, &reset_count);
    }

    pub fn announced(&self, room_id: &str) -> BTreeSet<String> {
        self.read(LocalKey::AnnouncedWinners { room_id }).unwrap_or_default()
    }

    /// Record a winner id as shown. Returns false if it already was.
    pub fn mark_announced(&self, room_id: &str, winner_id: &str) -> bool {
        let mut announced = self.announced(room_id);
        let fresh = announced.insert(winner_id.to_string());
        if fresh {
            self.write(LocalKey::AnnouncedWinners { room_id }, &announced);
        }
        fresh
    }
}
