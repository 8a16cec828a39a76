// ============================
// bingo-lib/src/storage.rs
// ============================
//! Persistence port for room snapshots and the bingo call log.
//!
//! `FlatFileStorage` backs the relay's REST routes, `HttpStorage` is the
//! client side of those routes and `MemoryStorage` serves tests. Hosts never
//! call a repository directly: they go through [`BestEffort`], which turns
//! every failure into a logged cache miss and keeps writes off the broadcast
//! path.
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bingo_common::{PatternId, RoomState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::{fs as tokio_fs, io::AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::metrics::PERSIST_FAILED;

/// Store timeout when none is configured
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(3);

/// One approved bingo, appended to the room's call log
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BingoCall {
    /// Id of the approved winner entry
    pub id: String,
    pub room_id: String,
    pub username: String,
    pub card_version: u32,
    pub pattern: Option<PatternId>,
    pub called_at: DateTime<Utc>,
}

/// Trait for room persistence backends
#[async_trait]
pub trait RoomRepository: Send + Sync {
    /// Last saved snapshot, if any
    async fn fetch(&self, room_id: &str) -> Result<Option<RoomState>, AppError>;

    /// Upsert the snapshot
    async fn save(&self, room_id: &str, state: &RoomState) -> Result<(), AppError>;

    /// Drop the snapshot; the call log is kept
    async fn clear(&self, room_id: &str) -> Result<(), AppError>;

    /// Whether a snapshot exists
    async fn exists(&self, room_id: &str) -> Result<bool, AppError>;

    /// Append to the call log
    async fn record_call(&self, room_id: &str, call: &BingoCall) -> Result<(), AppError>;

    /// Call log in append order
    async fn list_calls(&self, room_id: &str) -> Result<Vec<BingoCall>, AppError>;
}

/// Flat-file implementation: `games/<room>.json` and `calls/<room>.log`
#[derive(Clone)]
pub struct FlatFileStorage {
    root: PathBuf,
}

impl FlatFileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("games"))?;
        std::fs::create_dir_all(root.join("calls"))?;
        Ok(Self { root })
    }

    fn game_path(&self, room_id: &str) -> PathBuf {
        self.root.join("games").join(format!("{room_id}.json"))
    }

    fn calls_path(&self, room_id: &str) -> PathBuf {
        self.root.join("calls").join(format!("{room_id}.log"))
    }
}

#[async_trait]
impl RoomRepository for FlatFileStorage {
    async fn fetch(&self, room_id: &str) -> Result<Option<RoomState>, AppError> {
        let path = self.game_path(room_id);
        if !path.exists() {
            return Ok(None);
        }

        let content = tokio_fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write to a sibling temp file and rename over the snapshot.
    async fn save(&self, room_id: &str, state: &RoomState) -> Result<(), AppError> {
        let path = self.game_path(room_id);
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(state)?;
        tokio_fs::write(&tmp, json).await?;
        tokio_fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn clear(&self, room_id: &str) -> Result<(), AppError> {
        match tokio_fs::remove_file(self.game_path(room_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, room_id: &str) -> Result<bool, AppError> {
        Ok(tokio_fs::try_exists(self.game_path(room_id)).await?)
    }

    async fn record_call(&self, room_id: &str, call: &BingoCall) -> Result<(), AppError> {
        let mut file = tokio_fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.calls_path(room_id))
            .await
            .map_err(AppError::from)?;

        let json = serde_json::to_string(call)?;
        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    async fn list_calls(&self, room_id: &str) -> Result<Vec<BingoCall>, AppError> {
        let path = self.calls_path(room_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = tokio_fs::read_to_string(&path).await?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(AppError::from))
            .collect()
    }
}

/// In-memory implementation with a switch to simulate an unreachable store
#[derive(Clone, Default)]
pub struct MemoryStorage {
    games: Arc<DashMap<String, RoomState>>,
    calls: Arc<DashMap<String, Vec<BingoCall>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current snapshot, bypassing the availability switch
    pub fn snapshot(&self, room_id: &str) -> Option<RoomState> {
        self.games.get(room_id).map(|entry| entry.value().clone())
    }

    fn check(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Internal("storage unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RoomRepository for MemoryStorage {
    async fn fetch(&self, room_id: &str) -> Result<Option<RoomState>, AppError> {
        self.check()?;
        Ok(self.snapshot(room_id))
    }

    async fn save(&self, room_id: &str, state: &RoomState) -> Result<(), AppError> {
        self.check()?;
        self.games.insert(room_id.to_string(), state.clone());
        Ok(())
    }

    async fn clear(&self, room_id: &str) -> Result<(), AppError> {
        self.check()?;
        self.games.remove(room_id);
        Ok(())
    }

    async fn exists(&self, room_id: &str) -> Result<bool, AppError> {
        self.check()?;
        Ok(self.games.contains_key(room_id))
    }

    async fn record_call(&self, room_id: &str, call: &BingoCall) -> Result<(), AppError> {
        self.check()?;
        self.calls.entry(room_id.to_string()).or_default().push(call.clone());
        Ok(())
    }

    async fn list_calls(&self, room_id: &str) -> Result<Vec<BingoCall>, AppError> {
        self.check()?;
        Ok(self.calls.get(room_id).map(|c| c.value().clone()).unwrap_or_default())
    }
}

#[derive(Deserialize)]
struct ExistsBody {
    exists: bool,
}

/// Client of the relay's `/api/rooms` routes
#[derive(Clone)]
pub struct HttpStorage {
    client: reqwest::Client,
    base: String,
}

impl HttpStorage {
    /// `timeout` bounds every request, connecting included.
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base: server_url.trim_end_matches('/').to_string(),
        })
    }

    fn room_url(&self, room_id: &str) -> String {
        format!("{}/api/rooms/{room_id}", self.base)
    }
}

#[async_trait]
impl RoomRepository for HttpStorage {
    async fn fetch(&self, room_id: &str) -> Result<Option<RoomState>, AppError> {
        let resp = self.client.get(self.room_url(room_id)).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(resp.error_for_status()?.json().await?))
    }

    async fn save(&self, room_id: &str, state: &RoomState) -> Result<(), AppError> {
        self.client
            .put(self.room_url(room_id))
            .json(state)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn clear(&self, room_id: &str) -> Result<(), AppError> {
        self.client
            .delete(self.room_url(room_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn exists(&self, room_id: &str) -> Result<bool, AppError> {
        let body: ExistsBody = self
            .client
            .get(format!("{}/exists", self.room_url(room_id)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.exists)
    }

    async fn record_call(&self, room_id: &str, call: &BingoCall) -> Result<(), AppError> {
        self.client
            .post(format!("{}/calls", self.room_url(room_id)))
            .json(call)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn list_calls(&self, room_id: &str) -> Result<Vec<BingoCall>, AppError> {
        Ok(self
            .client
            .get(format!("{}/calls", self.room_url(room_id)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

enum Write {
    Save(String, RoomState),
    Clear(String),
    Call(String, BingoCall),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget front for a repository.
///
/// Reads log and degrade to "absent". Writes are queued to a single writer
/// task, so they land in submission order and never hold up the caller.
/// Every call into the repository is cut off after the store timeout.
#[derive(Clone)]
pub struct BestEffort {
    inner: Arc<dyn RoomRepository>,
    writes: mpsc::UnboundedSender<Write>,
    timeout: Duration,
}

impl BestEffort {
    /// Must be called inside a tokio runtime.
    pub fn new(inner: Arc<dyn RoomRepository>) -> Self {
        Self::with_timeout(inner, DEFAULT_STORE_TIMEOUT)
    }

    pub fn with_timeout(inner: Arc<dyn RoomRepository>, timeout: Duration) -> Self {
        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(inner.clone(), rx, timeout));
        Self { inner, writes, timeout }
    }

    pub async fn fetch(&self, room_id: &str) -> Option<RoomState> {
        match bounded(self.timeout, "fetch", self.inner.fetch(room_id)).await {
            Ok(state) => state,
            Err(e) => {
                warn!(room_id, error = %e, "room fetch failed, continuing without it");
                counter!(PERSIST_FAILED).increment(1);
                None
            },
        }
    }

    pub async fn exists(&self, room_id: &str) -> bool {
        bounded(self.timeout, "exists", self.inner.exists(room_id))
            .await
            .unwrap_or_else(|e| {
                warn!(room_id, error = %e, "room existence check failed");
                false
            })
    }

    pub async fn list_calls(&self, room_id: &str) -> Vec<BingoCall> {
        bounded(self.timeout, "list_calls", self.inner.list_calls(room_id))
            .await
            .unwrap_or_else(|e| {
                warn!(room_id, error = %e, "call log fetch failed");
                Vec::new()
            })
    }

    pub fn save(&self, room_id: &str, state: RoomState) {
        self.enqueue(Write::Save(room_id.to_string(), state));
    }

    pub fn clear(&self, room_id: &str) {
        self.enqueue(Write::Clear(room_id.to_string()));
    }

    pub fn record_call(&self, room_id: &str, call: BingoCall) {
        self.enqueue(Write::Call(room_id.to_string(), call));
    }

    /// Resolves once every write queued before it has been attempted, or
    /// after the store timeout.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Write::Flush(tx));
        if tokio::time::timeout(self.timeout, rx).await.is_err() {
            warn!("persistence writer still busy, giving up on flush");
        }
    }

    fn enqueue(&self, write: Write) {
        if self.writes.send(write).is_err() {
            warn!("persistence writer stopped, dropping write");
        }
    }
}

async fn bounded<T>(
    limit: Duration,
    op: &'static str,
    call: impl Future<Output = Result<T, AppError>>,
) -> Result<T, AppError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or_else(|_| Err(AppError::Timeout(format!("room store {op} after {limit:?}"))))
}

async fn run_writer(inner: Arc<dyn RoomRepository>, mut rx: mpsc::UnboundedReceiver<Write>, limit: Duration) {
    while let Some(write) = rx.recv().await {
        let (op, room_id, result) = match write {
            Write::Save(room_id, state) => {
                let result = bounded(limit, "save", inner.save(&room_id, &state)).await;
                ("save", room_id, result)
            },
            Write::Clear(room_id) => {
                let result = bounded(limit, "clear", inner.clear(&room_id)).await;
                ("clear", room_id, result)
            },
            Write::Call(room_id, call) => {
                let result = bounded(limit, "record_call", inner.record_call(&room_id, &call)).await;
                ("record_call", room_id, result)
            },
            Write::Flush(done) => {
                let _ = done.send(());
                continue;
            },
        };

        match result {
            Ok(()) => debug!(op, room_id = %room_id, "persisted"),
            Err(e) => {
                warn!(op, room_id = %room_id, error = %e, "persistence degraded to local-only");
                counter!(PERSIST_FAILED).increment(1);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (FlatFileStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = FlatFileStorage::new(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    fn call(id: &str) -> BingoCall {
        BingoCall {
            id: id.to_string(),
            room_id: "abc123".to_string(),
            username: "ada".to_string(),
            card_version: 1,
            pattern: Some(PatternId::X),
            called_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_flat_file_snapshot_lifecycle() {
        let (storage, _temp_dir) = setup();
        assert_eq!(storage.fetch("abc123").await.unwrap(), None);
        assert!(!storage.exists("abc123").await.unwrap());

        let mut state = RoomState::default();
        state.drawn_balls = vec![5, 62];
        state.current_ball = Some(62);
        storage.save("abc123", &state).await.unwrap();

        assert!(storage.exists("abc123").await.unwrap());
        assert_eq!(storage.fetch("abc123").await.unwrap(), Some(state));

        storage.clear("abc123").await.unwrap();
        assert!(!storage.exists("abc123").await.unwrap());
        // clearing twice is fine
        storage.clear("abc123").await.unwrap();
    }

    #[tokio::test]
    async fn test_flat_file_call_log_survives_clear() {
        let (storage, _temp_dir) = setup();
        storage.record_call("abc123", &call("w1")).await.unwrap();
        storage.record_call("abc123", &call("w2")).await.unwrap();
        storage.clear("abc123").await.unwrap();

        let calls = storage.list_calls("abc123").await.unwrap();
        let ids: Vec<&str> = calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["w1", "w2"]);
        assert!(storage.list_calls("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_best_effort_swallows_failures() {
        let memory = MemoryStorage::new();
        let best_effort = BestEffort::new(Arc::new(memory.clone()));

        memory.set_unavailable(true);
        best_effort.save("abc123", RoomState::default());
        best_effort.flush().await;
        assert_eq!(best_effort.fetch("abc123").await, None);
        assert!(!best_effort.exists("abc123").await);
        assert!(memory.snapshot("abc123").is_none());

        memory.set_unavailable(false);
        let mut state = RoomState::default();
        state.reset_count = 3;
        best_effort.save("abc123", state.clone());
        best_effort.flush().await;
        assert_eq!(best_effort.fetch("abc123").await, Some(state));
    }

    #[tokio::test]
    async fn test_best_effort_keeps_write_order() {
        let memory = MemoryStorage::new();
        let best_effort = BestEffort::new(Arc::new(memory.clone()));

        let mut state = RoomState::default();
        state.drawn_balls = vec![9];
        best_effort.save("abc123", state);
        best_effort.clear("abc123");
        best_effort.record_call("abc123", call("w1"));
        best_effort.flush().await;

        assert!(memory.snapshot("abc123").is_none());
        assert_eq!(best_effort.list_calls("abc123").await.len(), 1);
    }

    /// Accepts every call and never answers
    struct StalledStorage;

    #[async_trait]
    impl RoomRepository for StalledStorage {
        async fn fetch(&self, _: &str) -> Result<Option<RoomState>, AppError> {
            std::future::pending().await
        }

        async fn save(&self, _: &str, _: &RoomState) -> Result<(), AppError> {
            std::future::pending().await
        }

        async fn clear(&self, _: &str) -> Result<(), AppError> {
            std::future::pending().await
        }

        async fn exists(&self, _: &str) -> Result<bool, AppError> {
            std::future::pending().await
        }

        async fn record_call(&self, _: &str, _: &BingoCall) -> Result<(), AppError> {
            std::future::pending().await
        }

        async fn list_calls(&self, _: &str) -> Result<Vec<BingoCall>, AppError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_gives_up_on_a_stalled_store() {
        let best_effort = BestEffort::with_timeout(Arc::new(StalledStorage), Duration::from_millis(100));

        assert_eq!(best_effort.fetch("abc123").await, None);
        assert!(!best_effort.exists("abc123").await);
        assert!(best_effort.list_calls("abc123").await.is_empty());

        best_effort.save("abc123", RoomState::default());
        best_effort.record_call("abc123", call("w1"));
        best_effort.flush().await;
    }
}
