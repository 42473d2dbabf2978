//! Persistence of generated units and the story context.
//!
//! Documents are JSON wrapped in a versioned envelope so a store written by
//! an incompatible build is refused rather than misread.

use crate::path::UnitKey;
use crate::state::StoryContext;
use crate::unit::GeneratedUnit;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::fs;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Current document version.
pub const STORE_VERSION: u32 = 1;

/// Sequence for temporary file names; concurrent writes never share one.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A stored document with its format version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    /// RFC 3339 timestamp of the write.
    pub saved_at: String,
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            version: STORE_VERSION,
            saved_at: chrono::Utc::now().to_rfc3339(),
            payload,
        }
    }

    fn checked(self) -> Result<T, PersistError> {
        if self.version != STORE_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: STORE_VERSION,
                found: self.version,
            });
        }
        Ok(self.payload)
    }
}

/// Where units and the story context are kept.
#[async_trait]
pub trait StoryStore: Send + Sync {
    /// A previously saved unit, if any.
    async fn load_unit(&self, key: &UnitKey) -> Result<Option<GeneratedUnit>, PersistError>;

    async fn save_unit(&self, key: &UnitKey, unit: &GeneratedUnit) -> Result<(), PersistError>;

    /// The saved context, if any.
    async fn load_context(&self) -> Result<Option<StoryContext>, PersistError>;

    async fn save_context(&self, context: &StoryContext) -> Result<(), PersistError>;
}

// =============================================================================
// JSON directory store
// =============================================================================

/// Stores each unit as its own JSON file next to a single context file.
///
/// ```text
/// root/
///   context.json
///   units/
///     001A_ROOT.json
///     002A_A.json
/// ```
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    root: PathBuf,
}

impl JsonDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn unit_path(&self, key: &UnitKey) -> PathBuf {
        let name = key.as_str().replace(':', "_");
        self.root.join("units").join(format!("{name}.json"))
    }

    fn context_path(&self) -> PathBuf {
        self.root.join("context.json")
    }

    async fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistError> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: Envelope<T> = serde_json::from_str(&content)?;
        envelope.checked().map(Some)
    }

    /// Write via a temporary sibling and rename, so readers never see half a file.
    async fn write<T: Serialize>(path: &Path, payload: &T) -> Result<(), PersistError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(&Envelope::new(payload))?;
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("json.{}.{seq}.tmp", std::process::id()));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl StoryStore for JsonDirStore {
    async fn load_unit(&self, key: &UnitKey) -> Result<Option<GeneratedUnit>, PersistError> {
        Self::read(&self.unit_path(key)).await
    }

    async fn save_unit(&self, key: &UnitKey, unit: &GeneratedUnit) -> Result<(), PersistError> {
        Self::write(&self.unit_path(key), unit).await
    }

    async fn load_context(&self) -> Result<Option<StoryContext>, PersistError> {
        Self::read(&self.context_path()).await
    }

    async fn save_context(&self, context: &StoryContext) -> Result<(), PersistError> {
        Self::write(&self.context_path(), context).await
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// A store that keeps everything in memory.
///
/// Writes can be made to fail, to exercise the engine's handling of a
/// broken store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    units: Mutex<HashMap<UnitKey, GeneratedUnit>>,
    context: Mutex<Option<StoryContext>>,
    fail_writes: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a unit as if it had been generated earlier.
    pub fn with_unit(self, key: UnitKey, unit: GeneratedUnit) -> Self {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, unit);
        self
    }

    /// Make every subsequent write fail with an IO error.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap_or_else(PoisonError::into_inner) = fail;
    }

    pub fn unit_count(&self) -> usize {
        self.units.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// The last saved context.
    pub fn saved_context(&self) -> Option<StoryContext> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn check_writable(&self) -> Result<(), PersistError> {
        if *self.fail_writes.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(std::io::Error::new(ErrorKind::Other, "store is read-only").into());
        }
        Ok(())
    }
}

#[async_trait]
impl StoryStore for MemoryStore {
    async fn load_unit(&self, key: &UnitKey) -> Result<Option<GeneratedUnit>, PersistError> {
        Ok(self
            .units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn save_unit(&self, key: &UnitKey, unit: &GeneratedUnit) -> Result<(), PersistError> {
        self.check_writable()?;
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), unit.clone());
        Ok(())
    }

    async fn load_context(&self) -> Result<Option<StoryContext>, PersistError> {
        Ok(self.saved_context())
    }

    async fn save_context(&self, context: &StoryContext) -> Result<(), PersistError> {
        self.check_writable()?;
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = Some(context.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{BranchKey, CaseNumber};

    fn sample_unit() -> (UnitKey, GeneratedUnit) {
        let case = CaseNumber::new(1, 1).unwrap();
        let branch = BranchKey::root();
        let unit = GeneratedUnit::from_payload(
            serde_json::json!({"title": "Cold Open", "narrative": "Fog over the harbor."}),
            case,
            &branch,
        )
        .unwrap();
        (UnitKey::new(case, &branch), unit)
    }

    #[tokio::test]
    async fn test_json_dir_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        let (key, unit) = sample_unit();

        assert!(store.load_unit(&key).await.unwrap().is_none());
        store.save_unit(&key, &unit).await.unwrap();
        assert_eq!(store.load_unit(&key).await.unwrap(), Some(unit));
        assert!(dir.path().join("units").join("001A_ROOT.json").exists());
    }

    #[tokio::test]
    async fn test_version_mismatch_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        let stale = serde_json::json!({
            "version": STORE_VERSION + 1,
            "saved_at": "2020-01-01T00:00:00Z",
            "payload": StoryContext::new()
        });
        tokio::fs::write(dir.path().join("context.json"), stale.to_string())
            .await
            .unwrap();

        let err = store.load_context().await.unwrap_err();
        assert!(matches!(err, PersistError::VersionMismatch { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_context_saves_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(JsonDirStore::new(dir.path()));

        let saves = (0..16).map(|i| {
            let store = std::sync::Arc::clone(&store);
            tokio::spawn(async move {
                let mut context = StoryContext::new();
                context.consequences.insert(
                    format!("{i:03}C:A"),
                    crate::consequence::Consequence {
                        immediate: format!("save {i}"),
                        ongoing: vec![],
                        character_impact: Default::default(),
                    },
                );
                store.save_context(&context).await
            })
        });
        for result in futures::future::join_all(saves).await {
            result.unwrap().unwrap();
        }

        let loaded = store.load_context().await.unwrap().unwrap();
        assert_eq!(loaded.consequences.len(), 1);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn test_memory_store_write_failure() {
        let store = MemoryStore::new();
        let (key, unit) = sample_unit();
        store.set_fail_writes(true);
        assert!(store.save_unit(&key, &unit).await.is_err());
        store.set_fail_writes(false);
        store.save_unit(&key, &unit).await.unwrap();
        assert_eq!(store.unit_count(), 1);
    }
}
