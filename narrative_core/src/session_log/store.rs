//! Durable session records.
//!
//! One JSON document per session. File writes go to a temporary sibling, are
//! synced, then renamed over the target so readers never see a partial record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{Session, SessionId};
use crate::error::StoreError;

/// Listing entry for a stored session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionListing {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub scene_count: usize,
}

/// Storage backend for session records.
pub trait SessionStore: Send + Sync {
    /// Durably replace the record for `session.id`.
    fn save(&self, session: &Session) -> Result<(), StoreError>;

    /// Read the record for `id`, or `None` if there is none.
    fn load(&self, id: SessionId) -> Result<Option<Session>, StoreError>;

    /// Every readable record, newest first.
    fn list(&self) -> Result<Vec<SessionListing>, StoreError>;
}

fn encode(session: &Session) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(session).map_err(|e| StoreError::Serialize(e.to_string()))
}

fn decode(raw: &[u8]) -> Result<Session, StoreError> {
    serde_json::from_slice(raw).map_err(|e| StoreError::Unparseable(e.to_string()))
}

fn sort_newest_first(listings: &mut [SessionListing]) {
    listings.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
}

/// Stores each session as `<session-id>.json` inside a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn temp_path_for(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!(".{}.json.tmp", id))
    }
}

impl SessionStore for JsonFileStore {
    fn save(&self, session: &Session) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;

        let bytes = encode(session)?;
        let tmp_path = self.temp_path_for(session.id);
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(&bytes)?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        fs::rename(&tmp_path, self.path_for(session.id))?;
        Ok(())
    }

    fn load(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        decode(&raw).map(Some)
    }

    fn list(&self) -> Result<Vec<SessionListing>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut listings = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(raw) = fs::read(&path) else {
                continue;
            };
            let Ok(session) = decode(&raw) else {
                tracing::debug!(path = %path.display(), "skipping unreadable session record");
                continue;
            };
            listings.push(SessionListing {
                session_id: session.id,
                created_at: session.created_at,
                scene_count: session.scenes.len(),
            });
        }

        sort_newest_first(&mut listings);
        Ok(listings)
    }
}

/// In-process store, mainly for tests.
///
/// Records are kept serialized so that every save exercises the same encoding
/// as the file store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<SessionId, Vec<u8>>>,
    reject_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent saves fail with [`StoreError::WriteRejected`].
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Store raw bytes for `id`, bypassing encoding.
    pub fn insert_raw(&self, id: SessionId, raw: impl Into<Vec<u8>>) {
        self.lock().insert(id, raw.into());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Vec<u8>>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for MemoryStore {
    fn save(&self, session: &Session) -> Result<(), StoreError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected);
        }
        let bytes = encode(session)?;
        self.lock().insert(session.id, bytes);
        Ok(())
    }

    fn load(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        match self.lock().get(&id) {
            Some(raw) => decode(raw).map(Some),
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<SessionListing>, StoreError> {
        let mut listings: Vec<_> = self
            .lock()
            .values()
            .filter_map(|raw| decode(raw).ok())
            .map(|s| SessionListing {
                session_id: s.id,
                created_at: s.created_at,
                scene_count: s.scenes.len(),
            })
            .collect();
        sort_newest_first(&mut listings);
        Ok(listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("sessions"));
        let session = Session::new(SessionId::new(), Utc::now());

        store.save(&session).unwrap();
        let loaded = store.load(session.id).unwrap().unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn test_file_store_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let session = Session::new(SessionId::new(), Utc::now());
        store.save(&session).unwrap();
        store.save(&session).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.json", session.id)]);
    }

    #[test]
    fn test_file_store_missing_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load(SessionId::new()).unwrap().is_none());
    }

    #[test]
    fn test_file_store_unparseable_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let id = SessionId::new();
        fs::write(store.path_for(id), b"{ not json").unwrap();
        assert!(matches!(store.load(id), Err(StoreError::Unparseable(_))));
    }

    #[test]
    fn test_list_skips_garbage_and_sorts_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let now = Utc::now();
        let older = Session::new(SessionId::new(), now - Duration::hours(1));
        let newer = Session::new(SessionId::new(), now);
        store.save(&older).unwrap();
        store.save(&newer).unwrap();
        fs::write(dir.path().join("broken.json"), b"nope").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].session_id, newer.id);
        assert_eq!(listed[1].session_id, older.id);
    }

    #[test]
    fn test_memory_store_rejects_writes_on_demand() {
        let store = MemoryStore::new();
        let session = Session::new(SessionId::new(), Utc::now());
        store.set_reject_writes(true);
        assert!(matches!(store.save(&session), Err(StoreError::WriteRejected)));
        assert!(store.is_empty());

        store.set_reject_writes(false);
        store.save(&session).unwrap();
        assert_eq!(store.load(session.id).unwrap(), Some(session));
    }
}
