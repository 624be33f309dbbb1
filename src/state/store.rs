//! Durable storage for [`ProcessingRecord`]s.
//!
//! [`FileStateStore`] keeps one pretty-printed JSON file per book under
//! `records/`, so an operator can open, fix or delete a single record
//! by hand. Writes go to a uniquely named temporary file in the same
//! directory which is then renamed over the target: a crash mid-write leaves
//! either the old record or the new one, never half of each.
//!
//! [`MemoryStateStore`] is the in-process substitute used by tests; it counts
//! writes so idempotence can be asserted.

use super::record::{validate_book_id, ProcessingRecord};
use crate::error::StateError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Persistence contract for processing records.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// The record for `book_id`, or `None` when it is missing or unreadable.
    async fn load(&self, book_id: &str) -> Option<ProcessingRecord>;

    /// Persist `record`, replacing any previous version atomically.
    async fn save(&self, record: &ProcessingRecord) -> Result<(), StateError>;

    /// The record for the file at corpus-relative `location` (`dir/name`,
    /// or `name` at the top level), under its original or normalised name.
    async fn find_by_location(&self, location: &str) -> Option<ProcessingRecord>;

    /// Every readable record.
    async fn list(&self) -> Vec<ProcessingRecord>;

    /// Record files that could not be parsed and were ignored.
    fn corrupt_entries(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

// ── File-backed store ────────────────────────────────────────────────────

pub struct FileStateStore {
    dir: PathBuf,
    /// corpus-relative location → book_id, for both `standard_name` and
    /// `safe_title`.
    index: Mutex<HashMap<String, String>>,
    corrupt: Mutex<Vec<PathBuf>>,
}

impl FileStateStore {
    /// Open (creating if needed) the record directory and index its contents.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|source| StateError::Io {
            path: dir.clone(),
            source,
        })?;

        let store = Self {
            dir,
            index: Mutex::new(HashMap::new()),
            corrupt: Mutex::new(Vec::new()),
        };
        let records = store.read_all().await?;
        {
            let mut index = lock(&store.index);
            for r in &records {
                index_record(&mut index, r);
            }
        }
        debug!("state store: {} records in {}", records.len(), store.dir.display());
        Ok(store)
    }

    fn path_for(&self, book_id: &str) -> PathBuf {
        self.dir.join(format!("{book_id}.json"))
    }

    async fn read_all(&self) -> Result<Vec<ProcessingRecord>, StateError> {
        let mut entries = fs::read_dir(&self.dir).await.map_err(|source| StateError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| StateError::Io {
            path: self.dir.clone(),
            source,
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(r) = self.read_record(&path).await {
                out.push(r);
            }
        }
        Ok(out)
    }

    /// Missing → `None` silently; unreadable → `None` with a warning.
    async fn read_record(&self, path: &Path) -> Option<ProcessingRecord> {
        let bytes = match fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("state: cannot read {}: {}", path.display(), e);
                self.note_corrupt(path);
                return None;
            }
        };
        let mut record: ProcessingRecord = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    "state: ignoring malformed record {} ({}); the book will be reprocessed",
                    path.display(),
                    e
                );
                self.note_corrupt(path);
                return None;
            }
        };
        if validate_book_id(&record.book_id).is_err() {
            warn!("state: ignoring record {} with invalid book id", path.display());
            self.note_corrupt(path);
            return None;
        }
        if record.repair_ordering() {
            warn!(
                "state: record {} had a stage flag set before its dependency; later stages reset",
                record.book_id
            );
        }
        Some(record)
    }

    fn note_corrupt(&self, path: &Path) {
        let mut corrupt = lock(&self.corrupt);
        if !corrupt.iter().any(|p| p == path) {
            corrupt.push(path.to_path_buf());
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, book_id: &str) -> Option<ProcessingRecord> {
        if validate_book_id(book_id).is_err() {
            return None;
        }
        self.read_record(&self.path_for(book_id)).await
    }

    async fn save(&self, record: &ProcessingRecord) -> Result<(), StateError> {
        validate_book_id(&record.book_id)?;
        let path = self.path_for(&record.book_id);
        write_json_atomic(&path, record)
            .await
            .map_err(|e| match e {
                AtomicWriteError::Io(source) => StateError::Io { path, source },
                AtomicWriteError::Serialise(detail) => StateError::Serialise {
                    book_id: record.book_id.clone(),
                    detail,
                },
            })?;
        index_record(&mut lock(&self.index), record);
        Ok(())
    }

    async fn find_by_location(&self, location: &str) -> Option<ProcessingRecord> {
        let id = lock(&self.index).get(location).cloned()?;
        let record = self.load(&id).await?;
        // The index can be stale if a record was edited by hand.
        record.matches_location(location).then_some(record)
    }

    async fn list(&self) -> Vec<ProcessingRecord> {
        self.read_all().await.unwrap_or_else(|e| {
            warn!("state: cannot list records: {}", e);
            Vec::new()
        })
    }

    fn corrupt_entries(&self) -> Vec<PathBuf> {
        lock(&self.corrupt).clone()
    }
}

// ── In-memory store ──────────────────────────────────────────────────────

/// Volatile store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<String, ProcessingRecord>>,
    writes: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Seed a record without counting it as a write.
    pub fn insert(&self, record: ProcessingRecord) {
        lock(&self.records).insert(record.book_id.clone(), record);
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, book_id: &str) -> Option<ProcessingRecord> {
        lock(&self.records).get(book_id).cloned()
    }

    async fn save(&self, record: &ProcessingRecord) -> Result<(), StateError> {
        validate_book_id(&record.book_id)?;
        lock(&self.records).insert(record.book_id.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find_by_location(&self, location: &str) -> Option<ProcessingRecord> {
        lock(&self.records)
            .values()
            .find(|r| r.matches_location(location))
            .cloned()
    }

    async fn list(&self) -> Vec<ProcessingRecord> {
        let mut all: Vec<_> = lock(&self.records).values().cloned().collect();
        all.sort_by(|a, b| a.book_id.cmp(&b.book_id));
        all
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn index_record(index: &mut HashMap<String, String>, record: &ProcessingRecord) {
    for location in record.locations() {
        index.insert(location, record.book_id.clone());
    }
}

/// A poisoned lock only means another thread panicked mid-update of a plain
/// map; the data is still usable.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub(crate) enum AtomicWriteError {
    Io(std::io::Error),
    Serialise(String),
}

impl From<std::io::Error> for AtomicWriteError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Serialise `value` as pretty JSON and atomically replace `path`.
pub(crate) async fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), AtomicWriteError> {
    let mut data =
        serde_json::to_vec_pretty(value).map_err(|e| AtomicWriteError::Serialise(e.to_string()))?;
    data.push(b'\n');
    write_bytes_atomic(path, &data).await?;
    Ok(())
}

/// Write `data` to a temp file beside `path`, then rename it into place.
pub(crate) async fn write_bytes_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(
        ".{file_name}.tmp.{}",
        uuid::Uuid::new_v4().simple()
    ));
    if let Err(e) = write_synced(&tmp, data).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Write and flush to stable storage, so the rename never publishes a
/// file whose contents are still only in the page cache.
async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::record::Stage;
    use tempfile::TempDir;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();
        let mut r = ProcessingRecord::new("book.pdf");
        r.mark_done(Stage::ParseMetadata).unwrap();
        store.save(&r).await.unwrap();

        let loaded = store.load(&r.book_id).await.unwrap();
        assert_eq!(loaded, r);
        assert!(dir.path().join(format!("{}.json", r.book_id)).exists());
    }

    #[tokio::test]
    async fn missing_record_is_absent() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();
        assert!(store.load("NLJR-000000000000").await.is_none());
        assert!(store.corrupt_entries().is_empty());
    }

    #[tokio::test]
    async fn malformed_record_is_absent_and_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("NLJR-BROKEN000000.json"), "{ \"book_id\": ").unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();
        assert!(store.load("NLJR-BROKEN000000").await.is_none());
        assert_eq!(store.corrupt_entries().len(), 1);
        // Never deleted.
        assert!(dir.path().join("NLJR-BROKEN000000.json").exists());
    }

    #[tokio::test]
    async fn inconsistent_flags_are_repaired_on_load() {
        let dir = TempDir::new().unwrap();
        let json = r#"{
            "book_id": "NLJR-ABCDEF123456",
            "status": {"parse_metadata": false, "rename_done": true, "trans_toc": true, "build_md": false},
            "standard_name": "x.pdf"
        }"#;
        std::fs::write(dir.path().join("NLJR-ABCDEF123456.json"), json).unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();
        let r = store.load("NLJR-ABCDEF123456").await.unwrap();
        assert!(r.status.is_ordered());
        assert!(!r.is_done(Stage::RenameDone));
    }

    #[tokio::test]
    async fn find_by_either_name_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut r = ProcessingRecord::new("book.pdf");
        r.safe_title = "Example (2020) - 示例.pdf".into();
        {
            let store = FileStateStore::open(dir.path()).await.unwrap();
            store.save(&r).await.unwrap();
        }
        let store = FileStateStore::open(dir.path()).await.unwrap();
        let by_old = store.find_by_location("book.pdf").await.unwrap();
        let by_new = store.find_by_location("Example (2020) - 示例.pdf").await.unwrap();
        assert_eq!(by_old.book_id, r.book_id);
        assert_eq!(by_new.book_id, r.book_id);
        assert!(store.find_by_location("other.pdf").await.is_none());
    }

    #[tokio::test]
    async fn same_name_in_another_directory_is_another_book() {
        let dir = TempDir::new().unwrap();
        let a = ProcessingRecord::new("book.pdf").in_dir("a");
        {
            let store = FileStateStore::open(dir.path()).await.unwrap();
            store.save(&a).await.unwrap();
        }
        let store = FileStateStore::open(dir.path()).await.unwrap();
        assert_eq!(store.find_by_location("a/book.pdf").await.unwrap().book_id, a.book_id);
        assert!(store.find_by_location("b/book.pdf").await.is_none());
        assert!(store.find_by_location("book.pdf").await.is_none());
    }

    #[tokio::test]
    async fn atomic_write_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("card.md");
        write_bytes_atomic(&path, b"first").await.unwrap();
        write_bytes_atomic(&path, b"second").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();
        let r = ProcessingRecord::new("a.pdf");
        store.save(&r).await.unwrap();
        store.save(&r).await.unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.json", r.book_id)]);
    }

    #[tokio::test]
    async fn memory_store_counts_writes() {
        let store = MemoryStateStore::new();
        let r = ProcessingRecord::new("a.pdf");
        store.insert(r.clone());
        assert_eq!(store.write_count(), 0);
        store.save(&r).await.unwrap();
        assert_eq!(store.write_count(), 1);
        assert!(store.find_by_location("a.pdf").await.is_some());
    }

    #[tokio::test]
    async fn save_rejects_unsafe_ids() {
        let store = MemoryStateStore::new();
        let mut r = ProcessingRecord::new("a.pdf");
        r.book_id = "../../x".into();
        assert!(matches!(
            store.save(&r).await,
            Err(StateError::InvalidBookId(_))
        ));
    }
}
