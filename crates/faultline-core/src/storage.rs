//! Key-value persistence shared by the managed and native fault stores.
//!
//! Each store owns its own [`KvStore`] namespace (a separate directory on
//! disk), so a broken managed namespace never prevents native records from
//! being written. [`BoundedLog`] is the common adapter on top: a JSON array
//! under one key, trimmed to a fixed capacity on every insert.
//!
//! ```text
//! <data_dir>/managed/voicejot.fault_log.json          managed records, oldest first
//! <data_dir>/native/voicejot.native_crash_log.json    panic-hook records, newest first
//! <data_dir>/native/voicejot.native_error_log.json    startup + bridge records, newest first
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;
use crate::logging::RAW_TARGET;

/// Flat string key-value storage.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One JSON file per key inside a directory.
///
/// Writes go to a temp file that is synced and renamed into place, so a
/// crash mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `key`.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    fn ensure_dir(&self) -> io::Result<()> {
        if self.dir.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700));
        }
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let wrap = |source| StoreError::Write {
            key: key.to_string(),
            source,
        };
        self.ensure_dir().map_err(wrap)?;
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            path.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned()),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        write_file_sync(&tmp, value.as_bytes()).map_err(wrap)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(wrap(e));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Write {
                key: key.to_string(),
                source,
            }),
        }
    }
}

fn write_file_sync(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut f = fs::File::create(path)?;
    f.write_all(data)?;
    f.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = f.set_permissions(fs::Permissions::from_mode(0o600));
    }

    Ok(())
}

/// In-process storage, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// Storage whose writes always fail; reads see an empty namespace.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FailingKvStore {
    set_attempts: AtomicU64,
}

#[cfg(test)]
impl FailingKvStore {
    pub(crate) fn set_attempts(&self) -> u64 {
        self.set_attempts.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl KvStore for FailingKvStore {
    fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    fn set(&self, key: &str, _: &str) -> Result<(), StoreError> {
        self.set_attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Write {
            key: key.to_string(),
            source: io::Error::other("no space left on device"),
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        Err(StoreError::Write {
            key: key.to_string(),
            source: io::Error::other("read-only file system"),
        })
    }
}

/// Where new entries go in the persisted array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOrder {
    /// Oldest first; new entries at the end.
    Append,
    /// Newest first; new entries at the front.
    Prepend,
}

/// A capacity-bounded JSON array stored under a single key.
///
/// Eviction always drops the oldest entries, whichever end they live at.
pub struct BoundedLog {
    kv: Arc<dyn KvStore>,
    key: String,
    capacity: usize,
    order: InsertOrder,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for BoundedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedLog")
            .field("key", &self.key)
            .field("capacity", &self.capacity)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl BoundedLog {
    /// `capacity` is clamped to at least 1.
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        key: impl Into<String>,
        capacity: usize,
        order: InsertOrder,
    ) -> Self {
        Self {
            kv,
            key: key.into(),
            capacity: capacity.max(1),
            order,
            write_lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw persisted JSON text, if any.
    pub fn read_raw(&self) -> Result<Option<String>, StoreError> {
        self.kv.get(&self.key)
    }

    /// Decode the persisted array in stored order. A missing key is an empty log.
    pub fn read<T: DeserializeOwned>(&self) -> Result<Vec<T>, StoreError> {
        match self.kv.get(&self.key)? {
            None => Ok(Vec::new()),
            Some(text) if text.trim().is_empty() => Ok(Vec::new()),
            Some(text) => serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
                key: self.key.clone(),
                source,
            }),
        }
    }

    /// Insert one entry and trim to capacity. Returns how many entries were evicted.
    ///
    /// A corrupt existing value is replaced rather than blocking every
    /// future write.
    pub fn insert<T: Serialize + DeserializeOwned>(&self, item: T) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<T> = match self.read() {
            Ok(entries) => entries,
            Err(StoreError::Corrupt { key, source }) => {
                tracing::warn!(target: RAW_TARGET, store_key = %key, error = %source, "discarding corrupt fault log");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let evicted = (entries.len() + 1).saturating_sub(self.capacity);
        match self.order {
            InsertOrder::Append => {
                entries.push(item);
                entries.drain(..evicted);
            }
            InsertOrder::Prepend => {
                entries.insert(0, item);
                entries.truncate(self.capacity);
            }
        }

        let text = serde_json::to_string_pretty(&entries).map_err(|source| StoreError::Encode {
            key: self.key.clone(),
            source,
        })?;
        self.kv.set(&self.key, &text)?;
        Ok(evicted)
    }

    /// Drop every entry.
    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.kv.remove(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_log(capacity: usize, order: InsertOrder) -> (Arc<MemoryKvStore>, BoundedLog) {
        let kv = Arc::new(MemoryKvStore::new());
        let log = BoundedLog::new(kv.clone(), "test.log", capacity, order);
        (kv, log)
    }

    #[test]
    fn missing_key_reads_as_empty() {
        let (_, log) = memory_log(3, InsertOrder::Append);
        assert!(log.read::<u32>().unwrap().is_empty());
        assert!(log.read_raw().unwrap().is_none());
    }

    #[test]
    fn append_evicts_oldest_from_front() {
        let (_, log) = memory_log(3, InsertOrder::Append);
        let evicted: usize = (1..=5u32).map(|i| log.insert(i).unwrap()).sum();
        assert_eq!(evicted, 2);
        assert_eq!(log.read::<u32>().unwrap(), vec![3, 4, 5]);
    }

    #[test]
    fn prepend_evicts_oldest_from_back() {
        let (_, log) = memory_log(3, InsertOrder::Prepend);
        for i in 1..=5u32 {
            log.insert(i).unwrap();
        }
        assert_eq!(log.read::<u32>().unwrap(), vec![5, 4, 3]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let (_, log) = memory_log(0, InsertOrder::Append);
        log.insert(1u32).unwrap();
        log.insert(2u32).unwrap();
        assert_eq!(log.read::<u32>().unwrap(), vec![2]);
    }

    #[test]
    fn corrupt_value_fails_read_but_not_insert() {
        let (kv, log) = memory_log(3, InsertOrder::Append);
        kv.set("test.log", "{not json").unwrap();
        assert!(matches!(log.read::<u32>(), Err(StoreError::Corrupt { .. })));
        log.insert(7u32).unwrap();
        assert_eq!(log.read::<u32>().unwrap(), vec![7]);
    }

    #[test]
    fn clear_removes_key() {
        let (kv, log) = memory_log(3, InsertOrder::Append);
        log.insert(1u32).unwrap();
        log.clear().unwrap();
        assert!(kv.get("test.log").unwrap().is_none());
    }

    #[test]
    fn file_store_roundtrip_and_missing_key() {
        let tmp = tempfile::tempdir().unwrap();
        let kv = FileKvStore::new(tmp.path().join("ns"));
        assert!(kv.get("a.b").unwrap().is_none());
        kv.set("a.b", "[1,2]").unwrap();
        assert_eq!(kv.get("a.b").unwrap().as_deref(), Some("[1,2]"));
        assert!(kv.path_for("a.b").ends_with("a.b.json"));
        kv.remove("a.b").unwrap();
        kv.remove("a.b").unwrap();
        assert!(kv.get("a.b").unwrap().is_none());
    }

    #[test]
    fn file_store_sanitizes_keys() {
        let kv = FileKvStore::new("/tmp/ns");
        let path = kv.path_for("@voicejot:error/logs");
        assert_eq!(path.file_name().unwrap(), "_voicejot_error_logs.json");
    }

    #[test]
    fn file_store_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let kv = FileKvStore::new(tmp.path());
        for i in 0..5 {
            kv.set("k", &i.to_string()).unwrap();
        }
        let names: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["k.json".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn file_store_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let kv = FileKvStore::new(tmp.path().join("ns"));
        kv.set("k", "[]").unwrap();
        let mode = fs::metadata(kv.path_for("k")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn file_store_write_into_file_path_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, "x").unwrap();
        let kv = FileKvStore::new(&blocker);
        assert!(matches!(kv.set("k", "[]"), Err(StoreError::Write { .. })));
    }
}
