//! Session storage trait and built-in backends.
//!
//! The session blob is the only durable state the portal keeps on the
//! client. [`FileStorage`] keeps one JSON file per key and writes it with a
//! temp-rename so a reader never observes a partially-written blob. On unix
//! the file is created owner-only (`0600`).
//! [`MemoryStorage`] is a process-local map for tests and ephemeral hosts.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Key/value persistence for the session blob.
///
/// Calls are synchronous: the blob is small and is only touched at
/// startup, login and logout.
pub trait SessionStorage: Send + Sync {
    /// Read the value stored under `key`.
    ///
    /// # Returns
    ///
    /// `Ok(None)` if nothing is stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` for backend failures other than "not found".
    fn read(&self, key: &str) -> io::Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the value could not be persisted.
    fn write(&self, key: &str, value: &str) -> io::Result<()>;

    /// Remove the value stored under `key`.
    ///
    /// Removing a key that does not exist succeeds.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if an existing value could not be removed.
    fn remove(&self, key: &str) -> io::Result<()>;
}

/// File-backed storage rooted at a directory.
///
/// The layout is:
/// ```text
/// <base_dir>/
///     <key>.json
/// ```
///
/// The directory is created lazily on the first write.
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_dir: PathBuf,
}

impl FileStorage {
    /// Create a new `FileStorage` rooted at the given directory.
    ///
    /// # Arguments
    ///
    /// * `base_dir` - Directory that holds one file per key. It does not
    ///   need to exist yet.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this storage.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the path of the file backing `key`.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::InvalidInput`] if `key` is empty or contains
    /// characters other than ASCII alphanumerics, `-` and `_`, so a key can
    /// never escape the base directory.
    pub fn key_path(&self, key: &str) -> io::Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid storage key: {key:?}"),
            ));
        }
        Ok(self.base_dir.join(format!("{key}.json")))
    }
}

impl SessionStorage for FileStorage {
    fn read(&self, key: &str) -> io::Result<Option<String>> {
        let path = self.key_path(key)?;
        match std::fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            // A non-UTF-8 file is corrupt data, not a backend failure: hand it
            // back as text so the caller's parse rejects and discards it.
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                let bytes = std::fs::read(&path)?;
                Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
            }
            Err(e) => Err(e),
        }
    }

    fn write(&self, key: &str, value: &str) -> io::Result<()> {
        let path = self.key_path(key)?;
        std::fs::create_dir_all(&self.base_dir)?;

        let tmp_path = path.with_extension("json.tmp");
        // A leftover temp file would keep its old mode on reopen.
        match std::fs::remove_file(&tmp_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            // The blob carries a bearer token: owner read/write only.
            options.mode(0o600);
        }
        let mut file = options.open(&tmp_path)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        let path = self.key_path(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// In-memory storage. Values live as long as the `MemoryStorage` does.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Create an empty `MemoryStorage`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `MemoryStorage` pre-seeded with one entry.
    ///
    /// Convenient for simulating what a previous process left behind.
    pub fn with_entry(key: impl Into<String>, value: impl Into<String>) -> Self {
        let storage = Self::default();
        storage.lock().insert(key.into(), value.into());
        storage
    }

    /// Returns `true` if a value is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A panic while holding this lock cannot leave the map half-updated
        // (every operation is a single insert/remove), so recover the guard.
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl SessionStorage for MemoryStorage {
    fn read(&self, key: &str) -> io::Result<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> io::Result<()> {
        self.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_path_returns_expected_path() {
        let storage = FileStorage::new("/data/portal");
        let path = storage.key_path("currentPatient").expect("valid key");
        assert_eq!(path, PathBuf::from("/data/portal/currentPatient.json"));
    }

    #[test]
    fn key_path_rejects_traversal_and_empty_keys() {
        let storage = FileStorage::new("/data/portal");
        for key in ["", "../etc/passwd", "a/b", "session.json", "with space"] {
            let err = storage.key_path(key).expect_err("key should be rejected");
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "key {key:?}");
        }
    }

    #[test]
    fn file_write_then_read_returns_value() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let storage = FileStorage::new(dir.path().join("nested"));

        storage
            .write("currentPatient", r#"{"subjectId":"p1"}"#)
            .expect("write should succeed");

        let value = storage.read("currentPatient").expect("read should succeed");
        assert_eq!(value.as_deref(), Some(r#"{"subjectId":"p1"}"#));
    }

    #[test]
    fn file_read_missing_returns_none() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let storage = FileStorage::new(dir.path());
        assert_eq!(storage.read("nothing").expect("read should succeed"), None);
    }

    #[test]
    fn file_read_non_utf8_returns_lossy_text() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let storage = FileStorage::new(dir.path());
        let path = storage.key_path("blob").expect("valid key");
        std::fs::write(&path, [0xff, 0xfe, b'{']).expect("write raw bytes");

        let value = storage.read("blob").expect("read should not error");
        assert!(value.is_some());
    }

    #[test]
    fn file_write_uses_atomic_temp_rename() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let storage = FileStorage::new(dir.path());
        storage.write("k", "v").expect("write should succeed");

        let final_path = storage.key_path("k").expect("valid key");
        let tmp_path = final_path.with_extension("json.tmp");
        assert!(final_path.exists(), "final file should exist");
        assert!(!tmp_path.exists(), "temp file should not exist after write");
    }

    #[test]
    fn file_remove_is_idempotent() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let storage = FileStorage::new(dir.path());
        storage.write("k", "v").expect("write should succeed");

        storage.remove("k").expect("first remove");
        storage.remove("k").expect("second remove of missing key");
        assert_eq!(storage.read("k").expect("read"), None);
    }

    #[test]
    fn memory_storage_roundtrip_and_remove() {
        let storage = MemoryStorage::new();
        assert!(!storage.contains("k"));

        storage.write("k", "v1").expect("write");
        storage.write("k", "v2").expect("overwrite");
        assert_eq!(storage.read("k").expect("read").as_deref(), Some("v2"));

        storage.remove("k").expect("remove");
        storage.remove("k").expect("remove missing");
        assert!(!storage.contains("k"));
    }

    #[test]
    fn memory_storage_with_entry_seeds_value() {
        let storage = MemoryStorage::with_entry("currentPatient", "not-json");
        assert_eq!(
            storage.read("currentPatient").expect("read").as_deref(),
            Some("not-json")
        );
    }

    #[cfg(unix)]
    #[test]
    fn file_storage_writes_owner_only_files() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::new(dir.path());
        storage.write("currentPatient", r#"{"authToken":"t1"}"#).expect("write");
        storage.write("currentPatient", r#"{"authToken":"t2"}"#).expect("overwrite");

        let path = dir.path().join("currentPatient.json");
        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!dir.path().join("currentPatient.json.tmp").exists());
        assert_eq!(
            storage.read("currentPatient").expect("read").as_deref(),
            Some(r#"{"authToken":"t2"}"#)
        );
    }
}
