//! Durable key/value store. One JSON file per `(namespace, key)` under
//! `<data_dir>/<namespace>/<key>.json`, written via write-to-temp-then-
//! rename so a crash between the write and the return never leaves a
//! partially-written file in place.
//!
//! Grounded on `KeeperState::save` (atomic temp-file-then-rename) and
//! `main.rs`'s `fs2` single-instance lock, generalized from one
//! monolithic state file to a namespaced key/value contract.

use crate::errors::OracleError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Holds the process-wide exclusive lock on the data directory for as
/// long as the node runs. Dropping it releases the lock.
pub struct StoreLock {
    _file: File,
}

#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (creating if necessary) the store rooted at `root`, and
    /// takes an exclusive lock on `root/node.lock`. Fails if another
    /// process already holds the lock.
    pub fn open(root: impl Into<PathBuf>) -> Result<(Self, StoreLock), OracleError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| OracleError::Store(format!("creating data dir {}: {e}", root.display())))?;

        let lock_path = root.join("node.lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| OracleError::Store(format!("opening lock file: {e}")))?;
        lock_file.try_lock_exclusive().map_err(|e| {
            OracleError::Store(format!(
                "another node instance already holds {}: {e}",
                lock_path.display()
            ))
        })?;

        Ok((Self { root }, StoreLock { _file: lock_file }))
    }

    fn key_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{}.json", sanitize(key)))
    }

    pub fn put(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), OracleError> {
        let path = self.key_path(namespace, key);
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)
            .map_err(|e| OracleError::Store(format!("creating namespace dir {}: {e}", dir.display())))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)
            .map_err(|e| OracleError::Store(format!("writing temp file {}: {e}", tmp.display())))?;

        if let Err(err) = fs::rename(&tmp, &path) {
            if cfg!(windows) {
                let _ = fs::remove_file(&path);
                fs::rename(&tmp, &path)
                    .map_err(|e| OracleError::Store(format!("replacing {}: {e}", path.display())))?;
            } else {
                return Err(OracleError::Store(format!(
                    "replacing {}: {err}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn put_json<T: serde::Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
    ) -> Result<(), OracleError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| OracleError::Store(format!("serializing {namespace}/{key}: {e}")))?;
        self.put(namespace, key, &bytes)
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Vec<u8>, OracleError> {
        let path = self.key_path(namespace, key);
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(OracleError::NotFound {
                namespace: namespace.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(OracleError::Store(format!(
                "reading {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<T, OracleError> {
        let bytes = self.get(namespace, key)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| OracleError::Store(format!("deserializing {namespace}/{key}: {e}")))
    }

    pub fn delete(&self, namespace: &str, key: &str) -> Result<(), OracleError> {
        let path = self.key_path(namespace, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OracleError::Store(format!(
                "deleting {}: {e}",
                path.display()
            ))),
        }
    }

    /// Lists all keys in `namespace`, including nested directories
    /// (used by `dedup/<blockNumber>/<txHash>/<logIndex>`), returning
    /// the relative key path with `.json` stripped.
    pub fn list(&self, namespace: &str) -> Result<Vec<String>, OracleError> {
        let dir = self.root.join(namespace);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        walk(&dir, &dir, &mut out)
            .map_err(|e| OracleError::Store(format!("listing {}: {e}", dir.display())))?;
        Ok(out)
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let rel = rel.with_extension("");
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

/// Keys may contain `/` (used by the dedup namespace's composite keys);
/// anything else that would be unsafe as a path component is escaped.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '/' | '.' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _lock) = FileStore::open(dir.path()).unwrap();
        store.put_json("checkpoint", "lastSafeBlock", &1000u64).unwrap();
        let got: u64 = store.get_json("checkpoint", "lastSafeBlock").unwrap();
        assert_eq!(got, 1000);
    }

    #[test]
    fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _lock) = FileStore::open(dir.path()).unwrap();
        let err = store.get("jobs", "nope").unwrap_err();
        assert!(matches!(err, OracleError::NotFound { .. }));
    }

    #[test]
    fn delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _lock) = FileStore::open(dir.path()).unwrap();
        store.delete("jobs", "nope").unwrap();
    }

    #[test]
    fn list_returns_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _lock) = FileStore::open(dir.path()).unwrap();
        store.put_json("dedup", "100/0xabc/0", &true).unwrap();
        store.put_json("dedup", "100/0xabc/1", &true).unwrap();
        let keys = store.list("dedup").unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn second_open_fails_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, _lock) = FileStore::open(dir.path()).unwrap();
        let second = FileStore::open(dir.path());
        assert!(second.is_err());
    }
}
