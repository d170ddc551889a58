//! File-backed key/value store: one file per key, replaced atomically.

use std::path::{Path, PathBuf};

use xwlink_core::storage::{KvStore, StorageError};

pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let ok = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            && !key.starts_with('.');
        if !ok {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }

    /// Per-key scratch file. Keys never start with '.', so it cannot clash with a key.
    fn temp_path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        self.path_for(key)?;
        Ok(self.dir.join(format!(".{}.tmp", key)))
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match std::fs::read(self.path_for(key)?) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let tmp = self.temp_path_for(key)?;
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileKvStore::open(dir.path()).unwrap();
        assert!(s.get("scheduler.table").unwrap().is_none());
        s.set("scheduler.table", b"abc").unwrap();
        let s2 = FileKvStore::open(dir.path()).unwrap();
        assert_eq!(s2.get("scheduler.table").unwrap().as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn keys_sharing_a_stem_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileKvStore::open(dir.path()).unwrap();
        assert_ne!(s.temp_path_for("tap.store").unwrap(), s.temp_path_for("tap.devid").unwrap());
        assert_ne!(s.temp_path_for("mesh.addr").unwrap(), s.path_for("mesh.tmp").unwrap());
        s.set("tap.store", b"store").unwrap();
        s.set("tap.devid", b"id").unwrap();
        assert_eq!(s.get("tap.store").unwrap().as_deref(), Some(&b"store"[..]));
        assert_eq!(s.get("tap.devid").unwrap().as_deref(), Some(&b"id"[..]));
        assert!(!s.temp_path_for("tap.store").unwrap().exists());
    }

    #[test]
    fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let s = FileKvStore::open(dir.path()).unwrap();
        assert!(matches!(s.set("../x", b""), Err(StorageError::InvalidKey(_))));
        assert!(matches!(s.get(""), Err(StorageError::InvalidKey(_))));
    }
}
