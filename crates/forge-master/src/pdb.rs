// Persistent per-task byte store: one file per key, random access reads
// and writes serialized by a per-key async mutex. Used to retain task
// output so clients can replay it later.

use dashmap::DashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use forge_common::error::ResourceError;

use crate::records::RecordStore;

/// Keep the cursor where the previous operation left it.
pub const POS_CURRENT: i64 = -1;
/// Seek to the end before the operation.
pub const POS_TAIL: i64 = -2;

pub struct PersistentStore {
    location: PathBuf,
    files: DashMap<String, PathBuf>,
    opened: DashMap<String, Arc<Mutex<std::fs::File>>>,
    records: Arc<RecordStore>,
}

impl PersistentStore {
    /// Open the store and re-register every recorded key whose backing
    /// file still exists.
    pub async fn open(location: PathBuf, records: Arc<RecordStore>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&location)?;

        let store = Self {
            location,
            files: DashMap::new(),
            opened: DashMap::new(),
            records,
        };

        for (key, path) in store.records.pdb_entries().await {
            if path.exists() {
                store.files.insert(key, path);
            }
        }

        Ok(store)
    }

    /// Create an empty file for `key`. Idempotent on an existing key.
    pub async fn create(&self, key: &str) -> anyhow::Result<()> {
        if self.files.contains_key(key) {
            return Ok(());
        }

        let path = self.location.join(key);
        std::fs::File::create(&path)?;
        self.files.insert(key.to_string(), path.clone());
        self.records.pdb_register(key, &path).await?;
        Ok(())
    }

    pub fn is_exists(&self, key: &str) -> bool {
        self.files.contains_key(key)
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.opened.contains_key(key)
    }

    /// Open `key` read-write and install its per-key mutex. Idempotent.
    pub fn open_key(&self, key: &str) -> Result<(), ResourceError> {
        if self.opened.contains_key(key) {
            return Ok(());
        }

        let path = self
            .files
            .get(key)
            .map(|p| p.clone())
            .ok_or_else(|| ResourceError::PdbKeyNotExists(key.to_string()))?;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|_| ResourceError::PdbKeyNotExists(key.to_string()))?;

        self.opened.insert(key.to_string(), Arc::new(Mutex::new(file)));
        Ok(())
    }

    fn handle(&self, key: &str) -> Result<Arc<Mutex<std::fs::File>>, ResourceError> {
        if !self.is_open(key) {
            self.open_key(key)?;
        }
        self.opened
            .get(key)
            .map(|h| h.clone())
            .ok_or_else(|| ResourceError::PdbKeyNotExists(key.to_string()))
    }

    fn seek(file: &mut std::fs::File, pos: i64) -> std::io::Result<()> {
        match pos {
            POS_CURRENT => Ok(()),
            POS_TAIL => file.seek(SeekFrom::End(0)).map(|_| ()),
            abs => file.seek(SeekFrom::Start(abs as u64)).map(|_| ()),
        }
    }

    /// Read up to `len` bytes at `pos` under the key's mutex.
    pub async fn read(&self, key: &str, len: usize, pos: i64) -> anyhow::Result<Vec<u8>> {
        let handle = self.handle(key)?;
        let mut file = handle.lock().await;

        Self::seek(&mut file, pos)?;
        let mut buf = vec![0u8; len];
        let n = file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Read everything from `pos` to the end of the key's data.
    pub async fn read_to_tail(&self, key: &str, pos: i64) -> anyhow::Result<Vec<u8>> {
        let handle = self.handle(key)?;
        let mut file = handle.lock().await;

        Self::seek(&mut file, pos)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Write `data` at `pos` under the key's mutex, flushing immediately
    /// so a subsequent reader observes it.
    pub async fn write(&self, key: &str, data: &[u8], pos: i64) -> anyhow::Result<()> {
        let handle = self.handle(key)?;
        let mut file = handle.lock().await;

        Self::seek(&mut file, pos)?;
        file.write_all(data)?;
        file.flush()?;
        Ok(())
    }

    pub async fn close(&self, key: &str) -> Result<(), ResourceError> {
        if self.opened.remove(key).is_none() && !self.files.contains_key(key) {
            return Err(ResourceError::PdbKeyNotExists(key.to_string()));
        }
        Ok(())
    }

    /// Delete the file and its metadata row.
    pub async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.opened.remove(key);
        if let Some((_, path)) = self.files.remove(key) {
            let _ = std::fs::remove_file(path);
            self.records.pdb_remove(key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(dir: &std::path::Path) -> PersistentStore {
        let records = RecordStore::open(&dir.join("records")).unwrap();
        PersistentStore::open(dir.join("pdb"), records).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pdb = store(dir.path()).await;

        pdb.create("1_A").await.unwrap();
        pdb.write("1_A", b"hello", POS_TAIL).await.unwrap();
        // A second create must not truncate existing data.
        pdb.create("1_A").await.unwrap();
        assert_eq!(pdb.read("1_A", 16, 0).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_tail_and_absolute_positions() {
        let dir = tempfile::tempdir().unwrap();
        let pdb = store(dir.path()).await;

        pdb.create("k").await.unwrap();
        pdb.write("k", b"abc", POS_TAIL).await.unwrap();
        pdb.write("k", b"def", POS_TAIL).await.unwrap();
        assert_eq!(pdb.read("k", 6, 0).await.unwrap(), b"abcdef");

        pdb.write("k", b"X", 0).await.unwrap();
        assert_eq!(pdb.read("k", 6, 0).await.unwrap(), b"Xbcdef");

        // CURRENT keeps the cursor: after the read above it sits at 6.
        assert_eq!(pdb.read_to_tail("k", POS_CURRENT).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_unknown_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pdb = store(dir.path()).await;

        assert!(pdb.read("nope", 4, 0).await.is_err());
        assert!(pdb.write("nope", b"x", POS_TAIL).await.is_err());
    }

    #[tokio::test]
    async fn test_recovery_re_registers_existing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let records = RecordStore::open(&dir.path().join("records")).unwrap();
        {
            let pdb = PersistentStore::open(dir.path().join("pdb"), records.clone())
                .await
                .unwrap();
            pdb.create("kept").await.unwrap();
            pdb.write("kept", b"data", POS_TAIL).await.unwrap();
            pdb.create("lost").await.unwrap();
        }

        std::fs::remove_file(dir.path().join("pdb").join("lost")).unwrap();

        let pdb = PersistentStore::open(dir.path().join("pdb"), records).await.unwrap();
        assert!(pdb.is_exists("kept"));
        assert!(!pdb.is_exists("lost"));
        assert_eq!(pdb.read("kept", 4, 0).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_concurrent_writes_fully_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let pdb = Arc::new(store(dir.path()).await);
        pdb.create("k").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pdb = pdb.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..16 {
                    pdb.write("k", b"0123456789", POS_TAIL).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let data = pdb.read_to_tail("k", 0).await.unwrap();
        // No interleaving within a single write.
        assert_eq!(data.len(), 8 * 16 * 10);
        for chunk in data.chunks(10) {
            assert_eq!(chunk, b"0123456789");
        }
    }
}
