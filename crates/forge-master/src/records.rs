// The master's narrow record persistence: active jobs (for recovery),
// job/task history, persistent-store metadata and the unique-id allocator.
// Everything lives in one JSON document rewritten on mutation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const RECORD_FILE: &str = "records.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub unique_id: u64,
    pub jobid: String,
    pub cmd_id: String,
    pub date_time: DateTime<Utc>,
    pub info: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistoryRecord {
    pub task_name: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHistoryRecord {
    pub unique_id: u64,
    pub job: String,
    pub file_path: String,
    pub date_time: DateTime<Utc>,
    pub tasks: Vec<TaskHistoryRecord>,
}

fn first_job_id() -> u64 {
    1
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordData {
    /// Next unique id to hand out. Strictly increasing, never reused.
    #[serde(default = "first_job_id")]
    avail_job_id: u64,
    #[serde(default)]
    jobs: BTreeMap<u64, JobRecord>,
    #[serde(default)]
    history: Vec<JobHistoryRecord>,
    #[serde(default)]
    pdb_meta: BTreeMap<String, PathBuf>,
}

impl Default for RecordData {
    fn default() -> Self {
        Self {
            avail_job_id: first_job_id(),
            jobs: BTreeMap::new(),
            history: Vec::new(),
            pdb_meta: BTreeMap::new(),
        }
    }
}

pub struct RecordStore {
    path: PathBuf,
    data: Mutex<RecordData>,
}

impl RecordStore {
    /// Open (or initialize) the record store under `dir`.
    pub fn open(dir: &Path) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create record dir {dir:?}"))?;
        let path = dir.join(RECORD_FILE);

        let data = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {path:?}"))?;
            serde_json::from_str(&raw).with_context(|| format!("failed to parse {path:?}"))?
        } else {
            RecordData::default()
        };

        Ok(Arc::new(Self {
            path,
            data: Mutex::new(data),
        }))
    }

    fn save(&self, data: &RecordData) -> Result<()> {
        let raw = serde_json::to_string_pretty(data)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to write {:?}", self.path))
    }

    /// Allocate the next job unique id. The store's lock is the allocator
    /// mutex; concurrent bindings can never observe the same id.
    pub async fn alloc_unique_id(&self) -> Result<u64> {
        let mut data = self.data.lock().await;
        let id = data.avail_job_id;
        data.avail_job_id += 1;
        self.save(&data)?;
        Ok(id)
    }

    pub async fn put_job(&self, record: JobRecord) -> Result<()> {
        let mut data = self.data.lock().await;
        data.jobs.insert(record.unique_id, record);
        self.save(&data)
    }

    pub async fn remove_job(&self, unique_id: u64) -> Result<()> {
        let mut data = self.data.lock().await;
        data.jobs.remove(&unique_id);
        self.save(&data)
    }

    /// Jobs that were persisted but never terminated; replayed on boot.
    pub async fn unfinished_jobs(&self) -> Vec<JobRecord> {
        self.data.lock().await.jobs.values().cloned().collect()
    }

    pub async fn record_history(&self, record: JobHistoryRecord) -> Result<()> {
        let mut data = self.data.lock().await;
        data.history.push(record);
        self.save(&data)
    }

    pub async fn histories(&self) -> Vec<JobHistoryRecord> {
        self.data.lock().await.history.clone()
    }

    pub async fn pdb_register(&self, key: &str, path: &Path) -> Result<()> {
        let mut data = self.data.lock().await;
        data.pdb_meta.insert(key.to_string(), path.to_path_buf());
        self.save(&data)
    }

    pub async fn pdb_remove(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        data.pdb_meta.remove(key);
        self.save(&data)
    }

    pub async fn pdb_entries(&self) -> BTreeMap<String, PathBuf> {
        self.data.lock().await.pdb_meta.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unique_ids_are_strictly_increasing_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let store = RecordStore::open(dir.path()).unwrap();
        assert_eq!(store.alloc_unique_id().await.unwrap(), 1);
        assert_eq!(store.alloc_unique_id().await.unwrap(), 2);
        drop(store);

        let store = RecordStore::open(dir.path()).unwrap();
        assert_eq!(store.alloc_unique_id().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_job_rows_survive_reopen_until_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();

        store
            .put_job(JobRecord {
                unique_id: 1,
                jobid: "J".into(),
                cmd_id: "GL8900".into(),
                date_time: Utc::now(),
                info: BTreeMap::new(),
            })
            .await
            .unwrap();
        drop(store);

        let store = RecordStore::open(dir.path()).unwrap();
        assert_eq!(store.unfinished_jobs().await.len(), 1);

        store.remove_job(1).await.unwrap();
        assert!(store.unfinished_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_history_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();

        store
            .record_history(JobHistoryRecord {
                unique_id: 1,
                job: "J".into(),
                file_path: "/srv/results/1/out".into(),
                date_time: Utc::now(),
                tasks: vec![TaskHistoryRecord {
                    task_name: "GL8900".into(),
                    state: "FIN".into(),
                }],
            })
            .await
            .unwrap();

        let rows = store.histories().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tasks.len(), 1);
    }
}
