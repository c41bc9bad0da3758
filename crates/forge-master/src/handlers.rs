// Handlers behind the event router: task-state responses, artifact
// streams, worker log letters and worker-state-change notifications.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use forge_common::letter::{BinaryLetter, Letter, NOTIFY_WSC, WSC_STATE_PENDING, WSC_STATE_READY};
use tokio::sync::Mutex;

use crate::dispatcher::Dispatcher;
use crate::event_router::EventHandler;
use crate::job_master::JobMaster;
use crate::log_sink::LogSink;
use crate::storage::{ArtifactSink, Storage};
use crate::task::{TaskKind, TaskRef, TaskState};
use crate::worker::{WorkerRef, WorkerState};
use crate::worker_room::WorkerRoom;

/// Completed artifact transfers: task id -> stored blob path.
#[derive(Default)]
pub struct TransferRegistry {
    paths: DashMap<String, PathBuf>,
}

impl TransferRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// First completion wins; repeats are ignored.
    pub fn complete(&self, tid: &str, path: PathBuf) {
        self.paths.entry(tid.to_string()).or_insert(path);
    }

    pub fn path_of(&self, tid: &str) -> Option<PathBuf> {
        self.paths.get(tid).map(|p| p.clone())
    }
}

// ---------------------------------------------------------------------------
// Binary ingest
// ---------------------------------------------------------------------------

/// Collects binary frames into per-task artifact blobs. Fed from both the
/// control-plane router and the bulk data-link listener.
pub struct BinaryIngest {
    storage: Arc<Storage>,
    open: Mutex<HashMap<String, ArtifactSink>>,
    finished: Arc<TransferRegistry>,
}

impl BinaryIngest {
    pub fn new(storage: Arc<Storage>, finished: Arc<TransferRegistry>) -> Arc<Self> {
        Arc::new(Self {
            storage,
            open: Mutex::new(HashMap::new()),
            finished,
        })
    }

    pub async fn ingest(&self, letter: BinaryLetter) -> anyhow::Result<()> {
        let tid = letter.tid.clone();
        let mut open = self.open.lock().await;

        if letter.is_end_of_stream() {
            // Two consecutive terminators for one tid: the second is a no-op.
            if let Some(sink) = open.remove(&tid) {
                let path = sink.close().await?;
                tracing::info!("artifact for task {tid} stored at {path:?}");
                self.finished.complete(&tid, path);
            }
            return Ok(());
        }

        if !open.contains_key(&tid) {
            let bucket = tid.split('_').next().unwrap_or(&tid).to_string();
            let file_name = if letter.file_name.is_empty() {
                tid.clone()
            } else {
                letter.file_name.clone()
            };
            let sink = self.storage.create(&bucket, &file_name).await?;
            open.insert(tid.clone(), sink);
        }

        open.get_mut(&tid)
            .expect("sink just inserted")
            .store(&letter.payload)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler for BinaryIngest {
    async fn handle(&self, _worker: &WorkerRef, letter: Letter) -> anyhow::Result<()> {
        if let Letter::Binary(bin) = letter {
            self.ingest(bin).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Response handler
// ---------------------------------------------------------------------------

/// Applies task-state reports from workers: validates the transition, runs
/// the finish actions and forwards the change towards the job master.
pub struct ResponseHandler {
    dispatcher: Arc<Dispatcher>,
    job_master: Arc<JobMaster>,
    finished: Arc<TransferRegistry>,
    result_dir: PathBuf,
}

impl ResponseHandler {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        job_master: Arc<JobMaster>,
        finished: Arc<TransferRegistry>,
        result_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            job_master,
            finished,
            result_dir,
        })
    }

    async fn fin_action(&self, task: &TaskRef) {
        let uid = task.job_uid();
        match task.kind() {
            TaskKind::Single { .. } => {
                // A lone single task carries the job's artifact itself.
                if self.job_master.num_tasks_of(uid).await == 1 {
                    self.store_result(task).await;
                }
            }
            TaskKind::Post { .. } => {
                if self.job_master.is_temporary(uid).await {
                    self.stash_private(task).await;
                } else {
                    self.store_result(task).await;
                }
            }
        }
    }

    /// Move the finished artifact under the result directory and publish
    /// its location on the job.
    async fn store_result(&self, task: &TaskRef) {
        let Some(src) = self.finished.path_of(task.id()) else {
            tracing::warn!("task {} finished but no artifact was received", task.id());
            return;
        };

        let uid = task.job_uid();
        let file_name = src
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| task.id().to_string());

        let dest_dir = self.result_dir.join(uid.to_string());
        let dest = dest_dir.join(&file_name);
        if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
            tracing::error!("result dir {dest_dir:?} not creatable: {e}");
            return;
        }
        if let Err(e) = tokio::fs::copy(&src, &dest).await {
            tracing::error!("artifact copy {src:?} -> {dest:?} failed: {e}");
            return;
        }

        self.job_master
            .set_job_result(uid, dest.display().to_string())
            .await;
    }

    /// Temporary builds are kept out of the published result set.
    async fn stash_private(&self, task: &TaskRef) {
        let Some(src) = self.finished.path_of(task.id()) else {
            return;
        };
        let file_name = src
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| task.id().to_string());

        let dest_dir = self.result_dir.join("private");
        let dest = dest_dir.join(&file_name);
        if tokio::fs::create_dir_all(&dest_dir).await.is_ok()
            && tokio::fs::copy(&src, &dest).await.is_ok()
        {
            self.job_master
                .set_job_result(task.job_uid(), dest.display().to_string())
                .await;
        }
    }
}

#[async_trait]
impl EventHandler for ResponseHandler {
    async fn handle(&self, worker: &WorkerRef, letter: Letter) -> anyhow::Result<()> {
        let Letter::Response(response) = letter else {
            return Ok(());
        };

        let tid = response.header.tid;
        let Some(task) = worker.search_task(&tid) else {
            return Ok(());
        };

        let state = TaskState::from(response.content.state);
        // A rejected transition drops the event, nothing else.
        if task.state_change(state).is_err() {
            tracing::debug!(
                "dropping state report {} for task {tid} in state {}",
                state.as_str(),
                task.state().as_str()
            );
            return Ok(());
        }

        if state == TaskState::Finished {
            self.fin_action(&task).await;
        }

        self.dispatcher.on_task_state_changed(&tid, state).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Log handlers
// ---------------------------------------------------------------------------

pub struct LogHandler {
    sink: Arc<LogSink>,
}

impl LogHandler {
    pub fn new(sink: Arc<LogSink>) -> Arc<Self> {
        Arc::new(Self { sink })
    }
}

#[async_trait]
impl EventHandler for LogHandler {
    async fn handle(&self, _worker: &WorkerRef, letter: Letter) -> anyhow::Result<()> {
        if let Letter::Log(log) = letter {
            self.sink
                .put(&log.header.log_id, &log.content.log_msg)
                .await?;
        }
        Ok(())
    }
}

pub struct LogRegisterHandler {
    sink: Arc<LogSink>,
}

impl LogRegisterHandler {
    pub fn new(sink: Arc<LogSink>) -> Arc<Self> {
        Arc::new(Self { sink })
    }
}

#[async_trait]
impl EventHandler for LogRegisterHandler {
    async fn handle(&self, _worker: &WorkerRef, letter: Letter) -> anyhow::Result<()> {
        if let Letter::LogRegister(reg) = letter {
            self.sink.register(&reg.header.log_id).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WSC notify handler
// ---------------------------------------------------------------------------

/// Worker-state-change reports flip the worker record between accepting
/// (Online) and parked (Pending).
pub struct WscNotifyHandler {
    room: Arc<WorkerRoom>,
}

impl WscNotifyHandler {
    pub fn new(room: Arc<WorkerRoom>) -> Arc<Self> {
        Arc::new(Self { room })
    }
}

#[async_trait]
impl EventHandler for WscNotifyHandler {
    async fn handle(&self, _worker: &WorkerRef, letter: Letter) -> anyhow::Result<()> {
        let Letter::Notify(notify) = letter else {
            return Ok(());
        };
        if notify.header.kind != NOTIFY_WSC {
            anyhow::bail!("notify '{}' has no registered handler", notify.header.kind);
        }

        match notify.wsc_state() {
            Some(WSC_STATE_PENDING) => {
                self.room
                    .set_worker_state(&notify.header.ident, WorkerState::Pending);
            }
            Some(WSC_STATE_READY) => {
                self.room
                    .set_worker_state(&notify.header.ident, WorkerState::Online);
            }
            other => {
                tracing::warn!("unknown WSC state {other:?} from {}", notify.header.ident);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_router::EventRouter;
    use crate::job::Job;
    use crate::pdb::PersistentStore;
    use crate::records::RecordStore;
    use crate::tracker::TaskTracker;
    use crate::worker::Worker;
    use bytes::Bytes;
    use forge_common::config::MasterConfig;
    use forge_common::letter::{NotifyLetter, ResponseLetter, StateCode, WorkerRole};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_binary_ingest_eos_completes_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path().join("sto")).unwrap());
        let finished = TransferRegistry::new();
        let ingest = BinaryIngest::new(storage, finished.clone());

        ingest
            .ingest(BinaryLetter::new("7_B1", Bytes::from_static(b"abc"), "out.bin", "v1", ""))
            .await
            .unwrap();
        ingest
            .ingest(BinaryLetter::new("7_B1", Bytes::from_static(b"def"), "out.bin", "v1", ""))
            .await
            .unwrap();
        ingest
            .ingest(BinaryLetter::end_of_stream("7_B1", "out.bin", "v1"))
            .await
            .unwrap();

        let path = finished.path_of("7_B1").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");

        // A duplicate terminator is ignored.
        ingest
            .ingest(BinaryLetter::end_of_stream("7_B1", "out.bin", "v1"))
            .await
            .unwrap();
        assert_eq!(finished.path_of("7_B1").unwrap(), path);
    }

    #[tokio::test]
    async fn test_wsc_notify_flips_worker_state() {
        let room = WorkerRoom::new(Duration::from_secs(300), EventRouter::new());
        let (tx, _rx) = mpsc::channel(4);
        let worker = Worker::new("w1", WorkerRole::Normal, 2, tx, CancellationToken::new());
        room.install_for_test(worker.clone());

        let handler = WscNotifyHandler::new(room.clone());
        handler
            .handle(
                &worker,
                Letter::Notify(NotifyLetter::wsc("w1", WSC_STATE_PENDING)),
            )
            .await
            .unwrap();
        assert_eq!(worker.state(), WorkerState::Pending);

        handler
            .handle(
                &worker,
                Letter::Notify(NotifyLetter::wsc("w1", WSC_STATE_READY)),
            )
            .await
            .unwrap();
        assert_eq!(worker.state(), WorkerState::Online);
    }

    /// End-to-end of the master-side response path: IN_PROC then FIN with
    /// a stored artifact terminates the job.
    #[tokio::test]
    async fn test_response_flow_drives_job_to_fin() {
        let dir = tempfile::tempdir().unwrap();
        let result_dir = dir.path().join("results");

        let yaml = format!(
            r#"
Address: "127.0.0.1"
Port: 8024
ResultDir: "{}"
LogDir: "{}"
dataPort: 8025
JOB_COMMAND_GL8900:
  cmd: ["echo ok > out"]
  output: "out"
"#,
            result_dir.display(),
            dir.path().join("logs").display()
        );
        let config: Arc<MasterConfig> = Arc::new(serde_yaml::from_str(&yaml).unwrap());

        let records = RecordStore::open(&dir.path().join("records")).unwrap();
        let pdb = Arc::new(
            PersistentStore::open(dir.path().join("pdb"), records.clone())
                .await
                .unwrap(),
        );

        let tracker = Arc::new(TaskTracker::new());
        let room = WorkerRoom::new(Duration::from_secs(300), EventRouter::new());
        let (notify_tx, notify_rx) = mpsc::channel(64);
        let dispatcher = Dispatcher::new(tracker.clone(), room.clone(), notify_tx);

        let (dispatch_tx, dispatch_rx) = mpsc::channel(64);
        let master = JobMaster::new(config, records.clone(), pdb, dispatch_tx);

        let cancel = CancellationToken::new();
        tokio::spawn(dispatcher.clone().run_endpoint(dispatch_rx, cancel.clone()));
        tokio::spawn(master.clone().run_notify(notify_rx, cancel.clone()));

        // One online worker takes the task.
        let (wtx, mut wrx) = mpsc::channel(64);
        let worker = Worker::new("w1", WorkerRole::Normal, 2, wtx, CancellationToken::new());
        room.install_for_test(worker.clone());

        let mut info = BTreeMap::new();
        info.insert("sn".to_string(), "s1".to_string());
        info.insert("vsn".to_string(), "v1".to_string());
        master.do_job(Job::new("J", "GL8900", info)).await.unwrap();

        // Let the endpoint pump track the task, then place it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.dispatch_step().await;
        assert_eq!(tracker.which_worker("1_GL8900"), Some("w1".into()));
        let _new_task = wrx.recv().await.unwrap();

        // Prepare the artifact the worker "streamed".
        let storage = Arc::new(Storage::new(dir.path().join("sto")).unwrap());
        let finished = TransferRegistry::new();
        let ingest = BinaryIngest::new(storage, finished.clone());
        ingest
            .ingest(BinaryLetter::new(
                "1_GL8900",
                Bytes::from_static(b"artifact"),
                "out",
                "v1",
                "",
            ))
            .await
            .unwrap();
        ingest
            .ingest(BinaryLetter::end_of_stream("1_GL8900", "out", "v1"))
            .await
            .unwrap();

        let handler = ResponseHandler::new(
            dispatcher.clone(),
            master.clone(),
            finished,
            result_dir.clone(),
        );

        handler
            .handle(
                &worker,
                Letter::Response(ResponseLetter::new("w1", "1_GL8900", StateCode::InProc)),
            )
            .await
            .unwrap();

        handler
            .handle(
                &worker,
                Letter::Response(ResponseLetter::new("w1", "1_GL8900", StateCode::Finished)),
            )
            .await
            .unwrap();

        // The notify pump terminates the job asynchronously.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!master.job_exists(1).await);
        let history = records.histories().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].job, "J");
        let stored = result_dir.join("1").join("out");
        assert!(stored.exists());
        assert_eq!(history[0].file_path, stored.display().to_string());
        assert_eq!(std::fs::read(stored).unwrap(), b"artifact");

        assert_eq!(worker.num_of_task_proc(), 0);
        assert!(!tracker.is_in_track("1_GL8900"));
        cancel.cancel();
    }
}
