// The job master binds incoming jobs to recipes, turns them into tasks,
// drives the job state machine off task-state notifications and keeps the
// persisted job/history records in step.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use forge_common::config::MasterConfig;
use forge_common::error::BindingError;
use forge_common::macros::{MACRO_DATETIME, MACRO_EXTRA, MACRO_VERSION, MacroSpecs};
use forge_common::recipe::Recipe;

use crate::dispatcher::DispatchCmd;
use crate::job::{Job, JobState};
use crate::messages::{BuildResult, ClientMessage};
use crate::pdb::PersistentStore;
use crate::records::{JobHistoryRecord, JobRecord, RecordStore, TaskHistoryRecord};
use crate::task::{Task, TaskKind, TaskState};

/// File-path value recorded for a job that terminated without a result.
const NO_RESULT: &str = "None";

pub struct JobMaster {
    config: Arc<MasterConfig>,
    records: Arc<RecordStore>,
    pdb: Arc<PersistentStore>,
    jobs: Mutex<HashMap<u64, Job>>,
    dispatch_tx: mpsc::Sender<DispatchCmd>,
    messages: broadcast::Sender<ClientMessage>,
}

impl JobMaster {
    pub fn new(
        config: Arc<MasterConfig>,
        records: Arc<RecordStore>,
        pdb: Arc<PersistentStore>,
        dispatch_tx: mpsc::Sender<DispatchCmd>,
    ) -> Arc<Self> {
        let (messages, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            records,
            pdb,
            jobs: Mutex::new(HashMap::new()),
            dispatch_tx,
            messages,
        })
    }

    /// Real-time client message feed.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<ClientMessage> {
        self.messages.subscribe()
    }

    fn publish(&self, msg: ClientMessage) {
        let _ = self.messages.send(msg);
    }

    pub async fn job_exists(&self, unique_id: u64) -> bool {
        self.jobs.lock().await.contains_key(&unique_id)
    }

    /// Accept a job: allocate its unique id, bind it to its recipe,
    /// persist it and hand its tasks to the dispatcher.
    pub async fn do_job(&self, mut job: Job) -> anyhow::Result<()> {
        if !job.is_valid() {
            anyhow::bail!(BindingError::BindFailed("empty jobid or command id".into()));
        }

        job.unique_id = self.records.alloc_unique_id().await?;

        if let Err(e) = self.bind(&mut job).await {
            tracing::warn!("job {} bind failed: {e}", job.jobid);
            self.publish(ClientMessage::job_fail(&job.unique_id.to_string()));
            return Err(e.into());
        }

        self.records
            .put_job(JobRecord {
                unique_id: job.unique_id,
                jobid: job.jobid.clone(),
                cmd_id: job.cmd_id.clone(),
                date_time: Utc::now(),
                info: job.infos().clone(),
            })
            .await?;

        self.start_job(job).await;
        Ok(())
    }

    /// Dispatch a bound job's tasks and announce it to clients.
    async fn start_job(&self, mut job: Job) {
        for task in job.tasks() {
            let _ = self
                .dispatch_tx
                .send(DispatchCmd::Dispatch(task.clone()))
                .await;
        }

        let tasks: Vec<(String, String)> = job
            .tasks()
            .map(|t| (t.trimmed_id().to_string(), t.state().as_str().to_string()))
            .collect();
        self.publish(ClientMessage::job_info(
            &job.unique_id.to_string(),
            &job.jobid,
            &tasks,
        ));

        job.state = JobState::InProcessing;
        self.jobs.lock().await.insert(job.unique_id, job);
    }

    /// Bind the job to the recipe its cmd-id names, producing its tasks.
    /// Nothing is persisted before every check has passed.
    pub async fn bind(&self, job: &mut Job) -> Result<(), BindingError> {
        let recipe = self
            .config
            .job_command(&job.cmd_id)
            .ok_or_else(|| BindingError::CommandNotFound(job.cmd_id.clone()))?;

        let sn = job
            .get_info("sn")
            .ok_or_else(|| BindingError::BindFailed("missing info key 'sn'".into()))?
            .to_string();
        let vsn = job
            .get_info("vsn")
            .ok_or_else(|| BindingError::BindFailed("missing info key 'vsn'".into()))?
            .to_string();

        let mut specs = MacroSpecs::new();
        specs.insert(MACRO_VERSION.to_string(), vsn.clone());
        specs.insert(
            MACRO_DATETIME.to_string(),
            Utc::now().format("%Y%m%d-%H%M%S").to_string(),
        );
        if let Some(extra) = job.get_info("extra") {
            specs.insert(MACRO_EXTRA.to_string(), extra.to_string());
        }

        let uid = job.unique_id;
        match recipe {
            Recipe::Build(mut build) => {
                build.preprocess(&specs);
                let task = Task::new(
                    format!("{uid}_{}", job.cmd_id),
                    &sn,
                    &vsn,
                    TaskKind::Single {
                        build,
                        need_post: false,
                        post_target: None,
                    },
                    uid,
                );
                if !task.is_valid() {
                    return Err(BindingError::BindFailed(format!(
                        "task id '{}' is not sendable",
                        task.id()
                    )));
                }
                job.add_task(task);
            }
            Recipe::Set(mut set) => {
                let mut fragments = Vec::new();
                for (ident, build) in set.builds.iter_mut() {
                    build.preprocess(&specs);
                    let tid = format!("{uid}_{ident}");
                    fragments.push(tid.clone());

                    let task = Task::new(
                        tid,
                        &sn,
                        &vsn,
                        TaskKind::Single {
                            build: build.clone(),
                            need_post: true,
                            post_target: Some(ident.clone()),
                        },
                        uid,
                    );
                    if !task.is_valid() {
                        return Err(BindingError::BindFailed(format!(
                            "task id '{}' is not sendable",
                            task.id()
                        )));
                    }
                    job.add_task(task);
                }

                set.merge.preprocess(&specs);
                let post = Task::new(
                    format!("{uid}_{}", job.jobid),
                    "",
                    &vsn,
                    TaskKind::Post {
                        fragments,
                        merge: set.merge,
                    },
                    uid,
                );
                if !post.is_valid() {
                    return Err(BindingError::BindFailed(format!(
                        "task id '{}' is not sendable",
                        post.id()
                    )));
                }
                job.add_task(post);
            }
        }

        // Every task gets a persistent output log.
        for task in job.tasks() {
            self.pdb
                .create(task.id())
                .await
                .map_err(|e| BindingError::BindFailed(e.to_string()))?;
            let _ = self.pdb.open_key(task.id());
        }

        Ok(())
    }

    /// Replay jobs persisted by a previous run that never terminated.
    pub async fn recover(&self) -> anyhow::Result<()> {
        for record in self.records.unfinished_jobs().await {
            let mut job = Job::new(record.jobid.clone(), record.cmd_id.clone(), record.info);
            job.unique_id = record.unique_id;

            match self.bind(&mut job).await {
                Ok(()) => {
                    tracing::info!("recovered job {} ({})", job.jobid, job.unique_id);
                    self.start_job(job).await;
                }
                Err(e) => {
                    tracing::warn!("job {} no longer bindable: {e}", record.jobid);
                    self.publish(ClientMessage::job_fail(&record.unique_id.to_string()));
                    self.records.remove_job(record.unique_id).await?;
                }
            }
        }
        Ok(())
    }

    /// Consume task-state notifications from the dispatcher's side of the
    /// endpoint pair.
    pub async fn run_notify(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<(String, TaskState)>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                next = rx.recv() => {
                    match next {
                        Some((tid, state)) => self.handle_task_state(&tid, state).await,
                        None => return,
                    }
                }
            }
        }
    }

    /// A task of some job changed state: tell the clients, then maintain
    /// the owning job.
    pub async fn handle_task_state(&self, taskid: &str, state: TaskState) {
        let Some((uid_part, trimmed)) = taskid.split_once('_') else {
            return;
        };
        let Ok(uid) = uid_part.parse::<u64>() else { return };

        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get(&uid) else { return };

        self.publish(ClientMessage::job_state_change(
            &uid.to_string(),
            &job.jobid,
            trimmed,
            state.as_str(),
        ));

        match state {
            TaskState::Finished => {
                let job = jobs.get(&uid).unwrap();
                if job.is_fin() && job.job_result.is_some() {
                    let result = BuildResult {
                        unique_id: uid.to_string(),
                        jobid: job.jobid.clone(),
                        url: job.job_result.clone().unwrap(),
                    };
                    self.terminate(&mut jobs, uid, ClientMessage::job_fin(&uid.to_string()))
                        .await;
                    self.publish(ClientMessage::job_new_result(&result));
                }
            }
            TaskState::Failure => {
                // One failed task invalidates the whole job; cancel the
                // survivors to keep its task set consistent.
                let job = jobs.get(&uid).unwrap();
                let to_cancel: Vec<String> =
                    job.tasks().map(|t| t.id().to_string()).collect();
                for task in job.tasks() {
                    if !task.is_finished() {
                        let _ = task.state_change(TaskState::Failure);
                    }
                }
                for tid in to_cancel {
                    let _ = self.dispatch_tx.send(DispatchCmd::Cancel(tid)).await;
                }
                self.terminate(&mut jobs, uid, ClientMessage::job_fail(&uid.to_string()))
                    .await;
            }
            _ => {}
        }
    }

    /// Record history, drop the persisted row and forget the in-memory job.
    async fn terminate(
        &self,
        jobs: &mut HashMap<u64, Job>,
        uid: u64,
        msg: ClientMessage,
    ) {
        let Some(job) = jobs.remove(&uid) else { return };

        let file_path = match &job.job_result {
            Some(url) if job.is_fin() => url.clone(),
            _ => NO_RESULT.to_string(),
        };

        let tasks: Vec<TaskHistoryRecord> = job
            .tasks()
            .map(|t| TaskHistoryRecord {
                task_name: t.trimmed_id().to_string(),
                state: t.state().as_str().to_string(),
            })
            .collect();

        if let Err(e) = self
            .records
            .record_history(JobHistoryRecord {
                unique_id: uid,
                job: job.jobid.clone(),
                file_path,
                date_time: Utc::now(),
                tasks: tasks.clone(),
            })
            .await
        {
            tracing::error!("history record for job {uid} failed: {e:#}");
        }
        if let Err(e) = self.records.remove_job(uid).await {
            tracing::error!("job row removal for {uid} failed: {e:#}");
        }

        self.publish(msg);
        self.publish(ClientMessage::job_history(&[(
            uid.to_string(),
            job.jobid.clone(),
            tasks
                .into_iter()
                .map(|t| (t.task_name, t.state))
                .collect(),
        )]));
    }

    pub async fn cancel_job(&self, unique_id: u64) {
        let tids: Vec<String> = {
            let jobs = self.jobs.lock().await;
            match jobs.get(&unique_id) {
                Some(job) => job.tasks().map(|t| t.id().to_string()).collect(),
                None => return,
            }
        };
        for tid in tids {
            let _ = self.dispatch_tx.send(DispatchCmd::Cancel(tid)).await;
        }
    }

    /// Record where a job's final artifact ended up.
    pub async fn set_job_result(&self, unique_id: u64, url: String) {
        if let Some(job) = self.jobs.lock().await.get_mut(&unique_id) {
            job.job_result = Some(url);
        }
    }

    pub async fn num_tasks_of(&self, unique_id: u64) -> usize {
        self.jobs
            .lock()
            .await
            .get(&unique_id)
            .map(|j| j.num_of_tasks())
            .unwrap_or(0)
    }

    /// The `Temporary` info flag marks jobs whose result is kept private
    /// instead of being published.
    pub async fn is_temporary(&self, unique_id: u64) -> bool {
        self.jobs
            .lock()
            .await
            .get(&unique_id)
            .and_then(|j| j.get_info("Temporary"))
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// Query surface consumed by the client proxy.
    /// Keys: processing | history | files | task <uid> <tid> <pos>.
    pub async fn query(&self, args: &[&str]) -> Option<ClientMessage> {
        match args {
            ["processing"] => {
                let jobs = self.jobs.lock().await;
                let msgs: Vec<ClientMessage> = jobs
                    .values()
                    .map(|job| {
                        let tasks: Vec<(String, String)> = job
                            .tasks()
                            .map(|t| {
                                (t.trimmed_id().to_string(), t.state().as_str().to_string())
                            })
                            .collect();
                        ClientMessage::job_info(
                            &job.unique_id.to_string(),
                            &job.jobid,
                            &tasks,
                        )
                    })
                    .collect();
                Some(ClientMessage::batch(msgs))
            }

            ["history"] => {
                let rows = self.records.histories().await;
                let jobs: Vec<(String, String, Vec<(String, String)>)> = rows
                    .into_iter()
                    .map(|row| {
                        (
                            row.unique_id.to_string(),
                            row.job,
                            row.tasks
                                .into_iter()
                                .map(|t| (t.task_name, t.state))
                                .collect(),
                        )
                    })
                    .collect();
                Some(ClientMessage::job_history(&jobs))
            }

            ["files"] => {
                let results: Vec<BuildResult> = self
                    .records
                    .histories()
                    .await
                    .into_iter()
                    .filter(|row| row.file_path != NO_RESULT)
                    .map(|row| BuildResult {
                        unique_id: row.unique_id.to_string(),
                        jobid: row.job,
                        url: row.file_path,
                    })
                    .collect();
                if results.is_empty() {
                    return None;
                }
                Some(ClientMessage::job_all_results(&results))
            }

            ["task", uid, tid, pos] => {
                let key = format!("{uid}_{tid}");
                if !self.pdb.is_exists(&key) {
                    return None;
                }
                let pos: i64 = pos.parse().ok()?;
                let output = self.pdb.read_to_tail(&key, pos).await.ok()?;

                let last = {
                    let jobs = self.jobs.lock().await;
                    match uid.parse::<u64>().ok().and_then(|u| jobs.get(&u)) {
                        Some(job) => job
                            .get_task(&key)
                            .map(|t| t.is_finished())
                            .unwrap_or(true),
                        // Terminated jobs have no live tasks left.
                        None => true,
                    }
                };

                Some(ClientMessage::task_output(
                    uid,
                    tid,
                    pos,
                    &String::from_utf8_lossy(&output),
                    last,
                ))
            }

            _ => None,
        }
    }
}
