// The job processing unit: takes NewTask letters one at a time, prepares
// a clean checkout, runs the recipe's commands and streams the result to
// the master or the merger.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use forge_common::config::WorkerConfig;
use forge_common::letter::{Letter, NewTaskLetter, ResponseLetter, StateCode};
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelEntry;
use crate::executor::CommandExecutor;
use crate::output::{Output, TARGET_MASTER, TARGET_MERGER};
use crate::proc_unit::{ProcUnit, UnitCore, UnitState};

pub const JOB_UNIT_IDENT: &str = "JobUnit";

pub struct JobProcUnit {
    core: UnitCore,
    config: Arc<WorkerConfig>,
    output: Arc<dyn Output>,
    worker_name: String,
    in_proc_tid: Mutex<String>,
    executor: Mutex<Option<Arc<CommandExecutor>>>,
}

impl JobProcUnit {
    pub fn new(
        config: Arc<WorkerConfig>,
        output: Arc<dyn Output>,
        worker_name: impl Into<String>,
        channel: ChannelEntry,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: UnitCore::new(JOB_UNIT_IDENT, channel),
            config,
            output,
            worker_name: worker_name.into(),
            in_proc_tid: Mutex::new(String::new()),
            executor: Mutex::new(None),
        })
    }

    fn project_path(&self) -> PathBuf {
        self.config.build_dir.join(&self.config.project_name)
    }

    async fn notify_state(&self, tid: &str, state: StateCode) {
        let letter = Letter::Response(ResponseLetter::new(&self.worker_name, tid, state));
        if let Err(e) = self.output.send(letter).await {
            tracing::error!("state report for {tid} failed: {e:#}");
        }
    }

    /// The checkout-and-build command chain for one task.
    fn build_commands(&self, job: &NewTaskLetter) -> Vec<String> {
        let mut commands = vec![
            format!("cd {}", self.config.build_dir.display()),
            format!("git clone -b master {}", self.config.repo_url),
            format!("cd {}", self.config.project_name),
            "git fetch".to_string(),
            format!("git checkout -f {}", job.content.sn),
        ];
        commands.extend(job.content.extra.cmds.iter().cloned());
        commands
    }

    async fn do_job(&self, job: NewTaskLetter) {
        let tid = job.header.tid.clone();

        // Start from a clean tree; a leftover checkout that cannot be
        // removed parks the unit in DIRTY.
        if self.project_path().exists() && !self.cleanup().await {
            self.core.set_state_notify(UnitState::Dirty).await;
            self.notify_state(&tid, StateCode::Failure).await;
            return;
        }

        self.notify_state(&tid, StateCode::InProc).await;

        // Relay build output to the master's log channel.
        let (log_tx, mut log_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let log_output = self.output.clone();
        let log_tid = tid.clone();
        let log_pump = tokio::spawn(async move {
            while let Some(chunk) = log_rx.recv().await {
                log_output.task_log(&log_tid, &chunk).await;
            }
        });

        let executor = Arc::new(
            CommandExecutor::new(self.build_commands(&job)).output_proc(Arc::new(move |line| {
                let _ = log_tx.send(line.to_string());
            })),
        );
        *self.executor.lock().unwrap() = Some(executor.clone());
        let code = executor.run().await;
        *self.executor.lock().unwrap() = None;
        // The executor holds the only log sender; release it so the pump
        // can drain out.
        drop(executor);
        let _ = log_pump.await;

        if code != 0 {
            tracing::warn!("task {tid} build exited with {code}");
            if !self.cleanup().await {
                self.core.set_state_notify(UnitState::Dirty).await;
            }
            self.notify_state(&tid, StateCode::Failure).await;
            return;
        }

        if let Err(e) = self.send_result(&job).await {
            tracing::error!("result transfer for {tid} failed: {e:#}");
            self.notify_state(&tid, StateCode::Failure).await;
            let _ = self.cleanup().await;
            return;
        }

        self.notify_state(&tid, StateCode::Finished).await;

        if !self.cleanup().await {
            self.core.set_state_notify(UnitState::Dirty).await;
        }
    }

    /// Stream the build's output file to its destination: the merger when
    /// the task feeds a merge, the master otherwise.
    pub async fn send_result(&self, job: &NewTaskLetter) -> anyhow::Result<()> {
        let result_path = self.project_path().join(&job.content.extra.result_path);
        if !result_path.exists() {
            anyhow::bail!(forge_common::error::ResourceError::ResultFileNotFound(
                result_path
            ));
        }

        let file_name = result_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let target = if job.header.need_post {
            TARGET_MERGER
        } else {
            TARGET_MASTER
        };
        let menu = job.content.extra.post_target.clone().unwrap_or_default();

        self.output
            .send_file(
                target,
                &result_path,
                &job.header.tid,
                &job.content.vsn,
                &file_name,
                &menu,
            )
            .await
    }

    async fn stop_current(&self) {
        let executor = self.executor.lock().unwrap().clone();
        if let Some(executor) = executor {
            executor.stop().await;
        }
        self.in_proc_tid.lock().unwrap().clear();
        self.core.channel().update("isProcessing", "false");
    }
}

#[async_trait]
impl ProcUnit for JobProcUnit {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(e) = std::fs::create_dir_all(&self.config.build_dir) {
            tracing::error!("build dir not creatable: {e}");
            self.core.set_state_notify(UnitState::Excep).await;
            return;
        }
        self.core.set_state_notify(UnitState::Ready).await;

        loop {
            let letter = tokio::select! {
                _ = cancel.cancelled() => return,
                letter = self.core.retrieve() => letter,
            };

            let Letter::NewTask(job) = letter else { continue };

            *self.in_proc_tid.lock().unwrap() = job.header.tid.clone();
            self.core.channel().update("isProcessing", "true");
            self.core.channel().publish(self.core.state()).await;

            self.do_job(job).await;

            self.in_proc_tid.lock().unwrap().clear();
            self.core.channel().update("isProcessing", "false");
            self.core.channel().publish(self.core.state()).await;
        }
    }

    /// Remove the checkout tree. Runs on the blocking pool, the tree can
    /// be large.
    async fn cleanup(&self) -> bool {
        let path = self.project_path();
        if !path.exists() {
            return true;
        }
        tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&path).is_ok())
            .await
            .unwrap_or(false)
    }

    async fn cancel(&self, tid: &str) {
        let current = self.in_proc_tid.lock().unwrap().clone();
        if current == tid {
            self.stop_current().await;
        } else {
            self.core.remove_where(|letter| {
                matches!(letter, Letter::NewTask(t) if t.header.tid == tid)
            });
        }
    }

    async fn reset(&self) {
        self.core.clear_queue();
        self.stop_current().await;
        let _ = self.cleanup().await;
    }
}
