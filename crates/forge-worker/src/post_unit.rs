// The post processing unit, run by the merger worker: collects artifact
// fragments streamed by sibling workers and, once a post's fragments are
// all present, runs the merge recipe and ships the result to the master.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use forge_common::config::WorkerConfig;
use forge_common::letter::{
    BinaryLetter, Letter, PostTaskLetter, ResponseLetter, StateCode,
};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelEntry;
use crate::executor::CommandExecutor;
use crate::output::{Output, TARGET_MASTER};
use crate::proc_unit::{ProcUnit, UnitCore, UnitState};

pub const POST_UNIT_IDENT: &str = "PostUnit";

#[derive(Debug, Clone, Default)]
struct Frag {
    file_name: String,
    ready: bool,
}

#[derive(Debug)]
struct PostJob {
    ident: String,
    version: String,
    cmds: Vec<String>,
    output_path: String,
    frags: HashMap<String, Frag>,
}

impl PostJob {
    fn ready(&self) -> bool {
        self.frags.values().all(|f| f.ready)
    }
}

pub struct PostProcUnit {
    core: UnitCore,
    config: Arc<WorkerConfig>,
    output: Arc<dyn Output>,
    worker_name: String,
    posts: tokio::sync::Mutex<HashMap<String, PostJob>>,
    running: Mutex<Option<(String, Arc<CommandExecutor>)>>,
}

impl PostProcUnit {
    pub fn new(
        config: Arc<WorkerConfig>,
        output: Arc<dyn Output>,
        worker_name: impl Into<String>,
        channel: ChannelEntry,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: UnitCore::new(POST_UNIT_IDENT, channel),
            config,
            output,
            worker_name: worker_name.into(),
            posts: tokio::sync::Mutex::new(HashMap::new()),
            running: Mutex::new(None),
        })
    }

    fn version_dir(&self, version: &str) -> PathBuf {
        self.config.post_dir.join(version)
    }

    async fn notify_state(&self, tid: &str, state: StateCode) {
        let letter = Letter::Response(ResponseLetter::new(&self.worker_name, tid, state));
        if let Err(e) = self.output.send(letter).await {
            tracing::error!("state report for {tid} failed: {e:#}");
        }
    }

    /// Install a new post and its working directory.
    async fn new_post(&self, letter: PostTaskLetter) {
        let ident = letter.header.ident.clone();
        let mut posts = self.posts.lock().await;
        if posts.contains_key(&ident) {
            return;
        }

        let version = letter.header.version.clone();
        if let Err(e) = tokio::fs::create_dir_all(self.version_dir(&version)).await {
            tracing::error!("post dir for {version} not creatable: {e}");
            drop(posts);
            self.notify_state(&ident, StateCode::Failure).await;
            return;
        }

        let frags = letter
            .content
            .fragments
            .iter()
            .map(|f| (f.clone(), Frag::default()))
            .collect();
        posts.insert(
            ident.clone(),
            PostJob {
                ident,
                version,
                cmds: letter.content.cmds,
                output_path: letter.header.output,
                frags,
            },
        );
    }

    /// Store one fragment frame; an end-of-stream frame marks the
    /// fragment ready and may complete the whole post.
    async fn collect_frag(&self, bin: BinaryLetter) {
        let completed = {
            let mut posts = self.posts.lock().await;
            let Some(post) = posts
                .values_mut()
                .find(|p| p.frags.contains_key(&bin.tid))
            else {
                tracing::debug!("fragment for unknown post: {}", bin.tid);
                return;
            };

            let file_name = if bin.file_name.is_empty() {
                bin.tid.clone()
            } else {
                bin.file_name.clone()
            };
            let dir = self.version_dir(&post.version);

            if !bin.is_end_of_stream() {
                if let Err(e) = append_chunk(&dir, &file_name, &bin.payload).await {
                    tracing::error!("fragment write for {} failed: {e}", bin.tid);
                }
                return;
            }

            let frag = post.frags.get_mut(&bin.tid).expect("frag key just found");
            frag.file_name = file_name;
            frag.ready = true;

            if post.ready() {
                let ident = post.ident.clone();
                posts.remove(&ident)
            } else {
                None
            }
        };

        if let Some(post) = completed {
            self.do_post(post).await;
        }
    }

    /// All fragments present: run the merge recipe in the version's work
    /// dir and stream the result to the master.
    async fn do_post(&self, post: PostJob) {
        let dir = self.version_dir(&post.version);

        let executor = Arc::new(
            CommandExecutor::new(post.cmds.clone()).current_dir(&dir),
        );
        *self.running.lock().unwrap() = Some((post.ident.clone(), executor.clone()));
        let code = executor.run().await;
        *self.running.lock().unwrap() = None;

        let result_path = if post.output_path.starts_with('/') {
            PathBuf::from(&post.output_path)
        } else {
            dir.join(&post.output_path)
        };

        if code == 0 && result_path.exists() {
            let file_name = result_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            let sent = self
                .output
                .send_file(
                    TARGET_MASTER,
                    &result_path,
                    &post.ident,
                    &post.version,
                    &file_name,
                    "",
                )
                .await;

            self.cleanup_version(&post.version).await;
            match sent {
                Ok(()) => self.notify_state(&post.ident, StateCode::Finished).await,
                Err(e) => {
                    tracing::error!("merge result transfer failed: {e:#}");
                    self.notify_state(&post.ident, StateCode::Failure).await;
                }
            }
        } else {
            tracing::warn!(
                "merge for {} failed (code {code}, output {result_path:?})",
                post.ident
            );
            self.cleanup_version(&post.version).await;
            self.notify_state(&post.ident, StateCode::Failure).await;
        }
    }

    async fn cleanup_version(&self, version: &str) {
        let dir = self.version_dir(version);
        if dir.exists() {
            let _ = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(dir)).await;
        }
    }

    pub async fn post_exists(&self, ident: &str) -> bool {
        self.posts.lock().await.contains_key(ident)
    }
}

async fn append_chunk(
    dir: &std::path::Path,
    file_name: &str,
    payload: &[u8],
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(file_name))
        .await?;
    file.write_all(payload).await?;
    Ok(())
}

#[async_trait]
impl ProcUnit for PostProcUnit {
    fn core(&self) -> &UnitCore {
        &self.core
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(e) = std::fs::create_dir_all(&self.config.post_dir) {
            tracing::error!("post dir not creatable: {e}");
            self.core.set_state_notify(UnitState::Excep).await;
            return;
        }
        self.core.set_state_notify(UnitState::Ready).await;

        loop {
            let letter = tokio::select! {
                _ = cancel.cancelled() => return,
                letter = self.core.retrieve() => letter,
            };

            match letter {
                Letter::PostTask(post) => self.new_post(post).await,
                Letter::Binary(bin) => self.collect_frag(bin).await,
                _ => {}
            }
        }
    }

    async fn cleanup(&self) -> bool {
        true
    }

    /// Stop a post wherever it is: mid-merge, waiting on fragments or
    /// still queued.
    async fn cancel(&self, tid: &str) {
        let running = self.running.lock().unwrap().clone();
        if let Some((ident, executor)) = running {
            if ident == tid {
                executor.stop().await;
            }
        }

        let removed = self.posts.lock().await.remove(tid);
        if let Some(post) = removed {
            self.cleanup_version(&post.version).await;
        }

        self.core.remove_where(|letter| {
            matches!(letter, Letter::PostTask(p) if p.header.ident == tid)
        });
    }

    async fn reset(&self) {
        self.core.clear_queue();
        let idents: Vec<String> = self.posts.lock().await.keys().cloned().collect();
        for ident in idents {
            self.cancel(&ident).await;
        }
    }
}
