// Shared fixtures for the worker-side unit tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use forge_common::config::WorkerConfig;
use forge_common::letter::{
    Letter, NewTaskContent, NewTaskHeader, NewTaskLetter, StateCode, TaskExtra,
};

use crate::output::Output;

/// A worker config rooted in a temp directory, with a repo URL that no
/// clone can ever reach.
pub fn worker_config(root: &Path) -> WorkerConfig {
    let yaml = format!(
        r#"
WORKER_NAME: "w1"
ROLE: "NORMAL"
MASTER_ADDRESS: {{host: "127.0.0.1", port: 1, dataPort: 2, logPort: 3}}
MAX_TASK_CAN_PROC: 2
BUILD_DIR: "{}"
POST_DIR: "{}"
REPO_URL: "{}"
PROJECT_NAME: "proj"
"#,
        root.join("build").display(),
        root.join("post").display(),
        root.join("no-such-repo.git").display(),
    );
    serde_yaml::from_str(&yaml).unwrap()
}

pub fn new_task_letter(
    tid: &str,
    sn: &str,
    vsn: &str,
    cmds: Vec<String>,
    result_path: &str,
    need_post: bool,
) -> NewTaskLetter {
    NewTaskLetter {
        header: NewTaskHeader {
            tid: tid.to_string(),
            parent: vsn.to_string(),
            need_post,
        },
        content: NewTaskContent {
            sn: sn.to_string(),
            vsn: vsn.to_string(),
            datetime: "2020-01-01 00:00:00".to_string(),
            extra: TaskExtra {
                cmds,
                result_path: result_path.to_string(),
                post_target: if need_post { Some("B1".to_string()) } else { None },
            },
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentFile {
    pub target: String,
    pub path: PathBuf,
    pub tid: String,
    pub version: String,
    pub file_name: String,
    pub menu: String,
}

/// Records everything the units try to emit.
#[derive(Default)]
pub struct FakeOutput {
    pub letters: Mutex<Vec<Letter>>,
    pub files: Mutex<Vec<SentFile>>,
    pub logs: Mutex<Vec<(String, String)>>,
}

impl FakeOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The response states reported for one task, in order.
    pub fn response_states(&self, tid: &str) -> Vec<StateCode> {
        self.letters
            .lock()
            .unwrap()
            .iter()
            .filter_map(|l| match l {
                Letter::Response(r) if r.header.tid == tid => Some(r.content.state),
                _ => None,
            })
            .collect()
    }

    pub fn wsc_states(&self) -> Vec<String> {
        self.letters
            .lock()
            .unwrap()
            .iter()
            .filter_map(|l| match l {
                Letter::Notify(n) => n.wsc_state().map(|s| s.to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn sent_files(&self) -> Vec<SentFile> {
        self.files.lock().unwrap().clone()
    }
}

#[async_trait]
impl Output for FakeOutput {
    async fn send(&self, letter: Letter) -> anyhow::Result<()> {
        self.letters.lock().unwrap().push(letter);
        Ok(())
    }

    async fn send_file(
        &self,
        target: &str,
        path: &Path,
        tid: &str,
        version: &str,
        file_name: &str,
        menu: &str,
    ) -> anyhow::Result<()> {
        self.files.lock().unwrap().push(SentFile {
            target: target.to_string(),
            path: path.to_path_buf(),
            tid: tid.to_string(),
            version: version.to_string(),
            file_name: file_name.to_string(),
            menu: menu.to_string(),
        });
        Ok(())
    }

    async fn task_log(&self, tid: &str, message: &str) {
        self.logs
            .lock()
            .unwrap()
            .push((tid.to_string(), message.to_string()));
    }
}
