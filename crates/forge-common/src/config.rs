// YAML configuration surfaces for the master and worker processes.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::letter::WorkerRole;
use crate::recipe::Recipe;

/// Prefix of recipe keys in the master configuration.
pub const JOB_COMMAND_PREFIX: &str = "JOB_COMMAND_";

fn default_waiting_interval() -> u64 {
    300
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("storage")
}

fn default_pdb_dir() -> PathBuf {
    PathBuf::from("pdb")
}

fn default_record_dir() -> PathBuf {
    PathBuf::from("records")
}

fn default_post_dir() -> PathBuf {
    PathBuf::from("Post")
}

/// Master-side configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,

    /// Destination for finished artifacts, also the published result root.
    #[serde(rename = "ResultDir")]
    pub result_dir: PathBuf,
    #[serde(rename = "LogDir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_storage_dir", rename = "StorageDir")]
    pub storage_dir: PathBuf,
    #[serde(default = "default_pdb_dir", rename = "PdbDir")]
    pub pdb_dir: PathBuf,
    #[serde(default = "default_record_dir", rename = "RecordDir")]
    pub record_dir: PathBuf,

    #[serde(default, rename = "TimeZone")]
    pub time_zone: String,

    /// Grace period in seconds before a disconnected worker goes offline.
    #[serde(default = "default_waiting_interval", rename = "WaitingInterval")]
    pub waiting_interval: u64,

    /// Listen port for bulk binary ingest.
    #[serde(rename = "dataPort")]
    pub data_port: u16,
    /// UDP port receiving task-output log datagrams.
    #[serde(default, rename = "logPort")]
    pub log_port: u16,

    // Consumed by the external revision-sync collaborator only.
    #[serde(default, rename = "GitlabUrl")]
    pub gitlab_url: String,
    #[serde(default, rename = "PrivateToken")]
    pub private_token: String,
    #[serde(default, rename = "Project_ID")]
    pub project_id: String,

    /// Everything else, notably the `JOB_COMMAND_<id>` recipe entries.
    #[serde(flatten)]
    extras: BTreeMap<String, serde_yaml::Value>,
}

impl MasterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {path:?}"))?;
        serde_yaml::from_str(&raw).with_context(|| format!("failed to parse config {path:?}"))
    }

    /// Look up the recipe bound to a job command id.
    pub fn job_command(&self, cmd_id: &str) -> Option<Recipe> {
        let key = format!("{JOB_COMMAND_PREFIX}{cmd_id}");
        let value = self.extras.get(&key)?;
        match serde_yaml::from_value::<Recipe>(value.clone()) {
            Ok(recipe) => Some(recipe),
            Err(e) => {
                tracing::warn!("recipe {key} is not a valid Build or BuildSet: {e}");
                None
            }
        }
    }
}

/// One remote endpoint as seen from a worker.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
    #[serde(default, rename = "dataPort")]
    pub data_port: u16,
    #[serde(default, rename = "logPort")]
    pub log_port: u16,
}

/// Worker-side configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Self-declared ident; falls back to the hostname when empty.
    #[serde(default, rename = "WORKER_NAME")]
    pub worker_name: String,
    #[serde(rename = "ROLE")]
    pub role: WorkerRole,

    #[serde(rename = "MASTER_ADDRESS")]
    pub master_address: PeerAddress,
    #[serde(default, rename = "MERGER_ADDRESS")]
    pub merger_address: Option<PeerAddress>,

    #[serde(rename = "MAX_TASK_CAN_PROC")]
    pub max_task_can_proc: u32,

    #[serde(rename = "BUILD_DIR")]
    pub build_dir: PathBuf,
    #[serde(default = "default_post_dir", rename = "POST_DIR")]
    pub post_dir: PathBuf,

    #[serde(rename = "REPO_URL")]
    pub repo_url: String,
    #[serde(rename = "PROJECT_NAME")]
    pub project_name: String,
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {path:?}"))?;
        serde_yaml::from_str(&raw).with_context(|| format!("failed to parse config {path:?}"))
    }
}
