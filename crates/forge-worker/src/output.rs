// Outbound surface the processing units talk through: control letters to
// the master, artifact streams to master or merger, and the UDP task-log
// channel. The connector is the production implementation.

use async_trait::async_trait;
use forge_common::letter::Letter;
use std::path::Path;

/// Stream targets for artifact transfers.
pub const TARGET_MASTER: &str = "master";
pub const TARGET_MERGER: &str = "merger";

#[async_trait]
pub trait Output: Send + Sync {
    /// Send a letter over the control link to the master.
    async fn send(&self, letter: Letter) -> anyhow::Result<()>;

    /// Stream a file to a target's data endpoint as binary frames
    /// followed by the empty end-of-stream terminator.
    async fn send_file(
        &self,
        target: &str,
        path: &Path,
        tid: &str,
        version: &str,
        file_name: &str,
        menu: &str,
    ) -> anyhow::Result<()>;

    /// Ship one chunk of task output over the UDP log channel.
    /// Best effort; losses are acceptable.
    async fn task_log(&self, tid: &str, message: &str);
}
