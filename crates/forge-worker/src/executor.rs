// Runs a recipe's command list as one shell chain in its own process
// group, streaming stdout to a callback. Cancellation and the stuck
// watchdog kill the whole group so build children never outlive a task.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// A command chain gets killed after this long without producing output.
const DEFAULT_STUCK_LIMIT: Duration = Duration::from_secs(3600);

/// Callback fed each captured output line (newline included).
pub type OutputProc = Arc<dyn Fn(&str) + Send + Sync>;

pub struct CommandExecutor {
    cmds: Vec<String>,
    cwd: Option<PathBuf>,
    stuck_limit: Duration,
    output_proc: Option<OutputProc>,
    child: Mutex<Option<u32>>,
    running: Mutex<bool>,
}

impl CommandExecutor {
    pub fn new(cmds: Vec<String>) -> Self {
        Self {
            cmds,
            cwd: None,
            stuck_limit: DEFAULT_STUCK_LIMIT,
            output_proc: None,
            child: Mutex::new(None),
            running: Mutex::new(false),
        }
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn stuck_limit(mut self, limit: Duration) -> Self {
        self.stuck_limit = limit;
        self
    }

    pub fn output_proc(mut self, proc: OutputProc) -> Self {
        self.output_proc = Some(proc);
        self
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }

    /// Chain the command list into one failing-fast shell invocation.
    fn shell_line(&self) -> String {
        self.cmds.join(" && ")
    }

    /// Execute the chain. Returns the exit code; -1 when the process was
    /// killed (watchdog or `stop`) or could not be spawned.
    pub async fn run(&self) -> i32 {
        if self.cmds.is_empty() {
            return -1;
        }

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(self.shell_line())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        // The chain gets its own process group so stop() reaches every
        // descendant.
        #[cfg(unix)]
        command.process_group(0);

        let mut child: Child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("failed to spawn shell: {e}");
                return -1;
            }
        };

        *self.child.lock().unwrap() = child.id();
        *self.running.lock().unwrap() = true;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let last_output = Arc::new(Mutex::new(Instant::now()));

        let mut readers = Vec::new();
        if let Some(stdout) = stdout {
            readers.push(tokio::spawn(Self::pump_lines(
                BufReader::new(stdout),
                self.output_proc.clone(),
                last_output.clone(),
            )));
        }
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(Self::pump_lines(
                BufReader::new(stderr),
                self.output_proc.clone(),
                last_output.clone(),
            )));
        }

        let code = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.ok().and_then(|s| s.code()).unwrap_or(-1);
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    let idle = last_output.lock().unwrap().elapsed();
                    if idle > self.stuck_limit {
                        tracing::warn!("command chain stuck for {idle:?}; killing");
                        self.kill_group();
                        let _ = child.wait().await;
                        break -1;
                    }
                }
            }
        };

        for reader in readers {
            let _ = reader.await;
        }

        *self.child.lock().unwrap() = None;
        *self.running.lock().unwrap() = false;
        code
    }

    async fn pump_lines<R>(
        reader: BufReader<R>,
        proc: Option<OutputProc>,
        last_output: Arc<Mutex<Instant>>,
    ) where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            *last_output.lock().unwrap() = Instant::now();
            if let Some(proc) = &proc {
                proc(&format!("{line}\n"));
            }
        }
    }

    /// Terminate the running chain and all of its descendants.
    pub async fn stop(&self) {
        self.kill_group();
        // Give the group a moment to die before callers reuse state.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn kill_group(&self) {
        let pid = *self.child.lock().unwrap();
        let Some(pid) = pid else { return };

        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
        }
    }
}
