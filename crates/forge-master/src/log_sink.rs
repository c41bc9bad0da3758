// File sink for worker log letters: one append-only file per registered
// log id under the configured log directory, each line stamped in UTC.

use chrono::Utc;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::Mutex;

pub struct LogSink {
    dir: PathBuf,
    files: Mutex<HashMap<String, std::fs::File>>,
}

impl LogSink {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Open (or reopen for append) the file behind a log id.
    pub async fn register(&self, log_id: &str) -> std::io::Result<()> {
        let mut files = self.files.lock().await;
        if files.contains_key(log_id) {
            return Ok(());
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(log_id))?;
        files.insert(log_id.to_string(), file);
        Ok(())
    }

    /// Append one message; unregistered ids are registered on the fly.
    pub async fn put(&self, log_id: &str, message: &str) -> std::io::Result<()> {
        {
            let files = self.files.lock().await;
            if !files.contains_key(log_id) {
                drop(files);
                self.register(log_id).await?;
            }
        }

        let mut files = self.files.lock().await;
        if let Some(file) = files.get_mut(log_id) {
            writeln!(file, "{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), message)?;
        }
        Ok(())
    }
}
