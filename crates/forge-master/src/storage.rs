// Append-only blob store for incoming artifact streams. Each stream is
// written under <root>/<bucket>/<file-name>; the handler closes the sink
// when the end-of-stream frame arrives.

use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a new artifact stream. An existing file of the same name is
    /// truncated; a stream restart after redispatch overwrites cleanly.
    pub async fn create(&self, bucket: &str, file_name: &str) -> std::io::Result<ArtifactSink> {
        let dir = self.root.join(bucket);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(file_name);
        let file = File::create(&path).await?;
        Ok(ArtifactSink { file, path })
    }
}

/// Write handle for one in-flight artifact stream.
pub struct ArtifactSink {
    file: File,
    path: PathBuf,
}

impl ArtifactSink {
    pub async fn store(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and finish the stream, returning the final path.
    pub async fn close(mut self) -> std::io::Result<PathBuf> {
        self.file.flush().await?;
        Ok(self.path)
    }
}
