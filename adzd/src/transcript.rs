//! Append-only transcript files, one per Run, with tail-read support for
//! late-attaching followers. Transcripts are never rotated, truncated, or
//! deleted here.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

pub struct TranscriptWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl TranscriptWriter {
    /// Create parent directories and open the file for appending.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create transcript dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("open transcript {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Append a chunk. Best-effort: a transcript write failure never fails
    /// the Run.
    pub async fn append(&self, bytes: &[u8]) {
        let mut file = self.file.lock().await;
        if let Err(err) = file.write_all(bytes).await {
            warn!(path = %self.path.display(), err = %err, "transcript write failed");
        }
    }

    pub async fn flush(&self) {
        let mut file = self.file.lock().await;
        if let Err(err) = file.flush().await {
            warn!(path = %self.path.display(), err = %err, "transcript flush failed");
        }
    }
}

/// Read the last `min(file size, max_bytes)` bytes of a transcript.
pub async fn tail(path: &Path, max_bytes: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn append_creates_parents_and_accumulates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".runs/codex-x.log");
        let writer = TranscriptWriter::open(&path).await.unwrap();

        writer.append(b"hello ").await;
        writer.append(b"world").await;
        writer.flush().await;

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn tail_returns_at_most_max_bytes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("t.log");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        assert_eq!(tail(&path, 4).await.unwrap(), b"6789");
        assert_eq!(tail(&path, 100).await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn tail_of_missing_file_errors() {
        let tmp = TempDir::new().unwrap();
        assert!(tail(&tmp.path().join("absent.log"), 64).await.is_err());
    }
}
