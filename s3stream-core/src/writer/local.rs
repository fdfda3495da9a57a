//! Local file writer
//!
//! Writes into a `.tmp` sibling and renames it over the destination on
//! close, so readers never see a partial file. Abort removes the sibling.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use super::FileWriter;
use crate::error::{Result, S3StreamError};

/// Writer for a file on the local file system
pub struct LocalFileWriter {
    path: PathBuf,
    display: String,
    tmp_path: PathBuf,
    file: Option<BufWriter<File>>,
    bytes_appended: u64,
    opened: bool,
    closed: bool,
    published: bool,
}

impl LocalFileWriter {
    /// Create a writer for `path`; nothing touches the disk until `open`
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");

        Self {
            display: path.display().to_string(),
            tmp_path: PathBuf::from(tmp),
            path,
            file: None,
            bytes_appended: 0,
            opened: false,
            closed: false,
            published: false,
        }
    }

    fn io_error(&self, e: std::io::Error) -> S3StreamError {
        S3StreamError::LocalIo {
            path: self.display.clone(),
            message: e.to_string(),
        }
    }

    fn invalid_state(&self, message: &str) -> S3StreamError {
        S3StreamError::InvalidState {
            path: self.display.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl FileWriter for LocalFileWriter {
    fn path(&self) -> &str {
        &self.display
    }

    async fn open(&mut self) -> Result<()> {
        if self.opened {
            return Err(self.invalid_state("already opened"));
        }
        if self.closed {
            return Err(self.invalid_state("open after close"));
        }

        let file = File::create(&self.tmp_path).await.map_err(|e| self.io_error(e))?;
        self.file = Some(BufWriter::new(file));
        self.opened = true;
        debug!("Opened {} via {}", self.display, self.tmp_path.display());
        Ok(())
    }

    async fn appendv(&mut self, slices: &[&[u8]]) -> Result<()> {
        if self.closed {
            return Err(self.invalid_state("append after close"));
        }
        if !self.opened {
            self.open().await?;
        }

        let Some(file) = self.file.as_mut() else {
            return Err(self.invalid_state("no open file"));
        };
        for slice in slices {
            if let Err(e) = file.write_all(slice).await {
                return Err(self.io_error(e));
            }
            self.bytes_appended += slice.len() as u64;
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        if self.closed {
            return Err(self.invalid_state("finalize after close"));
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush().await {
                return Err(self.io_error(e));
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if !self.opened {
            self.open().await?;
        }
        self.closed = true;

        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(|e| self.io_error(e))?;
            file.get_ref().sync_all().await.map_err(|e| self.io_error(e))?;
        }
        fs::rename(&self.tmp_path, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        self.published = true;

        debug!("Closed {} ({} bytes)", self.display, self.bytes_appended);
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        if !self.opened || self.published {
            return Ok(());
        }
        self.closed = true;
        self.file = None;

        match fs::remove_file(&self.tmp_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(self.io_error(e)),
        }
        debug!("Aborted {}", self.display);
        Ok(())
    }

    fn bytes_appended(&self) -> u64 {
        self.bytes_appended
    }
}

impl Drop for LocalFileWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            warn!("Writer for {} dropped before close, discarding it", self.display);
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_publishes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut writer = LocalFileWriter::new(&path);
        writer.appendv(&[b"hello ", b"world"]).await.unwrap();
        assert!(!path.exists());

        writer.finalize().await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        assert_eq!(writer.bytes_appended(), 11);
        assert!(writer.appendv(&[b"more"]).await.is_err());
    }

    #[tokio::test]
    async fn test_abort_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut writer = LocalFileWriter::new(&path);
        writer.append(b"partial").await.unwrap();
        writer.abort().await.unwrap();
        writer.abort().await.unwrap();

        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_empty_close_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");

        let mut writer = LocalFileWriter::new(&path);
        writer.close().await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
