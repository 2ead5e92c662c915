//! Filesystem-backed stores for local development and replay.
//!
//! [`LocalBlobStore`] maps archive keys onto a directory tree. Writes go to
//! a temporary sibling file first and are renamed into place, so a reader
//! never observes a partially written blob.
//!
//! [`JsonlTableStore`] keeps one `<table>.jsonl` file per table and only
//! ever opens it in append mode.

use super::{BlobStore, Row, TableStore, is_valid_table_name};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;

/// Blob store writing each object to `root/<key>`.
#[derive(Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl LocalBlobStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        tracing::info!("LocalBlobStore initialized: root={}", root.display());
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path inside the root, rejecting escapes.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(Error::BlobStore(format!("invalid blob key: {:?}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(format!(".tmp-{}-{}", std::process::id(), n));
        let tmp_path = path.with_file_name(tmp_name);

        let write = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        tracing::trace!(key, bytes = data.len(), "blob written");
        Ok(())
    }
}

/// Table store appending JSON lines to `dir/<table>.jsonl`.
#[derive(Debug)]
pub struct JsonlTableStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlTableStore {
    /// Create a store writing into `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        tracing::info!("JsonlTableStore initialized: dir={}", dir.display());
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Path of the file backing `table`.
    pub fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", table))
    }
}

#[async_trait]
impl TableStore for JsonlTableStore {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn append(&self, table: &str, rows: &[Row]) -> Result<()> {
        if !is_valid_table_name(table) {
            return Err(Error::TableStore(format!("invalid table name: {:?}", table)));
        }
        if rows.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(rows.len() * 256);
        for row in rows {
            serde_json::to_writer(&mut buf, row)?;
            buf.push(b'\n');
        }

        // Appends from concurrent flushes must not interleave.
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.table_path(table))
            .await?;
        file.write_all(&buf).await?;
        file.sync_data().await?;

        Ok(())
    }
}
