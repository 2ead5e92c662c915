//! JSONL replay source.
//!
//! Reads one message per line from a file, a directory of files, or stdin
//! and publishes each line as-is into a [`MemorySubscription`]. Lines are
//! not parsed here: a malformed line becomes a message the decoder rejects,
//! the same as a malformed payload from a live transport.

use super::MemorySubscription;
use crate::{Error, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tributary_core::RawMessage;

/// Where the JSONL source reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonlInput {
    /// Standard input.
    Stdin,
    /// A file, or a directory of `.jsonl`/`.json`/`.ndjson` files.
    Path(PathBuf),
}

impl JsonlInput {
    /// Interpret a command-line argument; `-` means stdin.
    pub fn from_arg(arg: &str) -> Self {
        if arg == "-" {
            Self::Stdin
        } else {
            Self::Path(PathBuf::from(arg))
        }
    }
}

/// Configuration for the JSONL source.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    /// Input file, directory or stdin.
    pub input: JsonlInput,

    /// Limit number of files to process.
    pub limit: Option<usize>,

    /// Pause reading while this many messages wait to be pulled.
    pub max_pending: usize,

    /// Progress reporting interval (lines).
    pub progress_interval: usize,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            input: JsonlInput::Stdin,
            limit: None,
            max_pending: 10_000,
            progress_interval: 100_000,
        }
    }
}

/// What the source read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub files_processed: usize,
    pub lines_read: usize,
    pub blank_lines: usize,
    pub messages_published: usize,
    pub bytes_read: usize,
}

/// Feeds JSONL input into a subscription.
pub struct JsonlSource {
    config: JsonlConfig,
}

impl JsonlSource {
    pub fn new(config: JsonlConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &JsonlConfig {
        &self.config
    }

    /// Collect files to process based on input path.
    fn collect_files(&self, input: &Path) -> Result<Vec<PathBuf>> {
        let mut files = if input.is_file() {
            vec![input.to_path_buf()]
        } else if input.is_dir() {
            let mut entries: Vec<_> = fs::read_dir(input)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|path| {
                    path.is_file()
                        && path
                            .extension()
                            .is_some_and(|ext| ext == "jsonl" || ext == "json" || ext == "ndjson")
                })
                .collect();

            // Sort for deterministic processing order
            entries.sort();
            entries
        } else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Input path does not exist: {}", input.display()),
            )));
        };

        if let Some(limit) = self.config.limit {
            files.truncate(limit);
        }

        Ok(files)
    }

    /// Publish every non-blank line into `subscription`, then close it.
    ///
    /// Stops early when `cancel` fires, even while blocked on input or on a
    /// full queue. The subscription is closed in either case so the consumer
    /// can drain and exit.
    pub async fn run(
        &self,
        subscription: &MemorySubscription,
        cancel: &CancellationToken,
    ) -> Result<SourceStats> {
        let result = self.publish_all(subscription, cancel).await;
        subscription.close();

        if let Ok(stats) = &result {
            tracing::info!(
                files = stats.files_processed,
                lines = stats.lines_read,
                published = stats.messages_published,
                "JSONL input exhausted"
            );
        }
        result
    }

    async fn publish_all(
        &self,
        subscription: &MemorySubscription,
        cancel: &CancellationToken,
    ) -> Result<SourceStats> {
        let mut stats = SourceStats::default();

        match &self.config.input {
            JsonlInput::Stdin => {
                tracing::info!("Reading messages from stdin");
                let reader = BufReader::new(tokio::io::stdin());
                self.publish_lines(reader, "stdin", subscription, cancel, &mut stats)
                    .await?;
                stats.files_processed = 1;
            }
            JsonlInput::Path(path) => {
                let files = self.collect_files(path)?;
                tracing::info!("Found {} JSONL files to process", files.len());

                for (file_idx, file_path) in files.iter().enumerate() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    tracing::info!(
                        "[{}/{}] Processing: {}",
                        file_idx + 1,
                        files.len(),
                        file_path.display()
                    );

                    let file = tokio::fs::File::open(file_path).await?;
                    let label = file_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| file_path.display().to_string());
                    self.publish_lines(BufReader::new(file), &label, subscription, cancel, &mut stats)
                        .await?;
                    stats.files_processed += 1;
                }
            }
        }

        Ok(stats)
    }

    async fn publish_lines<R>(
        &self,
        mut reader: R,
        label: &str,
        subscription: &MemorySubscription,
        cancel: &CancellationToken,
        stats: &mut SourceStats,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::with_capacity(4096);
        let mut line_no = 0usize;

        loop {
            buf.clear();
            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(source = label, line = line_no, "stopping JSONL read");
                    return Ok(());
                }
                n = reader.read_until(b'\n', &mut buf) => n?,
            };
            if n == 0 {
                return Ok(());
            }
            line_no += 1;
            stats.lines_read += 1;
            stats.bytes_read += n;

            let line = trim_line(&buf);
            if line.iter().all(u8::is_ascii_whitespace) {
                stats.blank_lines += 1;
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(
                        source = label,
                        line = line_no,
                        "stopping JSONL read while waiting for queue space"
                    );
                    return Ok(());
                }
                _ = subscription.wait_for_capacity(self.config.max_pending) => {}
            }

            let message = RawMessage::new(format!("{}:{}", label, line_no), line.to_vec())
                .with_publish_time(Utc::now());
            subscription.publish_message(message)?;
            stats.messages_published += 1;

            if self.config.progress_interval > 0
                && stats.lines_read.is_multiple_of(self.config.progress_interval)
            {
                tracing::info!(
                    "Progress: {} lines, {} published",
                    stats.lines_read,
                    stats.messages_published
                );
            }
        }
    }
}

/// Strip the line terminator (`\n` or `\r\n`).
fn trim_line(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}
