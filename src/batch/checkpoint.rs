//! Checkpoint stores for crash recovery
//!
//! The file store is an append-only JSON Lines log: each flush appends the
//! buffered records, recovery reads them back (last write per row wins) and
//! compaction rewrites the log atomically without superseded entries.

use super::record::PredictionRecord;
use super::table::write_atomic;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Durable holder of prediction records
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Recovered records, one per row, ordered by row index
    async fn load(&self) -> Result<Vec<PredictionRecord>>;

    /// Durably append a batch of records
    async fn append(&self, records: &[PredictionRecord]) -> Result<()>;

    /// Drop superseded entries; returns the number of records kept
    async fn compact(&self) -> Result<usize>;
}

/// Keep the last record for each row, ordered by row index
fn dedupe(records: impl IntoIterator<Item = PredictionRecord>) -> Vec<PredictionRecord> {
    records
        .into_iter()
        .map(|record| (record.row_index, record))
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .collect()
}

/// Append-only JSON Lines checkpoint file
pub struct JsonlCheckpointStore {
    path: PathBuf,
    writer: Mutex<()>,
}

impl JsonlCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the log, repairing a torn final line left by a crash
    async fn read_log(&self) -> Result<Vec<PredictionRecord>> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut valid_len = 0;
        let mut offset = 0;
        for chunk in data.split_inclusive(|byte| *byte == b'\n') {
            let start = offset;
            offset += chunk.len();
            let complete = chunk.ends_with(b"\n");
            let line = chunk.strip_suffix(b"\n").unwrap_or(chunk);
            if line.iter().all(u8::is_ascii_whitespace) {
                if complete {
                    valid_len = offset;
                }
                continue;
            }

            if !complete {
                warn!(
                    path = %self.path.display(),
                    offset = start,
                    "Discarding unterminated final checkpoint entry"
                );
                continue;
            }

            let record: PredictionRecord = serde_json::from_slice(line).map_err(|e| {
                PipelineError::persistence(format!(
                    "corrupt checkpoint entry at byte {} of {}: {}",
                    start,
                    self.path.display(),
                    e
                ))
            })?;
            records.push(record);
            valid_len = offset;
        }

        if valid_len < data.len() {
            // later appends must start on a fresh line
            let file = OpenOptions::new().write(true).open(&self.path).await?;
            file.set_len(valid_len as u64).await?;
            file.sync_all().await?;
        }

        Ok(records)
    }

    /// Cut an unterminated tail back to the last newline; returns the log length
    async fn trim_torn_tail(&self) -> Result<u64> {
        let mut file = match OpenOptions::new().read(true).write(true).open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        if len == 0 {
            return Ok(0);
        }

        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1)).await?;
        file.read_exact(&mut last).await?;
        if last[0] == b'\n' {
            return Ok(len);
        }

        let data = fs::read(&self.path).await?;
        let keep = data
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map_or(0, |pos| pos + 1) as u64;
        warn!(
            path = %self.path.display(),
            discarded = len - keep,
            "Trimming unterminated checkpoint tail before append"
        );
        file.set_len(keep).await?;
        file.sync_all().await?;
        Ok(keep)
    }

    async fn write_tail(&self, buffer: &[u8]) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buffer).await?;
        file.flush().await?;
        file.sync_data().await
    }
}

#[async_trait]
impl CheckpointStore for JsonlCheckpointStore {
    async fn load(&self) -> Result<Vec<PredictionRecord>> {
        let _guard = self.writer.lock().await;
        let raw = self.read_log().await?;
        let entries = raw.len();
        let records = dedupe(raw);
        info!(
            path = %self.path.display(),
            entries,
            records = records.len(),
            "Loaded checkpoint"
        );
        Ok(records)
    }

    async fn append(&self, records: &[PredictionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        let _guard = self.writer.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let committed = self.trim_torn_tail().await?;
        if let Err(e) = self.write_tail(&buffer).await {
            // roll back a partial write so a retried append starts on a clean line
            if let Ok(file) = OpenOptions::new().write(true).open(&self.path).await {
                if let Err(rollback) = file.set_len(committed).await {
                    warn!(path = %self.path.display(), "Checkpoint rollback failed: {}", rollback);
                }
            }
            return Err(e.into());
        }

        debug!(path = %self.path.display(), records = records.len(), "Appended checkpoint records");
        Ok(())
    }

    async fn compact(&self) -> Result<usize> {
        let _guard = self.writer.lock().await;
        let raw = self.read_log().await?;
        let entries = raw.len();
        let records = dedupe(raw);

        let mut buffer = Vec::new();
        for record in &records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }
        write_atomic(&self.path, &buffer).await?;

        info!(
            path = %self.path.display(),
            before = entries,
            after = records.len(),
            "Compacted checkpoint"
        );
        Ok(records.len())
    }
}

/// Checkpoint store held in memory
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    entries: StdMutex<Vec<PredictionRecord>>,
    flushes: StdMutex<Vec<usize>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes of the appended batches, in order
    pub fn flush_sizes(&self) -> Vec<usize> {
        self.flushes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Raw entries, including superseded ones
    pub fn entries(&self) -> Vec<PredictionRecord> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self) -> Result<Vec<PredictionRecord>> {
        Ok(dedupe(self.entries()))
    }

    async fn append(&self, records: &[PredictionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(records);
        self.flushes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(records.len());
        Ok(())
    }

    async fn compact(&self) -> Result<usize> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let compacted = dedupe(entries.drain(..));
        let kept = compacted.len();
        *entries = compacted;
        Ok(kept)
    }
}
