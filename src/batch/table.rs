//! Tabular input/output
//!
//! Rows are ordered JSON objects; the JSON Lines store reads one object per
//! line and writes the whole table atomically.

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// One table row, columns in insertion order
pub type Row = IndexMap<String, Value>;

/// An ordered set of rows with a known column list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    /// Empty table with declared columns
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Columns are the union of row keys in first-seen order
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut table = Self::default();
        for row in rows {
            table.push(row);
        }
        table
    }

    pub fn push(&mut self, row: Row) {
        for key in row.keys() {
            if !self.columns.iter().any(|column| column == key) {
                self.columns.push(key.clone());
            }
        }
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Text of a cell; `None` for missing or null cells.
///
/// Arrays (a history stored as a list of scans) are joined with newlines.
pub fn cell_text(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|item| match item {
                    Value::Null => None,
                    Value::String(text) => Some(text.clone()),
                    other => Some(other.to_string()),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        other => Some(other.to_string()),
    }
}

/// Durable tabular store
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn read(&self) -> Result<Table>;

    async fn write(&self, table: &Table) -> Result<()>;
}

/// JSON Lines table file
pub struct JsonlTableStore {
    path: PathBuf,
}

impl JsonlTableStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TableStore for JsonlTableStore {
    async fn read(&self) -> Result<Table> {
        let data = fs::read_to_string(&self.path).await.map_err(|e| {
            PipelineError::configuration(format!("cannot read input table {}: {}", self.path.display(), e))
        })?;

        let mut table = Table::default();
        for (line_no, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            // deserializing straight into a Row keeps the file's column order
            let row: Row = serde_json::from_str(line).map_err(|e| {
                PipelineError::configuration(format!("{}:{}: {}", self.path.display(), line_no + 1, e))
            })?;
            table.push(row);
        }

        debug!(path = %self.path.display(), rows = table.len(), "Read input table");
        Ok(table)
    }

    async fn write(&self, table: &Table) -> Result<()> {
        let mut buffer = Vec::new();
        for row in table.rows() {
            serde_json::to_writer(&mut buffer, row)?;
            buffer.push(b'\n');
        }
        write_atomic(&self.path, &buffer).await?;

        info!(path = %self.path.display(), rows = table.len(), "Wrote output table");
        Ok(())
    }
}

/// Write via a sibling temp file and rename, so readers never see a partial file
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(contents).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp_path, path).await?;
    Ok(())
}
