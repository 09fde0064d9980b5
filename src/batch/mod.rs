//! Batch classification: records, checkpoints, tables and the runner

pub mod checkpoint;
pub mod record;
pub mod runner;
pub mod table;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, JsonlCheckpointStore};
pub use record::{extract_status, fingerprint, PredictionRecord, ERROR_STATUS, OUTPUT_COLUMNS};
pub use runner::{BatchReport, BatchRunner, BatchSettings, BatchState, CancelFlag};
pub use table::{cell_text, JsonlTableStore, Row, Table, TableStore};
