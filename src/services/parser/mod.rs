//! File parser
//!
//! Turns an uploaded shareholder register into a stream of `WorkerEvent`s:
//! - CSV is streamed on a dedicated OS thread (`csv_worker`) that accepts
//!   pause/resume/cancel commands while it runs
//! - XLSX/XLS/XLSM/ODS is read whole on a blocking thread (`xlsx`) and the
//!   resulting rows are replayed as the same events
//!
//! Both paths normalize rows and cut them into batches through `RowSink`, so
//! the session controller consumes one protocol regardless of format.

mod csv_worker;
mod xlsx;

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::defaults;
use crate::error::ImportError;
use crate::services::normalizer::{normalize_orgnr, normalize_row, recognizes_headers};
use crate::types::{CellValue, NormalizedRow, RawRow};

// =============================================================================
// Worker protocol
// =============================================================================

/// Command sent to the CSV worker thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    ParseFile(PathBuf),
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Event emitted by a parser
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Log {
        level: LogLevel,
        message: String,
    },
    ParseStart {
        file_name: String,
        file_size: u64,
    },
    Progress {
        rows_read: u64,
        valid_rows: u64,
        invalid_rows: u64,
        bytes_read: u64,
        file_size: u64,
        memory_estimate_bytes: u64,
    },
    BatchReady {
        batch_index: u64,
        rows: Vec<NormalizedRow>,
    },
    ParseComplete {
        total_rows: u64,
        valid_rows: u64,
        invalid_rows: u64,
        total_batches: u64,
    },
    Error {
        message: String,
    },
    Paused,
    Resumed,
}

/// Accepted input formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Spreadsheet,
}

impl FileFormat {
    /// Detect the format from the file extension
    pub fn detect(path: &Path) -> Result<Self, ImportError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "csv" | "txt" => Ok(FileFormat::Csv),
            "xlsx" | "xls" | "xlsm" | "ods" => Ok(FileFormat::Spreadsheet),
            _ => Err(ImportError::UnsupportedFormat(ext)),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Running parser: an event stream plus, for CSV, the command channel
pub struct ParserHandle {
    pub format: FileFormat,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
    commands: Option<std::sync::mpsc::Sender<WorkerCommand>>,
}

impl ParserHandle {
    /// Clone of the command channel, `None` for spreadsheets
    pub fn commands(&self) -> Option<std::sync::mpsc::Sender<WorkerCommand>> {
        self.commands.clone()
    }
}

/// Start parsing `path`, emitting batches of `batch_size` rows
pub fn spawn_parser(path: &Path, batch_size: usize) -> Result<ParserHandle, ImportError> {
    let format = FileFormat::detect(path)?;
    let (event_tx, events) = mpsc::unbounded_channel();
    debug!("Starting {:?} parser for {}", format, path.display());

    let commands = match format {
        FileFormat::Csv => {
            let commands = csv_worker::spawn(event_tx, batch_size)
                .map_err(|e| ImportError::Parse(format!("failed to start CSV worker: {}", e)))?;
            commands
                .send(WorkerCommand::ParseFile(path.to_path_buf()))
                .map_err(|_| ImportError::Parse("CSV worker exited before start".to_string()))?;
            Some(commands)
        }
        FileFormat::Spreadsheet => {
            xlsx::spawn(path.to_path_buf(), event_tx, batch_size);
            None
        }
    };

    Ok(ParserHandle { format, events, commands })
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// =============================================================================
// Column layout
// =============================================================================

/// How data cells map onto row keys, decided once from the first row
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ColumnLayout {
    Named(Vec<String>),
    Positional,
}

impl ColumnLayout {
    /// Named when the first row holds a known header. Otherwise positional,
    /// and the first row is returned as data when column A is an orgnr.
    pub fn detect(first_row: &[String]) -> (Self, Option<RawRow>) {
        if recognizes_headers(first_row) {
            return (ColumnLayout::Named(first_row.to_vec()), None);
        }
        let leading = first_row
            .first()
            .and_then(|cell| normalize_orgnr(cell))
            .map(|_| RawRow::positional(first_row.iter().map(|c| CellValue::Text(c.clone()))));
        (ColumnLayout::Positional, leading)
    }

    pub fn row<I>(&self, values: I) -> RawRow
    where
        I: IntoIterator<Item = CellValue>,
    {
        match self {
            ColumnLayout::Named(headers) => RawRow::from_cells(headers, values),
            ColumnLayout::Positional => RawRow::positional(values),
        }
    }
}

// =============================================================================
// Row sink
// =============================================================================

/// The event receiver was dropped; the parser should stop
#[derive(Debug)]
pub(crate) struct ReceiverGone;

/// Normalizes raw rows, counts them and emits `Progress`/`BatchReady` events
pub(crate) struct RowSink {
    events: mpsc::UnboundedSender<WorkerEvent>,
    batch_size: usize,
    file_size: u64,
    pending: Vec<NormalizedRow>,
    pending_bytes: u64,
    rows_read: u64,
    valid_rows: u64,
    invalid_rows: u64,
    batches: u64,
}

impl RowSink {
    pub fn new(events: mpsc::UnboundedSender<WorkerEvent>, batch_size: usize, file_size: u64) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            events,
            batch_size,
            file_size,
            pending: Vec::with_capacity(batch_size),
            pending_bytes: 0,
            rows_read: 0,
            valid_rows: 0,
            invalid_rows: 0,
            batches: 0,
        }
    }

    pub fn emit(&self, event: WorkerEvent) -> Result<(), ReceiverGone> {
        self.events.send(event).map_err(|_| ReceiverGone)
    }

    pub fn log(&self, level: LogLevel, message: String) -> Result<(), ReceiverGone> {
        self.emit(WorkerEvent::Log { level, message })
    }

    /// Add one data row. Blank rows are skipped without counting.
    pub fn push(&mut self, raw: &RawRow, bytes_read: u64) -> Result<(), ReceiverGone> {
        if raw.is_blank() {
            return Ok(());
        }
        self.rows_read += 1;
        let row = normalize_row(raw, self.rows_read);

        match row.rejection() {
            Some(issue) => {
                self.invalid_rows += 1;
                self.log(LogLevel::Error, issue.to_string())?;
            }
            None => self.valid_rows += 1,
        }

        self.pending_bytes += raw.approx_size() as u64;
        self.pending.push(row);

        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        if self.rows_read % defaults::PROGRESS_EVERY_ROWS == 0 {
            self.progress(bytes_read)?;
        }
        Ok(())
    }

    pub fn progress(&self, bytes_read: u64) -> Result<(), ReceiverGone> {
        self.emit(WorkerEvent::Progress {
            rows_read: self.rows_read,
            valid_rows: self.valid_rows,
            invalid_rows: self.invalid_rows,
            bytes_read,
            file_size: self.file_size,
            memory_estimate_bytes: self.pending_bytes,
        })
    }

    fn flush(&mut self) -> Result<(), ReceiverGone> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let rows = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
        self.pending_bytes = 0;
        let batch_index = self.batches;
        self.batches += 1;
        self.emit(WorkerEvent::BatchReady { batch_index, rows })
    }

    /// Flush the final partial batch and emit `ParseComplete`
    pub fn finish(mut self) -> Result<(), ReceiverGone> {
        self.flush()?;
        self.progress(self.file_size)?;
        self.emit(WorkerEvent::ParseComplete {
            total_rows: self.rows_read,
            valid_rows: self.valid_rows,
            invalid_rows: self.invalid_rows,
            total_batches: self.batches,
        })
    }
}
