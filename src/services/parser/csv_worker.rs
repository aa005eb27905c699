//! Streaming CSV worker
//!
//! Runs on its own OS thread. Waits for `ParseFile`, then reads the file
//! record by record, checking the command channel between records so the
//! controller can pause, resume or cancel mid-file.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use super::{file_name_of, ColumnLayout, LogLevel, ReceiverGone, RowSink, WorkerCommand, WorkerEvent};
use crate::types::{CellValue, RawRow};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const CANDIDATE_DELIMITERS: [u8; 3] = [b';', b',', b'\t'];

/// Spawn the worker thread, returning its command channel
pub fn spawn(events: UnboundedSender<WorkerEvent>, batch_size: usize) -> io::Result<Sender<WorkerCommand>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("csv-parser".to_string())
        .spawn(move || run(rx, events, batch_size))?;
    Ok(tx)
}

enum Control {
    Continue,
    Stop,
}

fn run(commands: Receiver<WorkerCommand>, events: UnboundedSender<WorkerEvent>, batch_size: usize) {
    // A pause sent before the file arrives holds the parse at its first record
    let mut paused = false;
    while let Ok(command) = commands.recv() {
        match command {
            WorkerCommand::ParseFile(path) => {
                if let Err(message) = parse_file(&path, &commands, events.clone(), batch_size, paused) {
                    let _ = events.send(WorkerEvent::Error { message });
                }
                // One file per worker
                break;
            }
            WorkerCommand::Cancel => break,
            WorkerCommand::Pause => paused = true,
            WorkerCommand::Resume => paused = false,
        }
    }
    debug!("CSV worker thread exiting");
}

/// Apply pending commands; blocks while paused
fn poll_commands(commands: &Receiver<WorkerCommand>, sink: &RowSink) -> Result<Control, ReceiverGone> {
    loop {
        match commands.try_recv() {
            Ok(WorkerCommand::Cancel) | Err(TryRecvError::Disconnected) => return Ok(Control::Stop),
            Ok(WorkerCommand::Pause) => {
                if let Control::Stop = hold(commands, sink)? {
                    return Ok(Control::Stop);
                }
            }
            Ok(_) => {}
            Err(TryRecvError::Empty) => return Ok(Control::Continue),
        }
    }
}

/// Emit `Paused` and block until `Resume` (then emit `Resumed`) or `Cancel`
fn hold(commands: &Receiver<WorkerCommand>, sink: &RowSink) -> Result<Control, ReceiverGone> {
    sink.emit(WorkerEvent::Paused)?;
    loop {
        match commands.recv() {
            Ok(WorkerCommand::Resume) => {
                sink.emit(WorkerEvent::Resumed)?;
                return Ok(Control::Continue);
            }
            Ok(WorkerCommand::Cancel) | Err(_) => return Ok(Control::Stop),
            Ok(_) => {}
        }
    }
}

/// Pick the candidate delimiter that occurs most often outside quotes
pub(crate) fn sniff_delimiter(header_line: &[u8]) -> u8 {
    let mut counts = [0usize; CANDIDATE_DELIMITERS.len()];
    let mut in_quotes = false;
    for &b in header_line {
        if b == b'"' {
            in_quotes = !in_quotes;
        } else if !in_quotes {
            if let Some(i) = CANDIDATE_DELIMITERS.iter().position(|d| *d == b) {
                counts[i] += 1;
            }
        }
    }
    let (best, count) = counts
        .iter()
        .enumerate()
        .max_by_key(|(i, c)| (**c, std::cmp::Reverse(*i)))
        .map(|(i, c)| (CANDIDATE_DELIMITERS[i], *c))
        .unwrap_or((b',', 0));
    if count == 0 {
        b','
    } else {
        best
    }
}

fn lossy(field: &[u8]) -> String {
    String::from_utf8_lossy(field).into_owned()
}

/// Returns a message for fatal errors. Row-level problems are logged and skipped.
fn parse_file(
    path: &Path,
    commands: &Receiver<WorkerCommand>,
    events: UnboundedSender<WorkerEvent>,
    batch_size: usize,
    start_paused: bool,
) -> Result<(), String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let file_size = file.metadata().map(|m| m.len()).unwrap_or(0);
    let file_name = file_name_of(path);
    let mut reader = BufReader::with_capacity(64 * 1024, file);

    let sink = RowSink::new(events, batch_size, file_size);
    if sink.emit(WorkerEvent::ParseStart { file_name: file_name.clone(), file_size }).is_err() {
        return Ok(());
    }

    let buffered = reader.fill_buf().map_err(|e| format!("read error: {}", e))?;
    let bom = buffered.starts_with(UTF8_BOM);
    let first_line_end = buffered.iter().position(|b| *b == b'\n').unwrap_or(buffered.len());
    let start = if bom { UTF8_BOM.len() } else { 0 };
    let delimiter = sniff_delimiter(&buffered[start.min(first_line_end)..first_line_end]);
    if bom {
        reader.consume(UTF8_BOM.len());
    }

    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader
        .byte_headers()
        .map_err(|e| format!("unreadable header in {}: {}", file_name, e))?
        .iter()
        .map(lossy)
        .collect();

    let (layout, leading) = ColumnLayout::detect(&headers);
    info!(
        "Parsing {} ({} bytes, delimiter {:?}, {} columns, {} layout)",
        file_name,
        file_size,
        delimiter as char,
        headers.len(),
        if matches!(layout, ColumnLayout::Positional) { "positional" } else { "named" }
    );

    match stream_records(&mut csv_reader, &layout, leading, commands, sink, start_paused) {
        Ok(()) | Err(StreamError::ReceiverGone) => Ok(()),
        Err(StreamError::Fatal(message)) => Err(message),
    }
}

enum StreamError {
    ReceiverGone,
    Fatal(String),
}

impl From<ReceiverGone> for StreamError {
    fn from(_: ReceiverGone) -> Self {
        StreamError::ReceiverGone
    }
}

fn stream_records<R: io::Read>(
    csv_reader: &mut csv::Reader<R>,
    layout: &ColumnLayout,
    leading: Option<RawRow>,
    commands: &Receiver<WorkerCommand>,
    mut sink: RowSink,
    start_paused: bool,
) -> Result<(), StreamError> {
    if start_paused {
        if let Control::Stop = hold(commands, &sink)? {
            sink.log(LogLevel::Warn, "parsing cancelled".to_string())?;
            return Ok(());
        }
    }
    if let Some(raw) = leading {
        sink.push(&raw, csv_reader.position().byte())?;
    }
    let mut record = csv::ByteRecord::new();
    loop {
        if let Control::Stop = poll_commands(commands, &sink)? {
            sink.log(LogLevel::Warn, "parsing cancelled".to_string())?;
            return Ok(());
        }

        match csv_reader.read_byte_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                let raw = layout.row(record.iter().map(|f| CellValue::Text(lossy(f))));
                sink.push(&raw, csv_reader.position().byte())?;
            }
            Err(e) if e.is_io_error() => {
                return Err(StreamError::Fatal(format!("read error: {}", e)));
            }
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or_default();
                sink.log(LogLevel::Error, format!("malformed record at line {}: {}", line, e))?;
            }
        }
    }
    sink.finish()?;
    Ok(())
}
