//! Spreadsheet reader (XLSX/XLS/XLSM/ODS)
//!
//! The whole first worksheet is loaded with calamine on a blocking thread,
//! first row as headers, then replayed through `RowSink`.

use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use super::{file_name_of, ColumnLayout, RowSink, WorkerEvent};
use crate::types::CellValue;

/// Read `path` on the blocking pool, emitting events as the CSV worker does
pub fn spawn(path: PathBuf, events: UnboundedSender<WorkerEvent>, batch_size: usize) {
    tokio::task::spawn_blocking(move || {
        let file_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let sink = RowSink::new(events.clone(), batch_size, file_size);
        let started = sink.emit(WorkerEvent::ParseStart {
            file_name: file_name_of(&path),
            file_size,
        });
        if started.is_err() {
            return;
        }

        match read_rows(&path) {
            Ok((headers, rows)) => {
                info!(
                    "Read {} rows x {} columns from {}",
                    rows.len(),
                    headers.len(),
                    path.display()
                );
                replay(sink, &headers, rows, file_size);
            }
            Err(message) => {
                warn!("Spreadsheet read failed: {}", message);
                let _ = events.send(WorkerEvent::Error { message });
            }
        }
    });
}

fn replay(mut sink: RowSink, headers: &[String], rows: Vec<Vec<CellValue>>, file_size: u64) {
    let (layout, leading) = ColumnLayout::detect(headers);
    if let Some(raw) = leading {
        if sink.push(&raw, 0).is_err() {
            return;
        }
    }
    let total = rows.len().max(1) as u64;
    for (i, cells) in rows.into_iter().enumerate() {
        let raw = layout.row(cells);
        // Spreadsheets are fully in memory; report progress proportionally
        let bytes_read = file_size * (i as u64 + 1) / total;
        if sink.push(&raw, bytes_read).is_err() {
            return;
        }
    }
    let _ = sink.finish();
}

/// Headers and data rows of the first worksheet
fn read_rows(path: &Path) -> Result<(Vec<String>, Vec<Vec<CellValue>>), String> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| format!("failed to open workbook: {}", e))?;

    let sheet_names = workbook.sheet_names().to_vec();
    let Some(sheet_name) = sheet_names.first() else {
        return Err("workbook has no sheets".to_string());
    };
    let range = workbook
        .worksheet_range(sheet_name)
        .map_err(|e| format!("failed to read worksheet '{}': {}", sheet_name, e))?;

    let mut rows = range.rows();
    let headers = rows
        .next()
        .map(|row| row.iter().map(|c| cell_value(c).as_text().trim().to_string()).collect())
        .unwrap_or_default();

    let data = rows
        .map(|row| row.iter().map(cell_value).collect::<Vec<_>>())
        .collect();

    Ok((headers, data))
}

fn cell_value(cell: &Data) -> CellValue {
    match cell {
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Float(f) => CellValue::Number(*f),
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Empty => CellValue::Text(String::new()),
        other => CellValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_cell_values() {
        assert_eq!(cell_value(&Data::Int(912345678)).as_text(), "912345678");
        assert_eq!(cell_value(&Data::Float(912345678.0)).as_text(), "912345678");
        assert_eq!(cell_value(&Data::String("Fjord AS".to_string())).as_text(), "Fjord AS");
        assert_eq!(cell_value(&Data::Empty).as_text(), "");
        assert_eq!(cell_value(&Data::Bool(true)).as_text(), "true");
    }

    #[test]
    fn test_replay_uses_headers() {
        let (tx, mut rx) = unbounded_channel();
        let sink = RowSink::new(tx, 10, 100);
        let headers = vec!["Orgnr".to_string(), "Selskap".to_string()];
        let rows = vec![
            vec![CellValue::Number(912345678.0), CellValue::from("Fjord AS")],
            vec![CellValue::from(""), CellValue::from("")],
        ];
        replay(sink, &headers, rows, 100);

        let mut batches = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkerEvent::BatchReady { rows, .. } = event {
                batches.push(rows);
            }
        }
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].orgnr.as_deref(), Some("912345678"));
        assert_eq!(batches[0][0].company_name.as_deref(), Some("Fjord AS"));
    }

    #[tokio::test]
    async fn unreadable_workbook_reports_error() {
        let path = std::env::temp_dir().join(format!("{}.xlsx", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"not a zip archive").unwrap();

        let (tx, mut rx) = unbounded_channel();
        spawn(path.clone(), tx, 10);

        let mut last = None;
        while let Some(event) = rx.recv().await {
            last = Some(event);
        }
        assert!(matches!(last, Some(WorkerEvent::Error { .. })));
        let _ = std::fs::remove_file(path);
    }
}
