// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::Write;
use std::path::Path;

use chrono::Local;
use tracing::info;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::Value;
use crate::federation::types::FederatedResult;

fn csv_error(e: ::csv::Error) -> EngineError {
    EngineError::io(format!("CSV write failed: {e}"))
}

/// Writes a header row and one record per result row. NULL cells are written
/// as the `NULL` sentinel.
pub fn write_csv<W: Write>(result: &FederatedResult, writer: W) -> EngineResult<()> {
    let mut out = ::csv::Writer::from_writer(writer);
    out.write_record(&result.columns).map_err(csv_error)?;
    for row in &result.rows {
        out.write_record(row.iter().map(Value::to_string))
            .map_err(csv_error)?;
    }
    out.flush()
        .map_err(|e| EngineError::io(format!("CSV flush failed: {e}")))
}

/// Writes `result` to a new file at `path`
pub fn export_to_file(result: &FederatedResult, path: &Path) -> EngineResult<()> {
    let file = File::create(path)
        .map_err(|e| EngineError::io(format!("Failed to create {}: {e}", path.display())))?;
    write_csv(result, file)?;
    info!(path = %path.display(), rows = result.rows.len(), "result exported");
    Ok(())
}

/// `vfdw_export_<timestamp>.csv`
pub fn default_file_name() -> String {
    format!("vfdw_export_{}.csv", Local::now().format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> FederatedResult {
        FederatedResult {
            columns: vec!["u.name".into(), "o.product".into()],
            rows: vec![
                vec![Value::from("Alice"), Value::from("Book, hardcover")],
                vec![Value::from("Carol"), Value::Null],
            ],
            elapsed_secs: 0.01,
        }
    }

    #[test]
    fn writes_header_quotes_and_null_sentinel() {
        let mut buffer = Vec::new();
        write_csv(&result(), &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert_eq!(
            text,
            "u.name,o.product\nAlice,\"Book, hardcover\"\nCarol,NULL\n"
        );
    }

    #[test]
    fn exports_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(default_file_name());
        export_to_file(&result(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("u.name,o.product\n"));
        assert!(path.to_string_lossy().ends_with(".csv"));
    }
}
