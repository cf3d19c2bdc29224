// Data models shared by the readers and the pipeline

use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Column of a tabular result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Engine-reported type name, `None` for results loaded from delimited text
    pub data_type: Option<String>,
}

impl ColumnInfo {
    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: None,
        }
    }
}

/// In-memory result of a query: ordered columns and rows of JSON cells
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<Value>>,
}

impl TabularResult {
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell by row index and column name
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c.name == column)?;
        self.rows.get(row)?.get(index)
    }

    /// Write the result as comma-delimited text with a header line
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut writer = WriterBuilder::new().delimiter(b',').from_writer(writer);
        writer.write_record(self.columns.iter().map(|c| c.name.as_str()))?;

        for row in &self.rows {
            let cells: Vec<String> = row.iter().map(cell_to_string).collect();
            writer.write_record(&cells)?;
        }

        writer.flush()?;
        Ok(())
    }

    pub fn to_csv_string(&self) -> Result<String, csv::Error> {
        let mut buffer = Vec::new();
        self.write_csv(&mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            csv::Error::from(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    pub fn write_csv_file(&self, path: &Path) -> Result<(), csv::Error> {
        let file = std::fs::File::create(path)?;
        self.write_csv(std::io::BufWriter::new(file))
    }

    /// Load delimited text with a header line; every cell stays a string,
    /// empty cells become null.
    pub fn read_csv<R: Read>(reader: R) -> Result<Self, csv::Error> {
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(reader);

        let columns = reader
            .headers()?
            .iter()
            .map(|name| ColumnInfo::untyped(name.trim()))
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(
                record
                    .iter()
                    .map(|field| {
                        if field.is_empty() {
                            Value::Null
                        } else {
                            Value::String(field.to_string())
                        }
                    })
                    .collect(),
            );
        }

        Ok(Self { columns, rows })
    }

    pub fn read_csv_file(path: &Path) -> Result<Self, csv::Error> {
        let file = std::fs::File::open(path)?;
        Self::read_csv(std::io::BufReader::new(file))
    }
}

/// Render a JSON cell the way it should appear in delimited text
pub fn cell_to_string(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => cell.to_string(),
    }
}

/// A submitted batch job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub submitted_at: DateTime<Utc>,
}

/// Final state of a submitted batch job, as seen by the poller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed { marker: String },
    TimedOut { attempts: u32 },
}

/// Source of rows for an analytics ingestion
#[derive(Debug, Clone)]
pub enum IngestionSource {
    Table(TabularResult),
    LocalFile(PathBuf),
    RemoteUrl(String),
}

impl IngestionSource {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestionSource::Table(_) => "table",
            IngestionSource::LocalFile(_) => "local_file",
            IngestionSource::RemoteUrl(_) => "remote_url",
        }
    }
}

/// Acknowledgement of an ingestion request. Rows may not be queryable yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionAck {
    pub table: String,
    pub source_kind: String,
    pub operation_id: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// One failed cleanup step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub artifact: String,
    pub error: String,
}

/// Outcome of a best-effort cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one step. Failures are logged and kept, never returned.
    pub fn record<E: std::fmt::Display>(&mut self, artifact: impl Into<String>, result: Result<(), E>) {
        let artifact = artifact.into();
        match result {
            Ok(()) => self.removed.push(artifact),
            Err(e) => {
                tracing::warn!(artifact = %artifact, error = %e, "Cleanup step failed");
                crate::telemetry::record_cleanup_failure(&artifact);
                self.failures.push(CleanupFailure {
                    artifact,
                    error: e.to_string(),
                });
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> TabularResult {
        TabularResult::new(
            vec![ColumnInfo::untyped("id"), ColumnInfo::untyped("name")],
            vec![
                vec![json!(1), json!("a")],
                vec![json!(2), Value::Null],
            ],
        )
    }

    #[test]
    fn test_write_csv_includes_header() {
        let csv = sample().to_csv_string().unwrap();
        assert_eq!(csv, "id,name\n1,a\n2,\n");
    }

    #[test]
    fn test_read_csv_keeps_cells_as_strings() {
        let result = TabularResult::read_csv("id,name\n1,a\n2,\n".as_bytes()).unwrap();
        assert_eq!(result.column_names(), vec!["id", "name"]);
        assert_eq!(result.row_count(), 2);
        assert_eq!(result.get(0, "id"), Some(&json!("1")));
        assert_eq!(result.get(1, "name"), Some(&Value::Null));
    }

    #[test]
    fn test_get_unknown_column() {
        assert!(sample().get(0, "missing").is_none());
    }

    #[test]
    fn test_cleanup_report_collects_failures() {
        let mut report = CleanupReport::new();
        report.record("local.csv", Ok::<(), String>(()));
        report.record("remote.csv", Err("404"));
        assert_eq!(report.removed, vec!["local.csv"]);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.is_clean());
    }
}
