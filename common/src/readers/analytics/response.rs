// REST v1 response parsing
//
// A v1 response is a list of tables. With more than one table the last is a
// table of contents whose rows name each table's kind; only `QueryResult`
// tables are primary results. A `QueryStatus` table with error rows, or a
// row that carries exceptions instead of cells, marks a partial failure.

use crate::errors::AnalyticsError;
use crate::models::{ColumnInfo, TabularResult};
use serde::Deserialize;
use serde_json::Value;

const PRIMARY_KIND: &str = "QueryResult";
const STATUS_KIND: &str = "QueryStatus";

#[derive(Debug, Deserialize)]
struct V1Response {
    #[serde(rename = "Tables")]
    tables: Vec<V1Table>,
}

#[derive(Debug, Deserialize)]
struct V1Table {
    #[serde(rename = "TableName", default)]
    name: String,
    #[serde(rename = "Columns")]
    columns: Vec<V1Column>,
    #[serde(rename = "Rows")]
    rows: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct V1Column {
    #[serde(rename = "ColumnName")]
    name: String,
    #[serde(rename = "DataType", default)]
    data_type: Option<String>,
    #[serde(rename = "ColumnType", default)]
    column_type: Option<String>,
}

/// Parsed response: primary results plus any service-reported errors
#[derive(Debug, Default)]
pub struct ParsedResponse {
    pub primary: Vec<TabularResult>,
    pub errors: Vec<String>,
}

impl V1Table {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn into_result(self, errors: &mut Vec<String>) -> TabularResult {
        let columns = self
            .columns
            .into_iter()
            .map(|c| ColumnInfo {
                name: c.name,
                data_type: c.column_type.or(c.data_type),
            })
            .collect();

        let mut rows = Vec::with_capacity(self.rows.len());
        for row in self.rows {
            match row {
                Value::Array(cells) => rows.push(cells),
                other => errors.push(exception_text(&other)),
            }
        }

        TabularResult::new(columns, rows)
    }
}

fn exception_text(row: &Value) -> String {
    match row.get("Exceptions") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
            .collect::<Vec<_>>()
            .join("; "),
        _ => row.to_string(),
    }
}

fn cell_str<'a>(row: &'a Value, index: usize) -> Option<&'a str> {
    row.get(index)?.as_str()
}

/// Error rows of a `QueryStatus` table
fn status_errors(table: &V1Table) -> Vec<String> {
    let (Some(severity), Some(description)) = (
        table.column_index("SeverityName"),
        table.column_index("StatusDescription"),
    ) else {
        return Vec::new();
    };

    table
        .rows
        .iter()
        .filter(|row| cell_str(row, severity) == Some("Error"))
        .map(|row| cell_str(row, description).unwrap_or("unknown error").to_string())
        .collect()
}

pub fn parse_v1(body: &[u8]) -> Result<ParsedResponse, AnalyticsError> {
    let response: V1Response = serde_json::from_slice(body)?;
    let mut tables = response.tables;
    let mut parsed = ParsedResponse::default();

    if tables.len() <= 1 {
        if let Some(table) = tables.pop() {
            let result = table.into_result(&mut parsed.errors);
            parsed.primary.push(result);
        }
        return Ok(parsed);
    }

    let toc = tables
        .pop()
        .ok_or_else(|| AnalyticsError::InvalidResponse("missing table of contents".to_string()))?;
    let (Some(ordinal_col), Some(kind_col)) = (toc.column_index("Ordinal"), toc.column_index("Kind"))
    else {
        return Err(AnalyticsError::InvalidResponse(format!(
            "last table '{}' is not a table of contents",
            toc.name
        )));
    };

    let mut entries = Vec::new();
    for row in &toc.rows {
        let ordinal = row
            .get(ordinal_col)
            .and_then(Value::as_u64)
            .ok_or_else(|| AnalyticsError::InvalidResponse("bad TOC ordinal".to_string()))?;
        let kind = cell_str(row, kind_col).unwrap_or_default().to_string();
        entries.push((ordinal as usize, kind));
    }

    let mut slots: Vec<Option<V1Table>> = tables.into_iter().map(Some).collect();
    for (ordinal, kind) in entries {
        let Some(table) = slots.get_mut(ordinal).and_then(Option::take) else {
            return Err(AnalyticsError::InvalidResponse(format!(
                "TOC references missing table {}",
                ordinal
            )));
        };

        match kind.as_str() {
            PRIMARY_KIND => {
                let result = table.into_result(&mut parsed.errors);
                parsed.primary.push(result);
            }
            STATUS_KIND => parsed.errors.extend(status_errors(&table)),
            _ => {}
        }
    }

    Ok(parsed)
}

/// Message from a non-success response body
pub fn error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| e.get("@message").or_else(|| e.get("message")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string())
}
