// Command text for the analytics engine
// Pure builders; names and literals are quoted here and nowhere else.

use crate::errors::AnalyticsError;
use crate::poll::Check;

/// Operation states that end an async operation without success
pub const FAILED_OPERATION_STATES: [&str; 6] = [
    "Failed",
    "Abandoned",
    "BadInput",
    "Canceled",
    "Cancelled",
    "Throttled",
];

/// Destination of an async export: a blob container plus its credential
#[derive(Debug, Clone)]
pub struct ExportTarget {
    connection: String,
    pub name_prefix: String,
}

impl ExportTarget {
    /// `<container-url>;<account-key>`
    pub fn with_account_key(container_url: &str, account_key: &str, name_prefix: &str) -> Self {
        Self {
            connection: format!("{};{}", container_url.trim_end_matches('/'), account_key),
            name_prefix: name_prefix.to_string(),
        }
    }

    /// `<container-url>?<sas>`
    pub fn with_sas(container_url: &str, sas: &str, name_prefix: &str) -> Self {
        Self {
            connection: format!(
                "{}?{}",
                container_url.trim_end_matches('/'),
                sas.trim_start_matches('?')
            ),
            name_prefix: name_prefix.to_string(),
        }
    }
}

/// Bracket-quote an entity name: `['name']`
pub fn quote_name(name: &str) -> Result<String, AnalyticsError> {
    if name.trim().is_empty()
        || name.contains('\'')
        || name.contains(']')
        || name.contains('\n')
    {
        return Err(AnalyticsError::InvalidName(name.to_string()));
    }
    Ok(format!("['{}']", name))
}

/// Single-quoted string literal with backslash escapes
pub fn string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Management commands start with a dot and go to the mgmt endpoint
pub fn is_management(csl: &str) -> bool {
    csl.trim_start().starts_with('.')
}

pub fn create_table(name: &str, columns: &[String], folder: Option<&str>) -> Result<String, AnalyticsError> {
    let columns = columns
        .iter()
        .map(|c| Ok(format!("{}:string", quote_name(c)?)))
        .collect::<Result<Vec<_>, AnalyticsError>>()?;

    let mut command = format!(".create table {} ({})", quote_name(name)?, columns.join(", "));
    if let Some(folder) = folder {
        command.push_str(&format!(" with (folder={})", string_literal(folder)));
    }
    Ok(command)
}

pub fn drop_table(name: &str) -> Result<String, AnalyticsError> {
    Ok(format!(".drop table {} ifexists", quote_name(name)?))
}

pub fn show_table(name: &str) -> Result<String, AnalyticsError> {
    quote_name(name)?;
    Ok(format!(
        ".show tables | where TableName == {}",
        string_literal(name)
    ))
}

pub fn row_count(name: &str) -> Result<String, AnalyticsError> {
    Ok(format!("{} | count", quote_name(name)?))
}

const CSV_PROPERTIES: &str = "format='csv', ignoreFirstRecord=true";

/// Queue ingestion of a CSV blob; returns an operation id
pub fn ingest_from_url(name: &str, url: &str) -> Result<String, AnalyticsError> {
    Ok(format!(
        ".ingest async into table {} (h{}) with ({})",
        quote_name(name)?,
        string_literal(url),
        CSV_PROPERTIES
    ))
}

/// Ingest CSV text carried in the command itself
pub fn ingest_inline(name: &str, csv: &str) -> Result<String, AnalyticsError> {
    Ok(format!(
        ".ingest inline into table {} with ({}) <|\n{}",
        quote_name(name)?,
        CSV_PROPERTIES,
        csv.trim_end()
    ))
}

pub fn export_async(script: &str, target: &ExportTarget) -> String {
    format!(
        ".export async to csv (h@\"{}\") with (namePrefix={}, includeHeaders=\"firstFile\") <| {}",
        target.connection.replace('"', "\"\""),
        string_literal(&target.name_prefix),
        script.trim()
    )
}

pub fn show_operation(operation_id: &str) -> String {
    format!(".show operations {}", operation_id.trim())
}

/// Map an operation `State` to a poll check
pub fn classify_operation_state(state: &str) -> Check<String> {
    match state {
        "Completed" => Check::Ready(state.to_string()),
        "PartiallySucceeded" => {
            tracing::warn!("Operation partially succeeded");
            Check::Ready(state.to_string())
        }
        s if FAILED_OPERATION_STATES.contains(&s) => Check::Failed(s.to_string()),
        _ => Check::Pending,
    }
}
