// SQL engine reader over ODBC
// The driver API is blocking; every call runs on the blocking thread pool.

use crate::config::SqlConfig;
use crate::errors::{SecretsError, SqlError};
use crate::models::{ColumnInfo, TabularResult};
use crate::secrets::{ConfigStore, DREMIO_TOKEN, DREMIO_USER};
use async_trait::async_trait;
use odbc_api::buffers::TextRowSet;
use odbc_api::{ConnectionOptions, Cursor, Environment, ResultSetMetadata};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

const BATCH_ROWS: usize = 256;
/// Per-cell text buffer; longer values fail the query instead of being cut
const MAX_TEXT_BYTES: usize = 32 * 1024;

/// Anything that answers a SQL query with a tabular result
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SqlSource: Send + Sync {
    async fn query(&self, sql: &str) -> Result<TabularResult, SqlError>;
}

/// Connection parameters for the SQL engine
#[derive(Clone)]
pub struct SqlConnectionOptions {
    pub user: String,
    pub token: String,
    pub host: String,
    pub port: u16,
    pub driver: String,
}

impl std::fmt::Debug for SqlConnectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlConnectionOptions")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

impl SqlConnectionOptions {
    /// Host, port and driver from settings; user and token from the
    /// explicit values, then the secrets store.
    pub fn resolve(
        config: &SqlConfig,
        store: &ConfigStore,
        user: Option<&str>,
        token: Option<&str>,
    ) -> Result<Self, SecretsError> {
        let user = store.resolve(user.or(config.user.as_deref()), DREMIO_USER)?;
        let token = store.resolve(token, DREMIO_TOKEN)?;

        Ok(Self {
            user,
            token,
            host: config.host.clone(),
            port: config.port,
            driver: config.driver.clone(),
        })
    }

    pub fn connection_string(&self) -> String {
        format!(
            "Driver={{{}}};ConnectionType=Direct;HOST={};PORT={};AuthenticationType=Plain;UID={};PWD={};ssl=1",
            self.driver, self.host, self.port, self.user, self.token
        )
    }
}

/// Reader for the SQL engine
pub struct SqlReader {
    environment: Arc<Environment>,
    connection_string: String,
    host: String,
}

impl SqlReader {
    /// Create the ODBC environment and open one test connection
    #[instrument(skip(options), fields(host = %options.host, port = options.port))]
    pub async fn connect(options: SqlConnectionOptions) -> Result<Self, SqlError> {
        let connection_string = options.connection_string();
        let test_connection = connection_string.clone();

        let environment = tokio::task::spawn_blocking(move || {
            let environment =
                Environment::new().map_err(|e| SqlError::Connection(e.to_string()))?;
            environment
                .connect_with_connection_string(&test_connection, ConnectionOptions::default())
                .map_err(|e| SqlError::Connection(e.to_string()))?;
            Ok::<_, SqlError>(environment)
        })
        .await
        .map_err(|e| SqlError::TaskFailed(e.to_string()))??;

        info!("SQL engine connection is ready");
        Ok(Self {
            environment: Arc::new(environment),
            connection_string,
            host: options.host,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl SqlSource for SqlReader {
    #[instrument(skip(self, sql), fields(host = %self.host))]
    async fn query(&self, sql: &str) -> Result<TabularResult, SqlError> {
        let started = Instant::now();
        let environment = Arc::clone(&self.environment);
        let connection_string = self.connection_string.clone();
        let sql = sql.to_string();

        let result = tokio::task::spawn_blocking(move || {
            run_query(&environment, &connection_string, &sql)
        })
        .await
        .map_err(|e| SqlError::TaskFailed(e.to_string()))??;

        info!(
            rows = result.row_count(),
            elapsed_seconds = started.elapsed().as_secs_f64(),
            "SQL query finished"
        );
        Ok(result)
    }
}

fn query_error(e: odbc_api::Error) -> SqlError {
    SqlError::QueryFailed(e.to_string())
}

fn fetch_error(e: odbc_api::Error, columns: &[ColumnInfo]) -> SqlError {
    match e {
        odbc_api::Error::TooLargeValueForBuffer {
            indicator,
            buffer_index,
        } => {
            let column = columns
                .get(buffer_index)
                .map(|c| c.name.as_str())
                .unwrap_or("?");
            let size = indicator.map_or_else(|| "unknown".to_string(), |n| n.to_string());
            SqlError::QueryFailed(format!(
                "value in column '{}' is {} bytes, larger than the {} byte read buffer",
                column, size, MAX_TEXT_BYTES
            ))
        }
        other => query_error(other),
    }
}

fn run_query(
    environment: &Environment,
    connection_string: &str,
    sql: &str,
) -> Result<TabularResult, SqlError> {
    let connection = environment
        .connect_with_connection_string(connection_string, ConnectionOptions::default())
        .map_err(|e| SqlError::Connection(e.to_string()))?;

    let Some(mut cursor) = connection.execute(sql, ()).map_err(query_error)? else {
        debug!("Statement produced no result set");
        return Ok(TabularResult::default());
    };

    let names: Vec<String> = cursor
        .column_names()
        .map_err(query_error)?
        .collect::<Result<_, _>>()
        .map_err(query_error)?;

    let mut columns = Vec::with_capacity(names.len());
    for (index, name) in names.into_iter().enumerate() {
        let data_type = cursor
            .col_data_type(index as u16 + 1)
            .map(|t| format!("{:?}", t))
            .ok();
        columns.push(ColumnInfo { name, data_type });
    }

    let buffers = TextRowSet::for_cursor(BATCH_ROWS, &mut cursor, Some(MAX_TEXT_BYTES))
        .map_err(query_error)?;
    let mut row_set_cursor = cursor.bind_buffer(buffers).map_err(query_error)?;

    let mut rows = Vec::new();
    while let Some(batch) = row_set_cursor
        .fetch_with_truncation_check(true)
        .map_err(|e| fetch_error(e, &columns))?
    {
        for row in 0..batch.num_rows() {
            let cells = (0..batch.num_cols())
                .map(|col| match batch.at(col, row) {
                    Some(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
                    None => Value::Null,
                })
                .collect();
            rows.push(cells);
        }
    }

    Ok(TabularResult::new(columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SqlConnectionOptions {
        SqlConnectionOptions {
            user: "alias@example.com".to_string(),
            token: "pat-123".to_string(),
            host: "dremio-mcds.trafficmanager.net".to_string(),
            port: 31010,
            driver: "Dremio Connector".to_string(),
        }
    }

    #[test]
    fn test_connection_string() {
        assert_eq!(
            options().connection_string(),
            "Driver={Dremio Connector};ConnectionType=Direct;HOST=dremio-mcds.trafficmanager.net;PORT=31010;AuthenticationType=Plain;UID=alias@example.com;PWD=pat-123;ssl=1"
        );
    }

    #[test]
    fn test_debug_hides_token() {
        let text = format!("{:?}", options());
        assert!(!text.contains("pat-123"));
        assert!(text.contains("dremio-mcds"));
    }

    #[test]
    fn test_resolve_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::open(dir.path().join("config.json")).unwrap();
        store.set(DREMIO_USER, "stored-user");
        store.set(DREMIO_TOKEN, "stored-token");

        let config = SqlConfig::default();
        let resolved = SqlConnectionOptions::resolve(&config, &store, None, None).unwrap();
        assert_eq!(resolved.user, "stored-user");
        assert_eq!(resolved.token, "stored-token");
        assert_eq!(resolved.port, 31010);

        let resolved =
            SqlConnectionOptions::resolve(&config, &store, Some("me"), Some("tok")).unwrap();
        assert_eq!(resolved.user, "me");
        assert_eq!(resolved.token, "tok");
    }

    #[test]
    fn test_resolve_missing_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("config.json")).unwrap();

        let err = SqlConnectionOptions::resolve(&SqlConfig::default(), &store, Some("me"), None)
            .unwrap_err();
        assert!(matches!(err, SecretsError::MissingKey(key) if key == DREMIO_TOKEN));
    }

    #[test]
    fn test_truncated_value_fails_the_query() {
        let columns = vec![ColumnInfo::untyped("id"), ColumnInfo::untyped("payload")];
        let err = fetch_error(
            odbc_api::Error::TooLargeValueForBuffer {
                indicator: Some(40_000),
                buffer_index: 1,
            },
            &columns,
        );

        match err {
            SqlError::QueryFailed(message) => {
                assert!(message.contains("'payload'"));
                assert!(message.contains("40000 bytes"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_mock_source() {
        let mut source = MockSqlSource::new();
        source
            .expect_query()
            .returning(|_| Ok(TabularResult::default()));

        let result = source.query("SELECT 1").await.unwrap();
        assert!(result.is_empty());
    }
}
