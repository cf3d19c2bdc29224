// Data movement between the readers through local temporary files
//
// Every flow stages a CSV locally, pushes it to the object store, and has the
// analytics engine ingest it from a read-only URL. Temporary artifacts are
// removed afterwards whether or not ingestion succeeded.

use crate::config::PipelineConfig;
use crate::errors::PipelineError;
use crate::files;
use crate::models::{CleanupReport, IngestionSource};
use crate::poll::{PollOutcome, PollPolicy};
use crate::readers::{AnalyticsReader, BatchEngineReader, ObjectStore, SqlSource};
use crate::telemetry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Local staging directory
    pub temp_dir: PathBuf,
    pub chunk_bytes: usize,
    /// Lifetime of the read URL handed to the analytics engine
    pub url_expiry: Duration,
    pub rows_poll: PollPolicy,
    /// Analytics folder for created tables
    pub folder: Option<String>,
    /// Delete the batch engine's remote output after staging
    pub delete_batch_remote: bool,
}

impl PipelineOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            temp_dir: config.temp_dir.clone(),
            chunk_bytes: config.chunk_bytes,
            url_expiry: Duration::from_secs(config.url_expiry_hours.max(1) as u64 * 3600),
            rows_poll: config.rows_poll_policy(),
            folder: config.folder.clone(),
            delete_batch_remote: config.delete_batch_remote,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// Outcome of a flow that loads data into the analytics engine
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub table: String,
    pub rows: PollOutcome<u64>,
    pub cleanup: CleanupReport,
}

impl PipelineReport {
    pub fn status(&self) -> &'static str {
        match self.rows {
            PollOutcome::Ready { .. } => "success",
            PollOutcome::Failed { .. } => "failed",
            PollOutcome::TimedOut { .. } => "timed_out",
        }
    }
}

/// Pipelines between the readers
pub struct Pipelines {
    analytics: Arc<AnalyticsReader>,
    store: Option<Arc<dyn ObjectStore>>,
    batch: Option<Arc<BatchEngineReader>>,
    sql: Option<Arc<dyn SqlSource>>,
    options: PipelineOptions,
}

impl Pipelines {
    pub fn new(analytics: Arc<AnalyticsReader>, options: PipelineOptions) -> Self {
        Self {
            analytics,
            store: None,
            batch: None,
            sql: None,
            options,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_batch(mut self, batch: Arc<BatchEngineReader>) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn with_sql(mut self, sql: Arc<dyn SqlSource>) -> Self {
        self.sql = Some(sql);
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    fn store(&self) -> Result<&dyn ObjectStore, PipelineError> {
        self.store
            .as_deref()
            .ok_or(PipelineError::MissingReader("object store"))
    }

    /// Run a batch script and load its output into `table`
    #[instrument(skip(self, script))]
    pub async fn batch_to_analytics(
        &self,
        script: &str,
        table: &str,
    ) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();
        let batch = self
            .batch
            .as_deref()
            .ok_or(PipelineError::MissingReader("batch engine"))?;
        let store = self.store()?;

        let local = files::unique_path(&self.options.temp_dir, "temp_batch_data", "csv");
        let mut cleanup = CleanupReport::new();

        let outcome = match batch.run_script_remote(script).await {
            Ok(output) => {
                let loaded = match batch.export_to_local_csv(&output.remote_path, &local).await {
                    Ok(()) => {
                        info!(job_id = %output.job.job_id, "Batch output exported");
                        self.load_csv(store, &local, table, &mut cleanup).await
                    }
                    Err(e) => Err(e.into()),
                };
                // The job succeeded, so its output exists whatever happened after
                if self.options.delete_batch_remote {
                    let removed = batch.delete_remote(&output.remote_path).await;
                    cleanup.record(format!("batch:{}", output.remote_path), removed);
                }
                loaded
            }
            Err(e) => Err(e.into()),
        };

        remove_local(&local, &mut cleanup);
        finish("batch_to_analytics", table, outcome, cleanup, started)
    }

    /// Run a SQL query and load its result into `table`
    #[instrument(skip(self, sql))]
    pub async fn sql_to_analytics(
        &self,
        sql: &str,
        table: &str,
    ) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();
        let source = self
            .sql
            .as_deref()
            .ok_or(PipelineError::MissingReader("SQL"))?;
        let store = self.store()?;

        let local = files::unique_path(&self.options.temp_dir, "temp_sql_data", "csv");
        let mut cleanup = CleanupReport::new();

        let outcome = match source.query(sql).await {
            Ok(data) => {
                info!(rows = data.row_count(), "SQL result loaded");
                match data.write_csv_file(&local) {
                    Ok(()) => self.load_csv(store, &local, table, &mut cleanup).await,
                    Err(e) => Err(staging_error(&local, e)),
                }
            }
            Err(e) => Err(e.into()),
        };

        remove_local(&local, &mut cleanup);
        finish("sql_to_analytics", table, outcome, cleanup, started)
    }

    /// Run an analytics query and write its primary result to `path`
    #[instrument(skip(self, query), fields(path = %path.display()))]
    pub async fn analytics_to_csv(&self, query: &str, path: &Path) -> Result<u64, PipelineError> {
        let started = Instant::now();

        let outcome = match self.analytics.execute(query).await {
            Ok(Some(result)) => result
                .write_csv_file(path)
                .map(|()| result.row_count() as u64)
                .map_err(|e| staging_error(path, e)),
            Ok(None) => Err(PipelineError::NoResult),
            Err(e) => Err(e.into()),
        };

        let elapsed = started.elapsed().as_secs_f64();
        match &outcome {
            Ok(rows) => {
                telemetry::record_pipeline_run("analytics_to_csv", "success", elapsed);
                info!(rows = rows, elapsed_seconds = elapsed, "Query result saved");
            }
            Err(e) => {
                telemetry::record_pipeline_run("analytics_to_csv", "error", elapsed);
                error!(error = %e, "Export to CSV failed");
            }
        }
        outcome
    }

    /// Upload a local CSV, create the table from its header, ingest, and
    /// wait for rows. The uploaded object is always deleted.
    async fn load_csv(
        &self,
        store: &dyn ObjectStore,
        local: &Path,
        table: &str,
        cleanup: &mut CleanupReport,
    ) -> Result<PollOutcome<u64>, PipelineError> {
        let columns = files::read_header(local).map_err(|e| staging_error(local, e))?;
        let remote = files::unique_name(table, "csv");

        store
            .upload_chunked(local, &remote, self.options.chunk_bytes)
            .await?;
        info!(remote = %remote, backend = store.backend(), "Staged CSV uploaded");

        let outcome = self.ingest_remote(store, &remote, table, &columns).await;

        let removed = store.delete_one(&remote).await;
        cleanup.record(format!("remote:{}", remote), removed);
        outcome
    }

    async fn ingest_remote(
        &self,
        store: &dyn ObjectStore,
        remote: &str,
        table: &str,
        columns: &[String],
    ) -> Result<PollOutcome<u64>, PipelineError> {
        let url = store.mint_read_url(remote, self.options.url_expiry).await?;

        self.analytics
            .create_table_from_schema(table, columns, self.options.folder.as_deref())
            .await?;
        let ack = self
            .analytics
            .ingest(table, IngestionSource::RemoteUrl(url))
            .await?;
        info!(operation_id = ?ack.operation_id, "Waiting for ingested rows");

        Ok(self.analytics.wait_for_rows(table, self.options.rows_poll).await)
    }
}

fn staging_error(path: &Path, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Staging {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

/// Remove a staged file if the flow got far enough to create it
fn remove_local(path: &Path, cleanup: &mut CleanupReport) {
    if path.exists() {
        cleanup.record(format!("local:{}", path.display()), files::remove_file(path));
    }
}

fn finish(
    flow: &str,
    table: &str,
    outcome: Result<PollOutcome<u64>, PipelineError>,
    cleanup: CleanupReport,
    started: Instant,
) -> Result<PipelineReport, PipelineError> {
    let elapsed = started.elapsed().as_secs_f64();

    if cleanup.is_clean() {
        info!(removed = cleanup.removed.len(), "Cleanup finished");
    } else {
        warn!(
            removed = cleanup.removed.len(),
            failures = ?cleanup.failures,
            "Cleanup finished with failures"
        );
    }

    match outcome {
        Ok(rows) => {
            let report = PipelineReport {
                table: table.to_string(),
                rows,
                cleanup,
            };
            telemetry::record_pipeline_run(flow, report.status(), elapsed);
            info!(
                status = report.status(),
                attempts = report.rows.attempts(),
                elapsed_seconds = elapsed,
                "Pipeline finished"
            );
            Ok(report)
        }
        Err(e) => {
            telemetry::record_pipeline_run(flow, "error", elapsed);
            error!(error = %e, elapsed_seconds = elapsed, "Pipeline failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{BatchError, SqlError};
    use crate::models::TabularResult;
    use crate::readers::analytics::{AnalyticsOptions, StaticToken};
    use crate::readers::object_store::testing::MemoryStore;
    use crate::readers::sql::MockSqlSource;
    use serde_json::{json, Value};
    use wiremock::matchers::{body_string_contains, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn table(columns: &[&str], rows: Value) -> Value {
        let columns: Vec<Value> = columns.iter().map(|c| json!({"ColumnName": c})).collect();
        json!({"Tables": [{"TableName": "Table_0", "Columns": columns, "Rows": rows}]})
    }

    fn analytics(server: &MockServer) -> Arc<AnalyticsReader> {
        let options = AnalyticsOptions {
            cluster: server.uri(),
            database: "Samples".to_string(),
            request_timeout: Duration::from_secs(30),
            defer_partial_failures: true,
        };
        Arc::new(AnalyticsReader::new(options, Arc::new(StaticToken::new("t"))).unwrap())
    }

    fn options(temp_dir: &Path) -> PipelineOptions {
        PipelineOptions {
            temp_dir: temp_dir.to_path_buf(),
            chunk_bytes: 8,
            url_expiry: Duration::from_secs(3600),
            rows_poll: PollPolicy::new(3, Duration::from_millis(5)),
            folder: Some("staging".to_string()),
            delete_batch_remote: true,
        }
    }

    fn sql_rows() -> TabularResult {
        TabularResult::read_csv("id,name,value\n1,a,10\n2,b,20\n3,c,30\n".as_bytes()).unwrap()
    }

    fn sql_source(result: Result<TabularResult, SqlError>) -> Arc<dyn SqlSource> {
        let mut source = MockSqlSource::new();
        let mut result = Some(result);
        source
            .expect_query()
            .times(1)
            .returning(move |_| result.take().unwrap_or_else(|| Ok(TabularResult::default())));
        Arc::new(source)
    }

    async fn mount_table_and_ingest(server: &MockServer, ingest_status: u16) {
        Mock::given(path("/v1/rest/mgmt"))
            .and(body_string_contains(
                ".create table ['T1'] (['id']:string, ['name']:string, ['value']:string) with (folder='staging')",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(table(&["TableName"], json!([["T1"]]))))
            .expect(1)
            .mount(server)
            .await;

        let ingest = if ingest_status == 200 {
            ResponseTemplate::new(200).set_body_json(table(&["OperationId"], json!([["op-1"]])))
        } else {
            ResponseTemplate::new(ingest_status)
                .set_body_json(json!({"error": {"message": "Ingestion source is not accessible"}}))
        };
        Mock::given(path("/v1/rest/mgmt"))
            .and(body_string_contains(".ingest async into table ['T1'] (h'memory://T1_"))
            .respond_with(ingest)
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_sql_to_analytics_loads_rows_and_cleans_up() {
        let server = MockServer::start().await;
        mount_table_and_ingest(&server, 200).await;
        Mock::given(path("/v1/rest/query"))
            .and(body_string_contains("['T1'] | count"))
            .respond_with(ResponseTemplate::new(200).set_body_json(table(&["Count"], json!([[3]]))))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let pipelines = Pipelines::new(analytics(&server), options(dir.path()))
            .with_store(store.clone())
            .with_sql(sql_source(Ok(sql_rows())));

        let report = pipelines.sql_to_analytics("SELECT * FROM t", "T1").await.unwrap();

        assert_eq!(report.rows, PollOutcome::Ready { value: 3, attempts: 1 });
        assert_eq!(report.status(), "success");
        assert!(report.cleanup.is_clean());
        assert_eq!(report.cleanup.removed.len(), 2);
        assert!(store.names().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_ingestion_still_cleans_up() {
        let server = MockServer::start().await;
        mount_table_and_ingest(&server, 400).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let pipelines = Pipelines::new(analytics(&server), options(dir.path()))
            .with_store(store.clone())
            .with_sql(sql_source(Ok(sql_rows())));

        let err = pipelines
            .sql_to_analytics("SELECT * FROM t", "T1")
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Analytics(_)));
        assert!(store.names().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_rows_timeout_is_reported_not_raised() {
        let server = MockServer::start().await;
        mount_table_and_ingest(&server, 200).await;
        Mock::given(path("/v1/rest/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(table(&["Count"], json!([[0]]))))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let pipelines = Pipelines::new(analytics(&server), options(dir.path()))
            .with_store(store.clone())
            .with_sql(sql_source(Ok(sql_rows())));

        let report = pipelines.sql_to_analytics("SELECT 1", "T1").await.unwrap();
        assert_eq!(report.rows, PollOutcome::TimedOut { attempts: 3 });
        assert_eq!(report.status(), "timed_out");
        assert!(store.names().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_failures_are_collected() {
        let server = MockServer::start().await;
        mount_table_and_ingest(&server, 200).await;
        Mock::given(path("/v1/rest/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(table(&["Count"], json!([[3]]))))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let pipelines = Pipelines::new(analytics(&server), options(dir.path()))
            .with_store(Arc::new(MemoryStore::failing_deletes()))
            .with_sql(sql_source(Ok(sql_rows())));

        let report = pipelines.sql_to_analytics("SELECT 1", "T1").await.unwrap();

        assert!(report.rows.is_ready());
        assert_eq!(report.cleanup.failures.len(), 1);
        assert!(report.cleanup.failures[0].artifact.starts_with("remote:T1_"));
        // The local file is still removed
        assert_eq!(report.cleanup.removed.len(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sql_failure_creates_nothing() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let pipelines = Pipelines::new(analytics(&server), options(dir.path()))
            .with_store(store.clone())
            .with_sql(sql_source(Err(SqlError::QueryFailed("syntax error".to_string()))));

        let err = pipelines.sql_to_analytics("SELEC 1", "T1").await.unwrap_err();

        assert!(matches!(err, PipelineError::Sql(_)));
        assert!(store.names().is_empty());
        assert!(server.received_requests().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_missing_readers() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let pipelines = Pipelines::new(analytics(&server), options(dir.path()));

        assert!(matches!(
            pipelines.batch_to_analytics("x", "T1").await,
            Err(PipelineError::MissingReader("batch engine"))
        ));
        assert!(matches!(
            pipelines.sql_to_analytics("x", "T1").await,
            Err(PipelineError::MissingReader("SQL"))
        ));
    }

    #[tokio::test]
    async fn test_analytics_to_csv() {
        let server = MockServer::start().await;
        Mock::given(path("/v1/rest/query"))
            .and(body_string_contains("StormEvents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(table(
                &["State", "Count"],
                json!([["TEXAS", 4701], ["KANSAS", 3166]]),
            )))
            .mount(&server)
            .await;
        Mock::given(path("/v1/rest/query"))
            .and(body_string_contains("Missing"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": {"message": "Failed to resolve table"}})))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let pipelines = Pipelines::new(analytics(&server), options(dir.path()));
        let output = dir.path().join("storm.csv");

        let rows = pipelines
            .analytics_to_csv("StormEvents | summarize count() by State", &output)
            .await
            .unwrap();
        assert_eq!(rows, 2);
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "State,Count\nTEXAS,4701\nKANSAS,3166\n"
        );

        let err = pipelines
            .analytics_to_csv("Missing | take 1", &dir.path().join("none.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoResult));
    }

    /// Shell stand-in for the batch executable; `delete` records its target
    #[cfg(unix)]
    fn fake_batch(dir: &Path, export: &str) -> BatchEngineReader {
        use crate::readers::batch::BatchOptions;
        use std::os::unix::fs::PermissionsExt;

        let exe = dir.join("scope.sh");
        std::fs::write(
            &exe,
            format!(
                r#"#!/bin/sh
case "$1" in
  submit) echo "Job ID: 0d1f2b7e-8a3c-4e55-9f21-6c7d8e9fa0b1" ;;
  jobstatus) echo "State: CompletedSuccess" ;;
  export) {} ;;
  delete) echo "$2" >> "{}" ;;
esac
"#,
                export,
                dir.join("deleted").display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let work_dir = dir.join("work");
        std::fs::create_dir_all(&work_dir).unwrap();
        BatchEngineReader::new(BatchOptions {
            exe_path: exe.display().to_string(),
            vc_path: "https://cosmos.example/vc".to_string(),
            account: "alias@example.com".to_string(),
            work_dir,
            remote_temp_dir: "/users/alias".to_string(),
            poll: PollPolicy::new(2, Duration::from_millis(5)),
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_batch_to_analytics_deletes_batch_output() {
        let dir = tempfile::tempdir().unwrap();
        let deleted = dir.path().join("deleted");
        let batch = fake_batch(
            dir.path(),
            r#"printf '#Field: id,name,value\n1,a,10\n2,b,20\n3,c,30\n' > "$3""#,
        );

        let work_dir = dir.path().join("work");
        let temp_dir = dir.path().join("staging");
        std::fs::create_dir_all(&temp_dir).unwrap();

        let server = MockServer::start().await;
        mount_table_and_ingest(&server, 200).await;
        Mock::given(path("/v1/rest/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(table(&["Count"], json!([[3]]))))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::default());
        let pipelines = Pipelines::new(analytics(&server), options(&temp_dir))
            .with_store(store.clone())
            .with_batch(Arc::new(batch));

        let report = pipelines
            .batch_to_analytics("OUTPUT (SELECT 1) TO @output;", "T1")
            .await
            .unwrap();

        assert!(report.rows.is_ready());
        assert!(report.cleanup.is_clean());
        assert_eq!(report.cleanup.removed.len(), 3);
        assert!(report
            .cleanup
            .removed
            .iter()
            .any(|a| a.starts_with("batch:/users/alias/query_temp_")));
        assert!(std::fs::read_to_string(&deleted)
            .unwrap()
            .starts_with("https://cosmos.example/vc/users/alias/query_temp_"));
        assert!(store.names().is_empty());
        assert_eq!(std::fs::read_dir(&temp_dir).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(&work_dir).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_batch_export_still_deletes_batch_output() {
        let dir = tempfile::tempdir().unwrap();
        let batch = fake_batch(dir.path(), "echo 'export failed' >&2; exit 1");
        let temp_dir = dir.path().join("staging");
        std::fs::create_dir_all(&temp_dir).unwrap();

        let server = MockServer::start().await;
        let store = Arc::new(MemoryStore::default());
        let pipelines = Pipelines::new(analytics(&server), options(&temp_dir))
            .with_store(store.clone())
            .with_batch(Arc::new(batch));

        let err = pipelines
            .batch_to_analytics("OUTPUT (SELECT 1) TO @output;", "T1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Batch(BatchError::ExternalTool { .. })
        ));

        let deleted = std::fs::read_to_string(dir.path().join("deleted")).unwrap();
        assert_eq!(deleted.lines().count(), 1);
        assert!(deleted.starts_with("https://cosmos.example/vc/users/alias/query_temp_"));
        assert!(store.names().is_empty());
        assert!(server.received_requests().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(&temp_dir).unwrap().count(), 0);
    }
}
