// Runner binary entry point
// Loads settings and secrets, builds the readers the configured job needs,
// and runs that one job to completion.

use anyhow::{anyhow, Context, Result};
use common::config::{AnalyticsAuth, JobConfig, JobKind, ObjectStoreBackend, Settings};
use common::pipeline::{PipelineOptions, Pipelines};
use common::poll::PollOutcome;
use common::readers::analytics::{AzCliToken, StaticToken, TokenProvider};
use common::readers::object_store::{AzureBlobStore, S3Store};
use common::readers::{
    AnalyticsOptions, AnalyticsReader, BatchEngineReader, BatchOptions, ObjectStore,
    SqlConnectionOptions, SqlReader,
};
use common::secrets::{ConfigStore, AZURE_BLOB_CONNSTR, S3_ACCESS_KEY, S3_SECRET_KEY};
use common::telemetry;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().map_err(|e| anyhow!("Configuration error: {}", e))?;

    telemetry::init(&settings.observability)?;
    info!("Starting azdsdr runner");

    settings.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        anyhow!("Invalid configuration: {}", e)
    })?;

    let job = settings
        .job
        .clone()
        .ok_or_else(|| anyhow!("No job configured; add a [job] section to config/local.toml"))?;

    let store = match &settings.secrets.path {
        Some(path) => ConfigStore::open(path)?,
        None => ConfigStore::open_default()?,
    };
    info!(path = %store.path().display(), "Secrets store opened");

    let query = std::fs::read_to_string(&job.query_file)
        .with_context(|| format!("Failed to read query file {}", job.query_file.display()))?;

    let pipelines = build_pipelines(&settings, &store, &job.kind).await?;

    let outcome = tokio::select! {
        result = run_job(&pipelines, &job, &query) => result,
        signal = signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            warn!("Interrupted, abandoning the running job");
            Err(anyhow!("Interrupted"))
        }
    };

    if let Err(e) = &outcome {
        error!(error = %e, "Job failed");
    }
    telemetry::shutdown_tracer();
    outcome
}

async fn build_pipelines(
    settings: &Settings,
    store: &ConfigStore,
    kind: &JobKind,
) -> Result<Pipelines> {
    let token: Arc<dyn TokenProvider> = match settings.analytics.auth {
        AnalyticsAuth::AzCli => Arc::new(AzCliToken::new(settings.analytics.cluster.clone())),
        AnalyticsAuth::Token => Arc::new(StaticToken::from_store(store, None)?),
    };
    let analytics = AnalyticsReader::new(AnalyticsOptions::from_config(&settings.analytics), token)?;
    info!(cluster = %settings.analytics.cluster, "Analytics reader initialized");

    let mut pipelines = Pipelines::new(
        Arc::new(analytics),
        PipelineOptions::from_config(&settings.pipeline),
    );

    if matches!(kind, JobKind::AnalyticsToCsv) {
        return Ok(pipelines);
    }

    pipelines = pipelines.with_store(build_object_store(settings, store)?);

    match kind {
        JobKind::BatchToAnalytics => {
            let batch = BatchEngineReader::new(BatchOptions::from_config(&settings.batch));
            info!(vc = %settings.batch.vc_path, "Batch engine reader initialized");
            pipelines = pipelines.with_batch(Arc::new(batch));
        }
        JobKind::SqlToAnalytics => {
            let options = SqlConnectionOptions::resolve(&settings.sql, store, None, None)?;
            let sql = SqlReader::connect(options).await?;
            pipelines = pipelines.with_sql(Arc::new(sql));
        }
        JobKind::AnalyticsToCsv => {}
    }

    Ok(pipelines)
}

fn build_object_store(settings: &Settings, store: &ConfigStore) -> Result<Arc<dyn ObjectStore>> {
    let config = &settings.object_store;
    let object_store: Arc<dyn ObjectStore> = match config.backend {
        ObjectStoreBackend::Azure => Arc::new(AzureBlobStore::from_connection_string(
            &store.require(AZURE_BLOB_CONNSTR)?,
            config.container.clone(),
        )?),
        ObjectStoreBackend::S3 => Arc::new(S3Store::new(
            config,
            &store.require(S3_ACCESS_KEY)?,
            &store.require(S3_SECRET_KEY)?,
        )?),
    };
    Ok(object_store)
}

async fn run_job(pipelines: &Pipelines, job: &JobConfig, query: &str) -> Result<()> {
    let report = match job.kind {
        JobKind::AnalyticsToCsv => {
            let rows = pipelines
                .analytics_to_csv(query, Path::new(&job.destination))
                .await?;
            info!(rows = rows, path = %job.destination, "Job finished");
            return Ok(());
        }
        JobKind::BatchToAnalytics => pipelines.batch_to_analytics(query, &job.destination).await?,
        JobKind::SqlToAnalytics => pipelines.sql_to_analytics(query, &job.destination).await?,
    };

    match report.rows {
        PollOutcome::Ready { value, attempts } => {
            info!(table = %report.table, rows = value, attempts = attempts, "Job finished");
            Ok(())
        }
        PollOutcome::Failed { reason, .. } => Err(anyhow!(
            "Ingestion into {} failed: {}",
            report.table,
            reason
        )),
        PollOutcome::TimedOut { attempts } => Err(anyhow!(
            "No rows visible in {} after {} checks",
            report.table,
            attempts
        )),
    }
}
