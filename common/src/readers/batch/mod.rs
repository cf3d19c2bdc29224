// Batch engine reader driven through the vendor command-line executable
// Jobs are submitted, polled by id, and their outputs exported as files.

pub mod parse;

use crate::config::BatchConfig;
use crate::errors::BatchError;
use crate::files::{self, FIELD_MARKER};
use crate::models::{JobHandle, JobStatus, TabularResult};
use crate::poll::{poll_until, PollOutcome, PollPolicy};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::process::Command;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Options for the batch engine reader
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Path to the batch executable
    pub exe_path: String,
    /// Virtual cluster URL prefixed to every remote path
    pub vc_path: String,
    /// Account used for AAD authentication
    pub account: String,
    /// Where local scripts and exports are staged
    pub work_dir: PathBuf,
    /// Remote folder for temporary query outputs, e.g. `/users/<alias>`
    pub remote_temp_dir: String,
    pub poll: PollPolicy,
}

impl BatchOptions {
    pub fn from_config(config: &BatchConfig) -> Self {
        let alias = config.account.split('@').next().unwrap_or_default();
        Self {
            exe_path: config.exe_path.clone(),
            vc_path: config.vc_path.clone(),
            account: config.account.clone(),
            work_dir: config.work_dir.clone(),
            remote_temp_dir: format!("/users/{}", alias),
            poll: config.poll_policy(),
        }
    }
}

/// Captured output of one executable invocation
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Output of a finished job, still on the batch engine
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub job: JobHandle,
    /// Remote output path, without the virtual cluster prefix
    pub remote_path: String,
}

/// Result of running a script to a local file
#[derive(Debug, Clone)]
pub struct BatchRun {
    pub job: JobHandle,
    /// Remote output path, without the virtual cluster prefix
    pub remote_path: String,
    pub local_csv: PathBuf,
}

/// Reader for the batch engine
pub struct BatchEngineReader {
    options: BatchOptions,
}

impl BatchEngineReader {
    pub fn new(options: BatchOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    fn auth_args(&self) -> Vec<String> {
        vec![
            "-on".to_string(),
            "useaadauthentication".to_string(),
            "-u".to_string(),
            self.options.account.clone(),
        ]
    }

    fn vc_file_path(&self, remote_path: &str) -> String {
        format!("{}{}", self.options.vc_path, remote_path)
    }

    pub fn submit_args(&self, script_path: &Path) -> Vec<String> {
        let mut args = vec![
            "submit".to_string(),
            "-i".to_string(),
            script_path.display().to_string(),
            "-vc".to_string(),
            self.options.vc_path.clone(),
        ];
        args.extend(self.auth_args());
        args
    }

    pub fn status_args(&self, job_id: &str) -> Vec<String> {
        let mut args = vec![
            "jobstatus".to_string(),
            job_id.to_string(),
            "-vc".to_string(),
            self.options.vc_path.clone(),
        ];
        args.extend(self.auth_args());
        args
    }

    pub fn export_args(&self, remote_path: &str, local_path: &Path) -> Vec<String> {
        let mut args = vec![
            "export".to_string(),
            self.vc_file_path(remote_path),
            local_path.display().to_string(),
            "-delims".to_string(),
            ",".to_string(),
        ];
        args.extend(self.auth_args());
        args
    }

    pub fn delete_args(&self, remote_path: &str) -> Vec<String> {
        let mut args = vec!["delete".to_string(), self.vc_file_path(remote_path)];
        args.extend(self.auth_args());
        args
    }

    /// Run the executable and capture its output
    async fn run(&self, args: &[String]) -> Result<CommandOutput, BatchError> {
        info!(command = %format!("{} {}", self.options.exe_path, args.join(" ")), ">");

        let output = Command::new(&self.options.exe_path)
            .args(args)
            .output()
            .await
            .map_err(|e| BatchError::Launch {
                exe: self.options.exe_path.clone(),
                reason: e.to_string(),
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Submit a script file and return the job handle
    #[instrument(skip(self), fields(script = %script_path.display()))]
    pub async fn submit(&self, script_path: &Path) -> Result<JobHandle, BatchError> {
        let output = self.run(&self.submit_args(script_path)).await?;

        if !output.success {
            error!(output = %output.combined(), "Batch submit failed");
            return Err(BatchError::ExternalTool {
                message: "submit exited with a failure status".to_string(),
                output: output.combined(),
            });
        }

        let job_id = parse::parse_job_id(&output.stdout)?;
        info!(job_id = %job_id, "Batch job submitted");

        Ok(JobHandle {
            job_id,
            submitted_at: Utc::now(),
        })
    }

    /// Poll job status until success, a failure marker, or attempts run out
    #[instrument(skip(self, job), fields(job_id = %job.job_id))]
    pub async fn poll_status(&self, job: &JobHandle, policy: PollPolicy) -> JobStatus {
        let args = self.status_args(&job.job_id);
        let args = &args;

        let outcome = poll_until(policy, "batch_job", move || async move {
            let output = self.run(args).await?;
            Ok::<_, BatchError>(parse::classify_status(&output.combined()))
        })
        .await;

        match outcome {
            PollOutcome::Ready { .. } => {
                info!("Batch job is completed");
                JobStatus::Succeeded
            }
            PollOutcome::Failed { reason, .. } => {
                warn!(marker = %reason, "Batch job failed");
                JobStatus::Failed { marker: reason }
            }
            PollOutcome::TimedOut { attempts } => {
                warn!(attempts = attempts, "Batch job still not completed");
                JobStatus::TimedOut { attempts }
            }
        }
    }

    /// Poll with the configured policy and turn anything but success into an error
    pub async fn wait_for_job(&self, job: &JobHandle) -> Result<(), BatchError> {
        match self.poll_status(job, self.options.poll).await {
            JobStatus::Succeeded => Ok(()),
            JobStatus::Failed { marker } => Err(BatchError::JobFailed {
                job_id: job.job_id.clone(),
                status: marker,
            }),
            JobStatus::TimedOut { attempts } => Err(BatchError::JobTimedOut {
                job_id: job.job_id.clone(),
                attempts,
            }),
        }
    }

    /// Export a remote output to a local comma-delimited file with a plain header
    #[instrument(skip(self), fields(local = %local_path.display()))]
    pub async fn export_to_local_csv(
        &self,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), BatchError> {
        let output = self.run(&self.export_args(remote_path, local_path)).await?;

        if !output.success {
            return Err(BatchError::ExternalTool {
                message: format!("export of {} failed", remote_path),
                output: output.combined(),
            });
        }

        files::strip_header_marker(local_path, FIELD_MARKER).map_err(|e| {
            BatchError::FileFailed(format!(
                "Failed to rewrite header of {}: {}",
                local_path.display(),
                e
            ))
        })?;

        info!("Download done");
        Ok(())
    }

    /// Delete a remote file
    #[instrument(skip(self))]
    pub async fn delete_remote(&self, remote_path: &str) -> Result<(), BatchError> {
        let output = self.run(&self.delete_args(remote_path)).await?;

        if !output.success {
            return Err(BatchError::ExternalTool {
                message: format!("delete of {} failed", remote_path),
                output: output.combined(),
            });
        }
        Ok(())
    }

    fn remote_temp_path(&self) -> String {
        format!(
            "{}/query_temp_{}.ss",
            self.options.remote_temp_dir.trim_end_matches('/'),
            Uuid::new_v4().simple()
        )
    }

    /// Submit a script and wait for it to succeed.
    ///
    /// The script writes to the `@output` parameter, declared here with a
    /// unique remote path. Once this returns `Ok` the remote output exists
    /// and the caller owns its deletion.
    #[instrument(skip(self, script))]
    pub async fn run_script_remote(&self, script: &str) -> Result<RemoteOutput, BatchError> {
        let remote_path = self.remote_temp_path();
        let script = format!("#DECLARE output string = \"{}\";\n{}", remote_path, script);

        let script_path = files::unique_path(&self.options.work_dir, "temp", "script");
        std::fs::write(&script_path, script).map_err(|e| {
            BatchError::FileFailed(format!(
                "Failed to write script {}: {}",
                script_path.display(),
                e
            ))
        })?;

        let submitted = self.submit(&script_path).await;
        if let Err(e) = files::remove_file(&script_path) {
            warn!(error = %e, script = %script_path.display(), "Failed to remove temp script");
        }
        let job = submitted?;

        self.wait_for_job(&job).await?;
        Ok(RemoteOutput { job, remote_path })
    }

    /// Submit a script, wait for it, and export its output to `local_csv`.
    ///
    /// On success the remote file is left for the caller to delete. If the
    /// export fails the remote file is deleted here before the error returns.
    #[instrument(skip(self, script), fields(local = %local_csv.display()))]
    pub async fn run_script_to_file(
        &self,
        script: &str,
        local_csv: &Path,
    ) -> Result<BatchRun, BatchError> {
        let output = self.run_script_remote(script).await?;

        if let Err(e) = self.export_to_local_csv(&output.remote_path, local_csv).await {
            self.discard_remote(&output.remote_path).await;
            return Err(e);
        }

        Ok(BatchRun {
            job: output.job,
            remote_path: output.remote_path,
            local_csv: local_csv.to_path_buf(),
        })
    }

    /// Run a script and load its output into memory; temp files are removed
    #[instrument(skip(self, script))]
    pub async fn run_script(&self, script: &str) -> Result<TabularResult, BatchError> {
        let started = Instant::now();
        let local_csv = files::unique_path(&self.options.work_dir, "temp_query_data", "csv");

        let loaded = match self.run_script_to_file(script, &local_csv).await {
            Ok(run) => {
                let loaded = TabularResult::read_csv_file(&run.local_csv).map_err(|e| {
                    BatchError::FileFailed(format!(
                        "Failed to load {}: {}",
                        run.local_csv.display(),
                        e
                    ))
                });
                self.discard_remote(&run.remote_path).await;
                loaded
            }
            Err(e) => Err(e),
        };

        if let Err(e) = files::remove_file(&local_csv) {
            warn!(error = %e, local = %local_csv.display(), "Failed to remove local export");
        }

        let result = loaded?;
        info!(
            rows = result.row_count(),
            elapsed_seconds = started.elapsed().as_secs_f64(),
            "Batch query finished"
        );
        Ok(result)
    }

    async fn discard_remote(&self, remote_path: &str) {
        if let Err(e) = self.delete_remote(remote_path).await {
            warn!(error = %e, remote = %remote_path, "Failed to delete remote temp output");
        }
    }
}
