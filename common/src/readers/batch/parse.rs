// Parsing of the batch executable's human-readable output
// Every assumption about the tool's text format lives in this file.

use crate::errors::BatchError;
use crate::poll::Check;
use uuid::Uuid;

/// Status text printed once a job has finished successfully
pub const SUCCESS_MARKER: &str = "CompletedSuccess";

/// Status text that ends a job without output
pub const FAILURE_MARKERS: [&str; 4] = ["CompletedFailure", "Cancelled", "Canceled", "Failed"];

/// Extract the job id from `submit` output.
///
/// The tool prints `<label>: <guid>` as its first labelled line; anything
/// else there (a compile error, a usage message) is a failed submit.
pub fn parse_job_id(stdout: &str) -> Result<String, BatchError> {
    stdout
        .lines()
        .find_map(|line| line.split_once(':'))
        .and_then(|(_, value)| Uuid::parse_str(value.trim()).ok())
        .map(|id| id.to_string())
        .ok_or_else(|| BatchError::ExternalTool {
            message: "submit output does not contain a job id".to_string(),
            output: stdout.to_string(),
        })
}

/// The value of the first `State:` line of `jobstatus` output
pub fn parse_state(output: &str) -> Option<&str> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(label, _)| label.trim().eq_ignore_ascii_case("state"))
        .and_then(|(_, value)| value.split_whitespace().next())
}

/// Map `jobstatus` output to a poll check.
///
/// Only the state line decides; marker words elsewhere in the output
/// (warnings, statistics) are ignored.
pub fn classify_status(output: &str) -> Check<()> {
    match parse_state(output) {
        Some(state) if state == SUCCESS_MARKER => Check::Ready(()),
        Some(state) => match FAILURE_MARKERS.iter().find(|marker| **marker == state) {
            Some(marker) => Check::Failed((*marker).to_string()),
            None => Check::Pending,
        },
        None => Check::Pending,
    }
}
