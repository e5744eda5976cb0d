//! Post-run processing utilities.
//!
//! Handles auto-save, save-as copies, and history refresh after a job completes.

use crate::cli::Cli;
use crate::model::{JobOutcome, JobReport};
use crate::storage;

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedJob {
    pub auto_saved_path: Option<std::path::PathBuf>,
    pub messages: Vec<String>,
    pub history: Vec<JobReport>,
}

/// Process a completed job: auto-save the report, honor `--save-as`, and
/// reload recent history.
pub(crate) fn process_job_completion(
    args: &Cli,
    auto_save: bool,
    history_load: usize,
    report: &JobReport,
) -> ProcessedJob {
    let auto_saved_path = if auto_save {
        storage::save_report(report).ok()
    } else {
        None
    };

    let mut messages = Vec::new();
    if let (Some(dest), JobOutcome::Finished { output_path }) =
        (args.save_as.as_deref(), &report.outcome)
    {
        match std::fs::copy(output_path, dest) {
            Ok(_) => messages.push(format!("Saved output to {}", dest.display())),
            Err(e) => messages.push(format!("Save to {} failed: {e}", dest.display())),
        }
    }

    let history = if history_load > 0 {
        storage::load_recent(history_load).unwrap_or_default()
    } else {
        Vec::new()
    };

    ProcessedJob {
        auto_saved_path,
        messages,
        history,
    }
}
