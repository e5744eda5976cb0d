use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything the engine needs to run one upscale job.
///
/// Built once per UI request and consumed by exactly one `UpscaleEngine`
/// instance; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_id: String,
    pub input_path: PathBuf,
    pub model_name: String,
    pub output_dir: PathBuf,
    pub upscaler_bin: PathBuf,
    pub output_format: String,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// The upscaler process has been spawned.
    Started { job_id: String },
    /// Progress percentage parsed from the tool's output, clamped to 0-100.
    Progress { percent: u8 },
    /// A raw output line from the tool, for the UI log pane.
    ToolOutput { line: String },
    Info(InfoEvent),
    /// Terminal event; sent exactly once per job, after all progress events.
    JobCompleted {
        // Box to keep JobEvent small; JobReport carries the full job record.
        report: Box<JobReport>,
    },
}

/// Structured info events emitted by the engine and consumed by UI/CLI layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    // UI/CLI messages generated outside the engine.
    Message(String),
    SpawningTool { bin: PathBuf },
    CancelRequested,
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::SpawningTool { bin } => {
                format!("Spawning upscaler: {}", bin.display())
            }
            InfoEvent::CancelRequested => "Cancel requested, stopping the upscaler".to_string(),
        }
    }
}

/// The single terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Finished { output_path: PathBuf },
    Cancelled,
    Failed { message: String },
}

impl JobOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobOutcome::Finished { .. })
    }

    /// One-line label for summaries and history listings.
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Finished { .. } => "finished",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::Failed { .. } => "failed",
        }
    }
}

/// Record of a completed job, for `--json` output and history storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    #[serde(default)]
    pub timestamp_utc: String,
    pub job_id: String,
    pub input_path: PathBuf,
    pub model_name: String,
    pub outcome: JobOutcome,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub lines_read: u64,
    pub last_percent: u8,
    #[serde(default)]
    pub comments: Option<String>,
}

impl JobReport {
    /// Build a failure report for faults that never reached the run loop
    /// (spawn errors, task join errors). Keeps the one-terminal-outcome
    /// contract intact at the engine boundary.
    pub fn failed(cfg: &JobConfig, message: String, duration_ms: u64) -> Self {
        Self {
            timestamp_utc: now_rfc3339(),
            job_id: cfg.job_id.clone(),
            input_path: cfg.input_path.clone(),
            model_name: cfg.model_name.clone(),
            outcome: JobOutcome::Failed { message },
            exit_code: None,
            duration_ms,
            lines_read: 0,
            last_percent: 0,
            comments: cfg.comments.clone(),
        }
    }
}

/// Current UTC time as RFC3339, falling back to a placeholder on formatting errors.
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}
