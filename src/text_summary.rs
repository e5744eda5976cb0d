//! Text summary builder for CLI output.
//!
//! Formats human-readable lines describing a completed job for text mode.

use crate::model::{JobOutcome, JobReport};
use std::time::Duration;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// Build a text summary from a completed job report.
pub(crate) fn build_text_summary(report: &JobReport) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!("Input:  {}", report.input_path.display()));
    lines.push(format!("Model:  {}", report.model_name));
    match &report.outcome {
        JobOutcome::Finished { output_path } => {
            lines.push(format!("Output: {}", output_path.display()));
        }
        JobOutcome::Cancelled => lines.push("Outcome: cancelled".into()),
        JobOutcome::Failed { message } => lines.push(format!("Outcome: failed ({message})")),
    }
    lines.push(format!(
        "Took {} ({} output lines, last progress {}%)",
        humantime::format_duration(Duration::from_millis(report.duration_ms)),
        report.lines_read,
        report.last_percent
    ));
    if let Some(code) = report.exit_code {
        lines.push(format!("Upscaler exit code: {code}"));
    }
    if let Some(comments) = report.comments.as_deref() {
        if !comments.trim().is_empty() {
            lines.push(format!("Comments: {comments}"));
        }
    }

    TextSummary { lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_rfc3339;

    fn report(outcome: JobOutcome) -> JobReport {
        JobReport {
            timestamp_utc: now_rfc3339(),
            job_id: "deadbeef".into(),
            input_path: "photo.png".into(),
            model_name: "realesrgan-x4plus".into(),
            outcome,
            exit_code: Some(0),
            duration_ms: 1500,
            lines_read: 12,
            last_percent: 100,
            comments: None,
        }
    }

    #[test]
    fn finished_summary_names_the_output_path() {
        let summary = build_text_summary(&report(JobOutcome::Finished {
            output_path: "/tmp/upscaled_ab.png".into(),
        }));
        assert!(summary
            .lines
            .iter()
            .any(|l| l.contains("/tmp/upscaled_ab.png")));
    }

    #[test]
    fn failed_summary_carries_the_message() {
        let summary = build_text_summary(&report(JobOutcome::Failed {
            message: "upscaler failed with exit code 1".into(),
        }));
        assert!(summary.lines.iter().any(|l| l.contains("exit code 1")));
    }
}
