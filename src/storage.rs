//! Job history persistence.
//!
//! Completed job reports are stored as individual JSON files under the
//! platform data directory, named by save time so a reverse name sort yields
//! newest-first listings.

use crate::model::JobReport;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

fn history_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("no platform data directory")?;
    Ok(base.join("resup").join("history"))
}

pub fn save_report(report: &JobReport) -> Result<PathBuf> {
    save_report_in(&history_dir()?, report)
}

pub(crate) fn save_report_in(dir: &Path, report: &JobReport) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create history directory {}", dir.display()))?;
    let ts = time::OffsetDateTime::now_utc().unix_timestamp();
    let path = dir.join(format!("{ts}_{}.json", report.job_id));
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&path, json).with_context(|| format!("write report {}", path.display()))?;
    Ok(path)
}

pub fn load_recent(limit: usize) -> Result<Vec<JobReport>> {
    load_recent_in(&history_dir()?, limit)
}

pub(crate) fn load_recent_in(dir: &Path, limit: usize) -> Result<Vec<JobReport>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("read history directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    paths.reverse();

    let mut reports = Vec::new();
    for path in paths.into_iter().take(limit) {
        // Skip unreadable or stale entries instead of failing the whole listing.
        if let Ok(text) = std::fs::read_to_string(&path) {
            if let Ok(report) = serde_json::from_str::<JobReport>(&text) {
                reports.push(report);
            }
        }
    }
    Ok(reports)
}

pub fn delete_report(report: &JobReport) -> Result<()> {
    delete_report_in(&history_dir()?, report)
}

pub(crate) fn delete_report_in(dir: &Path, report: &JobReport) -> Result<()> {
    let suffix = format!("_{}.json", report.job_id);
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("read history directory {}", dir.display()))?
    {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(&suffix));
        if matches {
            std::fs::remove_file(&path)
                .with_context(|| format!("delete report {}", path.display()))?;
        }
    }
    Ok(())
}

/// Export a report as pretty JSON into the current directory, named after its
/// timestamp and job id. Returns the path of the exported file.
pub fn export_report(report: &JobReport) -> Result<PathBuf> {
    let dir = std::env::current_dir().context("get current directory")?;
    export_report_in(&dir, report)
}

pub(crate) fn export_report_in(dir: &Path, report: &JobReport) -> Result<PathBuf> {
    let name = format!(
        "resup-{}-{}.json",
        report.timestamp_utc.replace(':', "-").replace('T', "_"),
        &report.job_id[..8.min(report.job_id.len())]
    );
    let path = dir.join(name);
    export_json(&path, report)?;
    Ok(path)
}

/// Write a single report as pretty JSON to an explicit path.
fn export_json(path: &Path, report: &JobReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("export report {}", path.display()))?;
    Ok(())
}
