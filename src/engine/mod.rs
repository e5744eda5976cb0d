//! Upscale job engine: spawns the external upscaler and supervises it.
//!
//! One engine instance runs exactly one job. It translates the tool's text
//! output into progress events, honors cooperative cancellation, and folds
//! every fault into a single terminal `JobReport` at its boundary.

mod outfile;
mod progress;

use crate::model::{now_rfc3339, InfoEvent, JobConfig, JobEvent, JobOutcome, JobReport};
use anyhow::{Context, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone)]
pub enum EngineControl {
    /// Cancel the job entirely.
    Cancel,
}

/// Process handle shared between the run loop and the cancel path. At most
/// one child is live per engine instance; the slot is cleared before the
/// final wait so a termination request can never hit a reaped handle.
type ChildSlot = Arc<Mutex<Option<Child>>>;

pub struct UpscaleEngine {
    cfg: JobConfig,
}

impl UpscaleEngine {
    pub fn new(cfg: JobConfig) -> Self {
        Self { cfg }
    }

    pub async fn run(
        self,
        event_tx: mpsc::UnboundedSender<JobEvent>,
        mut control_rx: mpsc::UnboundedReceiver<EngineControl>,
    ) -> Result<JobReport> {
        let started = Instant::now();
        let cancelled = Arc::new(AtomicBool::new(false));
        let child_slot: ChildSlot = Arc::new(Mutex::new(None));

        // A cancel queued before the job started must win without spawning the tool.
        while let Ok(EngineControl::Cancel) = control_rx.try_recv() {
            cancelled.store(true, Ordering::Relaxed);
        }

        // Control listener: flips the flag and asks the child to terminate, so
        // the read loop unblocks even when the tool stalls without output.
        let cancelled2 = cancelled.clone();
        let slot2 = child_slot.clone();
        let info_tx = event_tx.clone();
        let control_handle = tokio::spawn(async move {
            while let Some(msg) = control_rx.recv().await {
                match msg {
                    EngineControl::Cancel => {
                        cancelled2.store(true, Ordering::Relaxed);
                        let _ = info_tx.send(JobEvent::Info(InfoEvent::CancelRequested));
                        if let Some(child) = slot2.lock().await.as_mut() {
                            let _ = child.start_kill();
                        }
                        break;
                    }
                }
            }
        });

        // Every fault resolves to a failure report here; nothing crosses the
        // engine boundary as an error.
        let report = match run_job(&self.cfg, &event_tx, &cancelled, &child_slot).await {
            Ok(report) => report,
            Err(e) => JobReport::failed(
                &self.cfg,
                format!("{e:#}"),
                started.elapsed().as_millis() as u64,
            ),
        };

        // Dropping a JoinHandle does not cancel the task; abort so the
        // listener does not linger on control_rx after the job is over.
        control_handle.abort();

        Ok(report)
    }
}

async fn run_job(
    cfg: &JobConfig,
    event_tx: &mpsc::UnboundedSender<JobEvent>,
    cancelled: &AtomicBool,
    child_slot: &ChildSlot,
) -> Result<JobReport> {
    let started = Instant::now();

    if cancelled.load(Ordering::Relaxed) {
        return Ok(JobReport {
            timestamp_utc: now_rfc3339(),
            job_id: cfg.job_id.clone(),
            input_path: cfg.input_path.clone(),
            model_name: cfg.model_name.clone(),
            outcome: JobOutcome::Cancelled,
            exit_code: None,
            duration_ms: started.elapsed().as_millis() as u64,
            lines_read: 0,
            last_percent: 0,
            comments: cfg.comments.clone(),
        });
    }

    let output_path = outfile::unique_output_path(&cfg.output_dir, &cfg.output_format)?;

    let _ = event_tx.send(JobEvent::Info(InfoEvent::SpawningTool {
        bin: cfg.upscaler_bin.clone(),
    }));

    let mut child = Command::new(&cfg.upscaler_bin)
        .arg("-i")
        .arg(&cfg.input_path)
        .arg("-o")
        .arg(&output_path)
        .arg("-n")
        .arg(&cfg.model_name)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn upscaler {}", cfg.upscaler_bin.display()))?;

    let _ = event_tx.send(JobEvent::Started {
        job_id: cfg.job_id.clone(),
    });

    // The tool interleaves progress between stdout and stderr; merge both
    // into one line stream the way a terminal would show them.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<std::io::Result<String>>();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, line_tx.clone()));
    }
    drop(line_tx);

    {
        *child_slot.lock().await = Some(child);
    }

    let parser = progress::ProgressParser::new();
    let mut lines_read = 0u64;
    let mut last_percent = 0u8;
    let mut read_error: Option<std::io::Error> = None;

    loop {
        // One flag check per line keeps cancel latency bounded by a single read.
        if cancelled.load(Ordering::Relaxed) {
            break;
        }
        match line_rx.recv().await {
            Some(Ok(line)) => {
                lines_read += 1;
                let percent = parser.percent(&line);
                let done = parser.is_done(&line);
                let _ = event_tx.send(JobEvent::ToolOutput { line });
                if let Some(percent) = percent {
                    last_percent = percent;
                    let _ = event_tx.send(JobEvent::Progress { percent });
                }
                if done {
                    last_percent = 100;
                    let _ = event_tx.send(JobEvent::Progress { percent: 100 });
                }
            }
            Some(Err(e)) => {
                read_error = Some(e);
                break;
            }
            // Both streams closed; the process is exiting.
            None => break,
        }
    }

    // Always reap the child, even after cancel or a read error; otherwise it
    // is left as a zombie. Taking it out of the slot means the cancel path
    // can no longer touch a handle that is about to be released.
    let mut child = child_slot
        .lock()
        .await
        .take()
        .context("process handle already released")?;

    // A cancel or a broken output stream both mean we no longer want the tool
    // running; terminate it up front instead of waiting out its natural exit.
    let mut kill_sent = false;
    if cancelled.load(Ordering::Relaxed) || read_error.is_some() {
        let _ = child.start_kill();
        kill_sent = true;
    }
    let status = loop {
        tokio::select! {
            status = child.wait() => {
                break status.context("wait for upscaler exit")?;
            }
            // The flag can flip while we are blocked on exit; deliver the
            // termination request it implies without giving up the wait.
            _ = tokio::time::sleep(Duration::from_millis(100)), if !kill_sent => {
                if cancelled.load(Ordering::Relaxed) {
                    let _ = child.start_kill();
                    kill_sent = true;
                }
            }
        }
    };

    let outcome = if cancelled.load(Ordering::Relaxed) {
        // Best-effort removal of a partially written output file.
        match tokio::fs::remove_file(&output_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                let _ = event_tx.send(JobEvent::Info(InfoEvent::Message(format!(
                    "Could not remove partial output {}: {e}",
                    output_path.display()
                ))));
            }
        }
        JobOutcome::Cancelled
    } else if let Some(e) = read_error {
        JobOutcome::Failed {
            message: format!("error reading upscaler output: {e}"),
        }
    } else if status.success() && output_path.exists() {
        JobOutcome::Finished {
            output_path: output_path.clone(),
        }
    } else {
        let message = match status.code() {
            Some(0) => "upscaler exited with code 0 but wrote no output file".to_string(),
            Some(code) => format!("upscaler failed with exit code {code}"),
            None => "upscaler was terminated by a signal".to_string(),
        };
        JobOutcome::Failed { message }
    };

    Ok(JobReport {
        timestamp_utc: now_rfc3339(),
        job_id: cfg.job_id.clone(),
        input_path: cfg.input_path.clone(),
        model_name: cfg.model_name.clone(),
        outcome,
        exit_code: status.code(),
        duration_ms: started.elapsed().as_millis() as u64,
        lines_read,
        last_percent,
        comments: cfg.comments.clone(),
    })
}

/// Forward one output stream to the merged line channel, line by line.
async fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<std::io::Result<String>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(Ok(line)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::model::JobConfig;
    use rand::RngCore;
    use std::path::{Path, PathBuf};

    pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
        let mut b = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut b);
        let dir = std::env::temp_dir().join(format!(
            "resup-test-{tag}-{:016x}",
            u64::from_le_bytes(b)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Write an executable fake upscaler. It is invoked as
    /// `-i <input> -o <output> -n <model>`, so `$2`, `$4`, `$6` hold the values.
    #[cfg(unix)]
    pub(crate) fn write_fake_tool(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-upscaler.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub(crate) fn job_config(tag: &str, dir: &Path, tool: &Path) -> JobConfig {
        let input_path = dir.join("input.png");
        std::fs::write(&input_path, b"not really a png").unwrap();
        JobConfig {
            job_id: format!("job-{tag}"),
            input_path,
            model_name: "realesrgan-x4plus".into(),
            output_dir: dir.join("out"),
            upscaler_bin: tool.to_path_buf(),
            output_format: "png".into(),
            comments: None,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::testutil::{job_config, scratch_dir, write_fake_tool};
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn progress_values(events: &[JobEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|ev| match ev {
                JobEvent::Progress { percent } => Some(*percent),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn successful_job_emits_progress_then_finishes() {
        let dir = scratch_dir("success");
        let tool = write_fake_tool(
            &dir,
            "echo '10%'\necho '55%'\ncp \"$2\" \"$4\"\necho 'done'",
        );
        let cfg = job_config("success", &dir, &tool);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let report = UpscaleEngine::new(cfg.clone())
            .run(event_tx, ctrl_rx)
            .await
            .unwrap();

        let events = drain(&mut event_rx);
        assert_eq!(progress_values(&events), vec![10, 55, 100]);
        match &report.outcome {
            JobOutcome::Finished { output_path } => {
                assert!(output_path.exists());
                assert_eq!(output_path.parent().unwrap(), cfg.output_dir);
            }
            other => panic!("expected Finished, got {other:?}"),
        }
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.last_percent, 100);
        assert!(report.lines_read >= 3);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn done_inside_a_percent_line_emits_both_updates() {
        let dir = scratch_dir("mixed-line");
        let tool = write_fake_tool(&dir, "cp \"$2\" \"$4\"\necho 'writing... 42% done so far'");
        let cfg = job_config("mixed-line", &dir, &tool);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let report = UpscaleEngine::new(cfg).run(event_tx, ctrl_rx).await.unwrap();

        assert_eq!(progress_values(&drain(&mut event_rx)), vec![42, 100]);
        assert!(report.outcome.is_finished());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_reports_failure_naming_the_code() {
        let dir = scratch_dir("exit-code");
        let tool = write_fake_tool(&dir, "echo '30%'\nexit 1");
        let cfg = job_config("exit-code", &dir, &tool);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let report = UpscaleEngine::new(cfg).run(event_tx, ctrl_rx).await.unwrap();

        match &report.outcome {
            JobOutcome::Failed { message } => assert!(message.contains('1'), "{message}"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(report.exit_code, Some(1));
        assert_eq!(progress_values(&drain(&mut event_rx)), vec![30]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn clean_exit_without_output_file_is_a_failure() {
        let dir = scratch_dir("no-output");
        let tool = write_fake_tool(&dir, "echo '100%'");
        let cfg = job_config("no-output", &dir, &tool);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let report = UpscaleEngine::new(cfg).run(event_tx, ctrl_rx).await.unwrap();

        match &report.outcome {
            JobOutcome::Failed { message } => assert!(message.contains("no output"), "{message}"),
            other => panic!("expected Failed, got {other:?}"),
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn missing_executable_is_reported_not_propagated() {
        let dir = scratch_dir("missing-bin");
        let cfg = job_config("missing-bin", &dir, &dir.join("missing-tool"));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let report = UpscaleEngine::new(cfg).run(event_tx, ctrl_rx).await.unwrap();

        match &report.outcome {
            JobOutcome::Failed { message } => assert!(message.contains("spawn upscaler")),
            other => panic!("expected Failed, got {other:?}"),
        }
        let events = drain(&mut event_rx);
        assert!(!events
            .iter()
            .any(|ev| matches!(ev, JobEvent::Started { .. })));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn undecodable_output_terminates_the_tool_and_reports_failure() {
        let dir = scratch_dir("bad-utf8");
        // printf '\370' emits an invalid UTF-8 byte, breaking the line stream
        // while the tool itself keeps running.
        let tool = write_fake_tool(&dir, "printf 'garbage \\370\\n'\nexec sleep 30");
        let cfg = job_config("bad-utf8", &dir, &tool);
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let (_ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            UpscaleEngine::new(cfg).run(event_tx, ctrl_rx),
        )
        .await
        .expect("tool was not terminated after its output stream broke")
        .unwrap();

        match &report.outcome {
            JobOutcome::Failed { message } => {
                assert!(message.contains("reading upscaler output"), "{message}")
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn cancel_mid_run_removes_partial_output() {
        let dir = scratch_dir("cancel");
        // exec keeps the stall in the process we kill, not a shell child.
        let tool = write_fake_tool(&dir, "cp \"$2\" \"$4\"\necho '10%'\nexec sleep 30");
        let cfg = job_config("cancel", &dir, &tool);
        let out_dir = cfg.output_dir.clone();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(UpscaleEngine::new(cfg).run(event_tx, ctrl_rx));

        // Wait for the first progress update, then cancel while the tool stalls.
        loop {
            match event_rx.recv().await {
                Some(JobEvent::Progress { .. }) => break,
                Some(_) => {}
                None => panic!("event channel closed before progress"),
            }
        }
        ctrl_tx.send(EngineControl::Cancel).unwrap();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.outcome, JobOutcome::Cancelled);
        let leftovers: Vec<_> = std::fs::read_dir(&out_dir).unwrap().collect();
        assert!(leftovers.is_empty(), "partial output not removed");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn cancel_before_start_never_spawns() {
        let dir = scratch_dir("cancel-early");
        let tool = write_fake_tool(&dir, "cp \"$2\" \"$4\"");
        let cfg = job_config("cancel-early", &dir, &tool);
        let out_dir = cfg.output_dir.clone();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        ctrl_tx.send(EngineControl::Cancel).unwrap();

        let report = UpscaleEngine::new(cfg).run(event_tx, ctrl_rx).await.unwrap();

        assert_eq!(report.outcome, JobOutcome::Cancelled);
        let events = drain(&mut event_rx);
        assert!(!events
            .iter()
            .any(|ev| matches!(ev, JobEvent::Started { .. })));
        assert!(!out_dir.exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
