use crate::engine::{EngineControl, UpscaleEngine};
use crate::model::{JobConfig, JobEvent, JobOutcome, JobReport};
use anyhow::{Context, Result};
use clap::Parser;
use rand::RngCore;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "resup",
    version,
    about = "Image upscaling via an external Real-ESRGAN style tool, with optional TUI"
)]
pub struct Cli {
    /// Input image to upscale
    pub input: PathBuf,

    /// Model name passed to the upscaler
    #[arg(long, default_value = "realesrgan-x4plus")]
    pub model: String,

    /// Path to the upscaler executable
    #[arg(long, default_value = "realesrgan-ncnn-vulkan")]
    pub upscaler_bin: PathBuf,

    /// Directory for generated output files (defaults to a subdirectory of the system temp dir)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Output image format, used as the extension the upscaler writes
    #[arg(long, default_value = "png")]
    pub format: String,

    /// Print the JSON job report and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print a text summary and exit (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors (for scripting)
    #[arg(long)]
    pub silent: bool,

    /// Copy the finished output to this path as well
    #[arg(long)]
    pub save_as: Option<PathBuf>,

    /// Use --auto-save true or --auto-save false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_save: bool,

    /// Start the job as soon as the app launches
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub run_on_launch: bool,

    /// Attach custom comments to this job
    #[arg(long)]
    pub comments: Option<String>,
}

pub async fn run(args: Cli) -> Result<()> {
    // Validate that --silent can only be used with --json
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    // Silent mode takes precedence over other output modes
    if args.silent {
        return run_job_engine(args, true).await;
    }

    if !args.json && !args.text {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
        #[cfg(not(feature = "tui"))]
        {
            // Fallback when built without TUI support.
            return run_text(args).await;
        }
    }

    if args.json {
        return run_job_engine(args, false).await;
    }

    run_text(args).await
}

/// Generate a random job id.
fn gen_job_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{:016x}", u64::from_le_bytes(b))
}

/// Build a `JobConfig` from CLI arguments, validating the input file.
pub fn build_job_config(args: &Cli) -> Result<JobConfig> {
    let meta = std::fs::metadata(&args.input)
        .with_context(|| format!("read input image {}", args.input.display()))?;
    if !meta.is_file() {
        anyhow::bail!("input {} is not a file", args.input.display());
    }
    Ok(JobConfig {
        job_id: gen_job_id(),
        input_path: args.input.clone(),
        model_name: args.model.clone(),
        output_dir: args
            .output_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("resup")),
        upscaler_bin: args.upscaler_bin.clone(),
        output_format: args.format.clone(),
        comments: args.comments.clone(),
    })
}

/// Map a terminal outcome to the process-level result: failed jobs surface as
/// errors, finished and cancelled jobs do not.
fn exit_status(report: &JobReport) -> Result<()> {
    match &report.outcome {
        JobOutcome::Failed { message } => Err(anyhow::anyhow!("{message}")),
        _ => Ok(()),
    }
}

/// Relay Ctrl-C to the engine as a cancel so the child is terminated and reaped.
fn relay_ctrl_c(ctrl_tx: mpsc::UnboundedSender<EngineControl>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrl_tx.send(EngineControl::Cancel);
        }
    });
}

/// Common function to run one job and print the report.
/// `silent` controls whether to suppress all output.
async fn run_job_engine(args: Cli, silent: bool) -> Result<()> {
    let cfg = build_job_config(&args)?;
    let (out_tx, out_handle) = if silent {
        (None, None)
    } else {
        let (tx, handle) = spawn_output_writer();
        (Some(tx), Some(handle))
    };

    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<JobEvent>();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<EngineControl>();
    relay_ctrl_c(ctrl_tx);

    let engine = UpscaleEngine::new(cfg);
    let handle = tokio::spawn(async move { engine.run(evt_tx, ctrl_rx).await });

    // Consume events without output; progress only matters interactively.
    while let Some(_ev) = evt_rx.recv().await {}

    let report = handle
        .await
        .context("job task failed")?
        .context("upscale job failed")?;

    let processed = crate::orchestrator::process_job_completion(&args, args.auto_save, 0, &report);

    if let Some(tx) = out_tx.as_ref() {
        for msg in &processed.messages {
            let _ = tx.send(OutputLine::Stderr(msg.clone()));
        }
        if let Some(p) = processed.auto_saved_path.as_ref() {
            let _ = tx.send(OutputLine::Stderr(format!("Saved: {}", p.display())));
        }
        let out = serde_json::to_string_pretty(&report)?;
        let _ = tx.send(OutputLine::Stdout(out));
    }

    if let Some(tx) = out_tx {
        drop(tx);
    }
    if let Some(handle) = out_handle {
        let _ = handle.await;
    }

    exit_status(&report)
}

async fn run_text(args: Cli) -> Result<()> {
    let cfg = build_job_config(&args)?;
    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<JobEvent>();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<EngineControl>();
    relay_ctrl_c(ctrl_tx);

    let engine = UpscaleEngine::new(cfg);
    let handle = tokio::spawn(async move { engine.run(evt_tx, ctrl_rx).await });

    while let Some(ev) = evt_rx.recv().await {
        match ev {
            JobEvent::Started { job_id } => {
                let _ = out_tx.send(OutputLine::Stderr(format!("== job {job_id} ==")));
            }
            JobEvent::Progress { percent } => {
                let _ = out_tx.send(OutputLine::Stderr(format!("Progress: {percent}%")));
            }
            JobEvent::Info(info) => {
                let _ = out_tx.send(OutputLine::Stderr(info.to_message()));
            }
            JobEvent::ToolOutput { .. } => {
                // Raw tool lines feed the TUI log pane; progress lines cover text mode.
            }
            JobEvent::JobCompleted { .. } => {}
        }
    }

    let report = handle
        .await
        .context("job task failed")?
        .context("upscale job failed")?;

    let processed = crate::orchestrator::process_job_completion(&args, args.auto_save, 0, &report);
    let summary = crate::text_summary::build_text_summary(&report);
    for line in summary.lines {
        let _ = out_tx.send(OutputLine::Stdout(line));
    }
    for msg in processed.messages {
        let _ = out_tx.send(OutputLine::Stderr(msg));
    }
    if let Some(p) = processed.auto_saved_path {
        let _ = out_tx.send(OutputLine::Stderr(format!("Saved: {}", p.display())));
    }
    drop(out_tx);
    let _ = out_handle.await;

    exit_status(&report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_unique() {
        assert_ne!(gen_job_id(), gen_job_id());
    }

    #[test]
    fn missing_input_is_rejected() {
        let args = Cli::parse_from(["resup", "/definitely/not/here.png"]);
        assert!(build_job_config(&args).is_err());
    }

    #[test]
    fn config_carries_cli_selections() {
        let dir = std::env::temp_dir();
        let input = dir.join("resup-cli-test-input.png");
        std::fs::write(&input, b"img").unwrap();
        let args = Cli::parse_from([
            "resup",
            input.to_str().unwrap(),
            "--model",
            "realesrgan-x4plus-anime",
            "--format",
            "webp",
        ]);
        let cfg = build_job_config(&args).unwrap();
        assert_eq!(cfg.model_name, "realesrgan-x4plus-anime");
        assert_eq!(cfg.output_format, "webp");
        assert_eq!(cfg.input_path, input);
        std::fs::remove_file(&input).unwrap();
    }
}
