//! Job lifecycle controller.
//!
//! Owns start/cancel/quit orchestration and emits events for presentation layers.

use crate::cli::{build_job_config, Cli};
use crate::engine::{EngineControl, UpscaleEngine};
use crate::model::{InfoEvent, JobConfig, JobEvent, JobReport};
use anyhow::Result;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;

/// Commands emitted by UI layers to control the running job.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Start,
    Cancel,
    Quit,
}

/// Internal handle for a running job task.
struct RunCtx {
    cfg: JobConfig,
    ctrl_tx: UnboundedSender<EngineControl>,
    handle: Option<tokio::task::JoinHandle<Result<JobReport>>>,
}

/// Spawn a new job and return its control handle. Every job gets a fresh
/// engine instance; engines are never re-entered.
fn start_run(args: &Cli, event_tx: UnboundedSender<JobEvent>) -> Result<RunCtx> {
    let cfg = build_job_config(args)?;
    let (ctrl_tx, ctrl_rx) = tokio::sync::mpsc::unbounded_channel::<EngineControl>();
    let engine = UpscaleEngine::new(cfg.clone());
    let handle = tokio::spawn(async move { engine.run(event_tx, ctrl_rx).await });
    Ok(RunCtx {
        cfg,
        ctrl_tx,
        handle: Some(handle),
    })
}

/// Orchestrate jobs based on UI commands and emit events back to presentation layers.
pub(crate) async fn run_controller(
    args: &Cli,
    event_tx: UnboundedSender<JobEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let mut run_ctx = if args.run_on_launch {
        Some(start_run(args, event_tx.clone())?)
    } else {
        None
    };
    let mut quit_pending = false;
    // Cancel watchdog: if a cancel takes too long, emit a status message to keep UI feedback alive.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Start) => {
                        if run_ctx.is_some() {
                            let _ = event_tx.send(JobEvent::Info(InfoEvent::Message(
                                "A job is already running".into(),
                            )));
                        } else {
                            match start_run(args, event_tx.clone()) {
                                Ok(ctx) => run_ctx = Some(ctx),
                                Err(e) => {
                                    let _ = event_tx.send(JobEvent::Info(InfoEvent::Message(
                                        format!("Cannot start job: {e:#}"),
                                    )));
                                }
                            }
                        }
                    }
                    Some(UiCommand::Cancel) => {
                        if let Some(ctx) = &run_ctx {
                            let _ = ctx.ctrl_tx.send(EngineControl::Cancel);
                            cancel_deadline =
                                Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        }
                    }
                    Some(UiCommand::Quit) => {
                        // Quit waits for the current job so its outcome is
                        // finalized and the child is reaped.
                        quit_pending = true;
                        if let Some(ctx) = &run_ctx {
                            let _ = ctx.ctrl_tx.send(EngineControl::Cancel);
                            cancel_deadline =
                                Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        } else {
                            break;
                        }
                    }
                    None => {
                        quit_pending = true;
                        if let Some(ctx) = &run_ctx {
                            let _ = ctx.ctrl_tx.send(EngineControl::Cancel);
                        } else {
                            break;
                        }
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            maybe_done = async {
                if let Some(ctx) = &mut run_ctx {
                    if let Some(h) = ctx.handle.as_mut() {
                        return Some(h.await);
                    }
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    if let Some(ctx) = run_ctx.take() {
                        let report = match join_res {
                            Ok(Ok(report)) => report,
                            Ok(Err(e)) => JobReport::failed(&ctx.cfg, format!("{e:#}"), 0),
                            Err(e) => {
                                JobReport::failed(&ctx.cfg, format!("job task failed: {e}"), 0)
                            }
                        };
                        // The terminal event goes out after the engine task has
                        // joined, so it always follows every progress event.
                        let _ = event_tx.send(JobEvent::JobCompleted {
                            report: Box::new(report),
                        });
                    }
                    cancel_deadline = None;
                    if quit_pending {
                        break;
                    }
                }
            }
            // If a cancel stalls (e.g., the tool ignores the termination
            // request briefly), keep the user informed.
            _ = watchdog.tick() => {
                if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline && run_ctx.is_some() {
                        let _ = event_tx.send(JobEvent::Info(InfoEvent::Message(
                            "Still cancelling…".into(),
                        )));
                        cancel_deadline = None;
                    }
                }
            }
        }
    }

    Ok(())
}
