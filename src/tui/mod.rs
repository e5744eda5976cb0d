mod help;
mod state;

use crate::cli::Cli;
use crate::model::{JobEvent, JobOutcome, JobReport};
use crate::orchestrator::{self, UiCommand};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph, Tabs},
    Frame, Terminal,
};
use state::{JobPhase, UiState};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

const HISTORY_LOAD: usize = 50;

pub async fn run(args: Cli) -> Result<()> {
    // Unbounded channels avoid backpressure and task switching in the hot path.
    let (event_tx, event_rx) = mpsc::unbounded_channel::<JobEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_args = args.clone();
    let ui_handle = std::thread::spawn(move || run_threaded(ui_args, event_rx, cmd_tx));

    let res = orchestrator::run_controller(&args, event_tx, cmd_rx).await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    args: Cli,
    mut event_rx: UnboundedReceiver<JobEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; no cross-thread mutation.
    let mut state = UiState::new(&args);
    state.history = crate::storage::load_recent(HISTORY_LOAD).unwrap_or_default();

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep UI responsive; unbounded channel avoids backpressure.
        while let Ok(ev) = event_rx.try_recv() {
            match ev {
                JobEvent::JobCompleted { report } => {
                    handle_job_completed(&args, &mut state, *report);
                }
                other => apply_event(&mut state, other),
            }
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Char('c')) => {
                        if state.phase == JobPhase::Running {
                            state.info = "Cancelling…".into();
                            let _ = cmd_tx.send(UiCommand::Cancel);
                        }
                    }
                    (_, KeyCode::Char('r')) => {
                        if state.phase == JobPhase::Running {
                            state.info = "A job is already running".into();
                        } else {
                            state.reset_for_new_job();
                            let _ = cmd_tx.send(UiCommand::Start);
                        }
                    }
                    (_, KeyCode::Char('s')) => {
                        save_output(&mut state);
                    }
                    (_, KeyCode::Char('a')) => {
                        state.auto_save = !state.auto_save;
                        state.info = if state.auto_save {
                            "Auto-save enabled".into()
                        } else {
                            "Auto-save disabled".into()
                        };
                    }
                    (_, KeyCode::Tab) => {
                        state.tab = (state.tab + 1) % 3;
                        if state.tab == 1 {
                            state.history_selected = 0;
                        }
                    }
                    (_, KeyCode::Char('?')) => {
                        state.tab = 2;
                    }
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) => {
                        if state.tab == 1 && state.history_selected > 0 {
                            state.history_selected -= 1;
                        }
                    }
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) => {
                        if state.tab == 1
                            && !state.history.is_empty()
                            && state.history_selected < state.history.len() - 1
                        {
                            state.history_selected += 1;
                        }
                    }
                    (_, KeyCode::Char('e')) => {
                        if state.tab == 1
                            && !state.history.is_empty()
                            && state.history_selected < state.history.len()
                        {
                            let selected = &state.history[state.history_selected];
                            match crate::storage::export_report(selected) {
                                Ok(path) => state.info = format!("Exported: {}", path.display()),
                                Err(e) => state.info = format!("Export failed: {e:#}"),
                            }
                        }
                    }
                    (_, KeyCode::Char('d')) => {
                        if state.tab == 1
                            && !state.history.is_empty()
                            && state.history_selected < state.history.len()
                        {
                            let to_delete = state.history[state.history_selected].clone();
                            if let Err(e) = crate::storage::delete_report(&to_delete) {
                                state.info = format!("Delete failed: {e:#}");
                            } else {
                                state.history.remove(state.history_selected);
                                if state.history_selected >= state.history.len()
                                    && !state.history.is_empty()
                                {
                                    state.history_selected = state.history.len() - 1;
                                }
                                state.info = "Deleted".into();
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn apply_event(state: &mut UiState, ev: JobEvent) {
    match ev {
        JobEvent::Started { job_id } => {
            state.phase = JobPhase::Running;
            state.job_id = Some(job_id);
            state.info = "Upscaling…".into();
        }
        JobEvent::Progress { percent } => {
            state.percent = percent;
        }
        JobEvent::ToolOutput { line } => {
            state.push_log(line);
        }
        JobEvent::Info(info) => {
            state.info = info.to_message();
        }
        JobEvent::JobCompleted { .. } => {
            // Handled by the caller with access to args.
        }
    }
}

fn handle_job_completed(args: &Cli, state: &mut UiState, report: JobReport) {
    let processed =
        orchestrator::process_job_completion(args, state.auto_save, HISTORY_LOAD, &report);
    state.history = processed.history;

    state.phase = JobPhase::Done;
    state.info = match &report.outcome {
        JobOutcome::Finished { output_path } => {
            state.percent = 100;
            format!("Finished: {}", output_path.display())
        }
        JobOutcome::Cancelled => "Cancelled".into(),
        JobOutcome::Failed { message } => format!("Failed: {message}"),
    };
    for msg in processed.messages {
        state.push_log(msg);
    }
    if let Some(p) = processed.auto_saved_path {
        state.push_log(format!("Saved report: {}", p.display()));
    }
    state.last_report = Some(report);
}

/// Copy the last finished output next to the current working directory,
/// named after the input file (the interactive "save output" action).
fn save_output(state: &mut UiState) {
    let Some(report) = state.last_report.as_ref() else {
        state.info = "No completed job to save yet.".into();
        return;
    };
    let JobOutcome::Finished { output_path } = &report.outcome else {
        state.info = "Last job produced no output.".into();
        return;
    };
    let stem = report
        .input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output");
    let ext = output_path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("png");
    let dest = std::path::PathBuf::from(format!("{stem}_upscaled.{ext}"));
    match std::fs::copy(output_path, &dest) {
        Ok(_) => state.info = format!("Saved: {}", dest.display()),
        Err(e) => state.info = format!("Save failed: {e}"),
    }
}

fn draw(area: Rect, f: &mut Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(0)])
        .split(area);

    let tabs = Tabs::new(vec!["Job", "History", "Help"])
        .select(state.tab)
        .highlight_style(Style::default().fg(Color::Cyan));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_job(chunks[1], f, state),
        1 => draw_history(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }
}

fn draw_job(area: Rect, f: &mut Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6),
            Constraint::Length(3),
            Constraint::Min(5),
            Constraint::Length(1),
        ])
        .split(area);

    let phase_label = match state.phase {
        JobPhase::Idle => "idle",
        JobPhase::Running => "running",
        JobPhase::Done => state
            .last_report
            .as_ref()
            .map(|r| r.outcome.label())
            .unwrap_or("done"),
    };
    let status = Paragraph::new(vec![
        kv_line("Input", &state.input_path.display().to_string()),
        kv_line("Model", &state.model_name),
        kv_line("Upscaler", &state.upscaler_bin.display().to_string()),
        kv_line("State", phase_label),
    ])
    .block(Block::default().borders(Borders::ALL).title("Upscale job"));
    f.render_widget(status, rows[0]);

    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Progress"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(u16::from(state.percent))
        .label(format!("{}%", state.percent));
    f.render_widget(gauge, rows[1]);

    // Tail of the tool's output, sized to the visible pane.
    let visible = rows[2].height.saturating_sub(2) as usize;
    let start = state.log.len().saturating_sub(visible);
    let log_lines: Vec<Line> = state.log[start..]
        .iter()
        .map(|l| Line::from(l.as_str()))
        .collect();
    let log = Paragraph::new(log_lines)
        .block(Block::default().borders(Borders::ALL).title("Tool output"));
    f.render_widget(log, rows[2]);

    let footer = Paragraph::new(Line::from(vec![
        Span::styled("r", Style::default().fg(Color::Magenta)),
        Span::raw(" run  "),
        Span::styled("c", Style::default().fg(Color::Magenta)),
        Span::raw(" cancel  "),
        Span::styled("s", Style::default().fg(Color::Magenta)),
        Span::raw(" save  "),
        Span::styled("q", Style::default().fg(Color::Magenta)),
        Span::raw(" quit   "),
        Span::styled(state.info.clone(), Style::default().fg(Color::Gray)),
    ]));
    f.render_widget(footer, rows[3]);
}

fn draw_history(area: Rect, f: &mut Frame, state: &UiState) {
    let mut lines = Vec::new();
    if state.history.is_empty() {
        lines.push(Line::from("No saved jobs yet."));
    }
    for (i, report) in state.history.iter().enumerate() {
        let input = report
            .input_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("?");
        let text = format!(
            "{}  {:9}  {}  {}",
            report.timestamp_utc,
            report.outcome.label(),
            report.model_name,
            input
        );
        let style = if i == state.history_selected {
            Style::default().fg(Color::Black).bg(Color::Cyan)
        } else {
            Style::default()
        };
        lines.push(Line::from(Span::styled(text, style)));
    }
    let p = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title("History (j/k navigate, e export, d delete)"),
    );
    f.render_widget(p, area);
}

fn kv_line(label: &str, value: &str) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{label}: "), Style::default().fg(Color::Gray)),
        Span::raw(value.to_string()),
    ])
}
