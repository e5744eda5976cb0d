use crate::cli::Cli;
use crate::model::JobReport;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobPhase {
    Idle,
    Running,
    Done,
}

/// UI state owned by the UI thread only; no cross-thread mutation.
pub(crate) struct UiState {
    pub tab: usize,
    pub phase: JobPhase,
    pub percent: u8,
    pub info: String,
    pub job_id: Option<String>,

    pub input_path: PathBuf,
    pub model_name: String,
    pub upscaler_bin: PathBuf,

    pub log: Vec<String>,
    pub last_report: Option<JobReport>,

    pub history: Vec<JobReport>,
    pub history_selected: usize,

    pub auto_save: bool,
}

impl UiState {
    pub fn new(args: &Cli) -> Self {
        Self {
            tab: 0,
            phase: if args.run_on_launch {
                JobPhase::Running
            } else {
                JobPhase::Idle
            },
            percent: 0,
            info: String::new(),
            job_id: None,
            input_path: args.input.clone(),
            model_name: args.model.clone(),
            upscaler_bin: args.upscaler_bin.clone(),
            log: Vec::new(),
            last_report: None,
            history: Vec::new(),
            history_selected: 0,
            auto_save: args.auto_save,
        }
    }

    pub fn push_log(&mut self, line: String) {
        const MAX: usize = 500;
        self.log.push(line);
        if self.log.len() > MAX {
            let _ = self.log.drain(0..(self.log.len() - MAX));
        }
    }

    pub fn reset_for_new_job(&mut self) {
        self.phase = JobPhase::Running;
        self.percent = 0;
        self.job_id = None;
        self.log.clear();
        self.last_report = None;
        self.info = "Starting…".into();
    }
}
