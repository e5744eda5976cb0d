//! Application-level orchestration utilities.
//!
//! This module owns job lifecycle control (start/cancel/quit) and post-run
//! processing such as auto-save, save-as copies, and history refresh. UI/CLI
//! layers call into this module to keep responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::{run_controller, UiCommand};
pub(crate) use post_process::process_job_completion;
