//! Structured events emitted by the step engine.
//!
//! The engine never prints directly. It emits [`StepEvent`]s to a
//! [`Presenter`], which decides how (and whether) to render them.

use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::output::Output;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEvent {
    RunStarted {
        mode: String,
        domain: String,
        resume_from: Option<u32>,
    },
    StepStarted {
        ordinal: u32,
        total: u32,
        name: &'static str,
    },
    /// Already completed in an earlier invocation.
    StepSkipped {
        ordinal: u32,
        name: &'static str,
    },
    StepCompleted {
        ordinal: u32,
        name: &'static str,
    },
    StepFailed {
        ordinal: u32,
        name: &'static str,
        error: String,
    },
    /// A mutating action replaced by a log line in dry-run mode.
    Simulated(String),
    Action(String),
    Warning(String),
    Info(String),
}

pub trait Presenter: Send + Sync {
    fn emit(&self, event: StepEvent);
}

/// Renders events on the terminal and mirrors them into the log.
pub struct ConsolePresenter;

impl Presenter for ConsolePresenter {
    fn emit(&self, event: StepEvent) {
        match event {
            StepEvent::RunStarted {
                mode,
                domain,
                resume_from,
            } => {
                info!(%mode, %domain, ?resume_from, "Migration run started");
                Output::header(format!("realmshift: migrating to {domain} ({mode})"));
                if let Some(step) = resume_from {
                    Output::info(format!("Resuming after step {step}"));
                }
            }
            StepEvent::StepStarted {
                ordinal,
                total,
                name,
            } => {
                info!(step = ordinal, name, "Step started");
                Output::step_banner(ordinal, total, name);
            }
            StepEvent::StepSkipped { ordinal, name } => {
                info!(step = ordinal, name, "Step already completed");
            }
            StepEvent::StepCompleted { ordinal, name } => {
                info!(step = ordinal, name, "Step completed");
                Output::success(name);
            }
            StepEvent::StepFailed {
                ordinal,
                name,
                error: message,
            } => {
                error!(step = ordinal, name, error = %message, "Step failed");
                Output::error(format!("{name}: {message}"));
            }
            StepEvent::Simulated(action) => {
                info!("[DRY-RUN] {}", action);
                Output::dry_run(action);
            }
            StepEvent::Action(action) => {
                info!("{}", action);
                Output::step(action);
            }
            StepEvent::Warning(message) => {
                warn!("{}", message);
                Output::warning(message);
            }
            StepEvent::Info(message) => {
                info!("{}", message);
                Output::info(message);
            }
        }
    }
}

/// Collects events for assertions.
#[derive(Debug, Default)]
pub struct RecordingPresenter {
    events: Mutex<Vec<StepEvent>>,
}

impl RecordingPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StepEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Ordinals of steps that actually started, in order.
    pub fn started_steps(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                StepEvent::StepStarted { ordinal, .. } => Some(ordinal),
                _ => None,
            })
            .collect()
    }

    pub fn simulated(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                StepEvent::Simulated(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                StepEvent::Warning(w) => Some(w),
                _ => None,
            })
            .collect()
    }
}

impl Presenter for RecordingPresenter {
    fn emit(&self, event: StepEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
