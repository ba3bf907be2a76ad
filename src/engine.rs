//! The step engine: runs the catalogue in order against a durable checkpoint.
//!
//! A step runs only if the persisted ordinal is below its own, and the new
//! ordinal is saved before the next step starts. The engine is the single
//! place where a failure becomes continue, abort or cancel.

use chrono::Utc;
use std::fs;
use tracing::{error, info, warn};

use crate::config::FailurePolicy;
use crate::context::MigrationContext;
use crate::error::{ErrorClass, MigrationError};
use crate::events::StepEvent;
use crate::reboot::{self, RebootBridge};
use crate::state::{MigrationState, Phase, StateStore};
use crate::steps::{self, CATALOGUE, StepId, TOTAL_STEPS};

/// Terminal result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failed { step: &'static str, exit_code: i32 },
    CancelledByUser,
    /// The host is rebooting; the boot hook continues the run.
    RebootPending,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Ordinal of the last step whose completion was persisted.
    pub last_completed: u32,
    pub error: Option<String>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        match &self.outcome {
            RunOutcome::Success | RunOutcome::RebootPending => 0,
            RunOutcome::Failed { exit_code, .. } => *exit_code,
            RunOutcome::CancelledByUser => 130,
        }
    }

    pub fn completed_steps(&self) -> Vec<StepId> {
        CATALOGUE
            .iter()
            .copied()
            .filter(|s| s.ordinal() <= self.last_completed)
            .collect()
    }

    pub fn pending_steps(&self) -> Vec<StepId> {
        CATALOGUE
            .iter()
            .copied()
            .filter(|s| s.ordinal() > self.last_completed)
            .collect()
    }
}

enum StepFlow {
    Continue,
    /// The process must exit; the reboot is under way.
    Exit,
    Cancelled,
}

enum Decision {
    Continue,
    Abort,
    Cancel,
}

pub struct StepEngine<'a> {
    ctx: &'a mut MigrationContext,
    store: StateStore,
}

impl<'a> StepEngine<'a> {
    pub fn new(ctx: &'a mut MigrationContext) -> Self {
        let store = StateStore::new(ctx.config.state_file());
        Self { ctx, store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn report(&self, outcome: RunOutcome, last_completed: u32, error: Option<String>) -> RunReport {
        RunReport {
            outcome,
            last_completed,
            error,
        }
    }

    fn fail(&self, step: &'static str, err: &MigrationError, last_completed: u32) -> RunReport {
        error!(step, error = %err, "Migration failed");
        self.report(
            RunOutcome::Failed {
                step,
                exit_code: err.exit_code(),
            },
            last_completed,
            Some(err.to_string()),
        )
    }

    pub fn run(&mut self) -> RunReport {
        let mut state = match self.prepare() {
            Ok(state) => state,
            Err(err) => {
                let last = self.store.load().map(|s| s.step).unwrap_or(0);
                if matches!(err, MigrationError::Cancelled) {
                    return self.report(RunOutcome::CancelledByUser, last, None);
                }
                return self.fail(StepId::CheckSystem.name(), &err, last);
            }
        };

        self.ctx.emit(StepEvent::RunStarted {
            mode: self.ctx.mode.to_string(),
            domain: self.ctx.target_domain.clone(),
            resume_from: (state.step > 0).then_some(state.step + 1),
        });

        for step in CATALOGUE {
            let ordinal = step.ordinal();
            if state.step >= ordinal {
                self.ctx.emit(StepEvent::StepSkipped {
                    ordinal,
                    name: step.name(),
                });
                continue;
            }

            if self.ctx.cancel.take() {
                warn!(step = step.name(), "Interrupted between steps");
                self.ctx.warn(format!(
                    "Interrupted before {}; rerun to resume or `realmshift migrate --revert` to abandon",
                    step.name()
                ));
                return self.report(RunOutcome::CancelledByUser, state.step, None);
            }

            self.ctx.emit(StepEvent::StepStarted {
                ordinal,
                total: TOTAL_STEPS,
                name: step.name(),
            });
            let result = if step == StepId::Reboot {
                self.reboot(&mut state)
            } else {
                steps::execute(step, self.ctx).map(|()| StepFlow::Continue)
            };

            match result {
                Ok(StepFlow::Continue) => {}
                Ok(StepFlow::Exit) => {
                    return self.report(RunOutcome::RebootPending, state.step, None);
                }
                Ok(StepFlow::Cancelled) => {
                    return self.report(RunOutcome::CancelledByUser, state.step, None);
                }
                Err(err) => {
                    self.ctx.emit(StepEvent::StepFailed {
                        ordinal,
                        name: step.name(),
                        error: err.to_string(),
                    });
                    match self.decide(step, &err) {
                        Decision::Continue => {
                            warn!(step = step.name(), error = %err, "Continuing past failed step");
                            self.ctx.continued_failures.push((step.name(), err.to_string()));
                        }
                        Decision::Abort => return self.fail(step.name(), &err, state.step),
                        Decision::Cancel => {
                            return self.report(
                                RunOutcome::CancelledByUser,
                                state.step,
                                Some(err.to_string()),
                            );
                        }
                    }
                }
            }

            state.step = ordinal;
            state.timestamp = Utc::now();
            if let Err(err) = self.store.save(&state) {
                return self.fail(step.name(), &err, ordinal - 1);
            }
            self.ctx.emit(StepEvent::StepCompleted {
                ordinal,
                name: step.name(),
            });
        }

        self.finish();
        info!(domain = %self.ctx.target_domain, "Migration complete");
        self.report(RunOutcome::Success, state.step, None)
    }

    /// Load or create the state this run works from.
    fn prepare(&mut self) -> Result<MigrationState, MigrationError> {
        steps::preconditions(self.ctx)?;

        if let Some(existing) = self.store.load() {
            if existing.mode.is_dry_run() && !self.ctx.mode.is_dry_run() {
                info!("Discarding state left by an interrupted dry run");
                self.store.clear()?;
                return self.start_fresh();
            }
            if !existing.mode.is_dry_run() && self.ctx.mode.is_dry_run() {
                return Err(MigrationError::InvalidArguments(format!(
                    "a {} migration to {} is in progress; finish or revert it first",
                    existing.mode, existing.domain
                )));
            }
            match existing.phase {
                Phase::PostReboot => {
                    let resumed = reboot::detect_continuation(
                        &self.store,
                        self.ctx.config.settle_delay(),
                        self.ctx.presenter.as_ref(),
                    )?;
                    if let Some(state) = resumed {
                        self.adopt(&state);
                        return Ok(state);
                    }
                }
                Phase::Complete => self.store.clear()?,
                Phase::InProgress | Phase::Resumed => {
                    let question = format!(
                        "A migration to {} stopped after step {}/{}. Resume from step {}?",
                        existing.domain,
                        existing.step,
                        TOTAL_STEPS,
                        existing.step + 1
                    );
                    if self.ctx.prompter.confirm(&question, true)? {
                        self.adopt(&existing);
                        return Ok(existing);
                    }
                    info!("Resume declined; starting over");
                    self.store.clear()?;
                }
            }
        }

        self.start_fresh()
    }

    fn start_fresh(&mut self) -> Result<MigrationState, MigrationError> {
        self.ctx.collect_input()?;
        let state = self.ctx.state();
        self.store.save(&state)?;
        Ok(state)
    }

    fn adopt(&mut self, state: &MigrationState) {
        info!(step = state.step, domain = %state.domain, "Resuming migration");
        self.ctx.adopt(state);
        self.ctx.mode = state.mode;
    }

    fn decide(&self, step: StepId, err: &MigrationError) -> Decision {
        match err.class() {
            ErrorClass::Cancelled => return Decision::Cancel,
            ErrorClass::Persistence | ErrorClass::Precondition => return Decision::Abort,
            ErrorClass::Recoverable | ErrorClass::Verification => {}
        }

        if self.ctx.is_interactive() {
            let question = format!("{} failed: {err}. Continue anyway?", step.name());
            return match self.ctx.prompter.confirm(&question, false) {
                Ok(true) => Decision::Continue,
                Ok(false) => Decision::Abort,
                Err(_) => Decision::Cancel,
            };
        }

        // Unattended runs never take a failed check on trust.
        if step.is_critical() || err.class() == ErrorClass::Verification {
            return Decision::Abort;
        }
        match self.ctx.config.failure_policy {
            FailurePolicy::Continue => Decision::Continue,
            FailurePolicy::Abort => Decision::Abort,
        }
    }

    /// Arm the boot hook, checkpoint the sentinel, then reboot or simulate it.
    fn reboot(&mut self, state: &mut MigrationState) -> Result<StepFlow, MigrationError> {
        let bridge = RebootBridge::new(&self.ctx.config);
        let handle = bridge.install(&mut self.ctx.exec)?;

        state.step = StepId::Reboot.ordinal();
        state.timestamp = Utc::now();
        if self.ctx.exec.is_dry_run() {
            self.ctx.exec.run_command("systemctl", &["reboot"], "reboot")?;
            self.ctx.note("Reboot simulated; continuing in-process");
            return Ok(StepFlow::Continue);
        }
        reboot::mark_post_reboot(&self.store, state)?;
        info!(method = handle.method.as_str(), path = %handle.installed_path.display(), "Continuation armed");

        if !self.ctx.mode.reboots() {
            self.ctx.note("Reboot simulated; continuing in-process");
            if let Some(resumed) = reboot::detect_continuation(
                &self.store,
                self.ctx.config.settle_delay(),
                self.ctx.presenter.as_ref(),
            )? {
                *state = resumed;
            }
            return Ok(StepFlow::Continue);
        }

        if !reboot::countdown(
            self.ctx.reboot_delay_secs,
            self.ctx.presenter.as_ref(),
            &self.ctx.cancel,
        ) {
            self.ctx.warn(
                "Reboot cancelled. The continuation stays armed: reboot to finish, \
                 or run `realmshift migrate --revert` to abandon",
            );
            return Ok(StepFlow::Cancelled);
        }
        let out = self.ctx.exec.run_command("systemctl", &["reboot"], "reboot")?;
        if !out.status.success() {
            return Err(MigrationError::command_failed("systemctl", out.status.code()));
        }
        Ok(StepFlow::Exit)
    }

    /// Nothing of the run's own bookkeeping survives success.
    fn finish(&mut self) {
        if let Err(err) = self.store.clear() {
            warn!(%err, "State file not removed");
        }
        let state_dir = self.ctx.config.path(&self.ctx.config.state_dir);
        match fs::remove_dir_all(&state_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(%err, path = %state_dir.display(), "State directory not removed"),
        }
    }
}
