//! `realmshift automate`: the unattended entry point, also used by the boot hook.

use anyhow::Result;
use clap::Args;
use tracing::{info, warn};

use super::{InputArgs, build_context, require_root, surface_failure};
use crate::config::Config;
use crate::engine::{RunOutcome, StepEngine};
use crate::output::Output;
use crate::reboot::is_post_reboot;
use crate::state::{AutomationLog, AutomationPhase, Mode, StateStore};

#[derive(Debug, Args)]
pub struct AutomateArgs {
    /// Never prompt (set by the boot hook)
    #[arg(long)]
    pub auto: bool,

    /// Simulate the reboot in-process instead of restarting the host
    #[arg(long)]
    pub test: bool,

    /// Seconds to count down before rebooting
    #[arg(long, value_name = "SECS")]
    pub reboot_delay: Option<u64>,

    #[command(flatten)]
    pub input: InputArgs,
}

pub fn run(args: AutomateArgs, config: &Config) -> Result<i32> {
    require_root("automate")?;

    let mode = if args.test { Mode::Test } else { Mode::Live };
    let interactive = !(args.auto || args.test);
    let log = AutomationLog::new(config.automation_file());
    let store = StateStore::new(config.state_file());

    let (phase, details) = if is_post_reboot(&store) {
        (AutomationPhase::PostReboot, "continuing after reboot".to_string())
    } else {
        (AutomationPhase::Started, format!("mode={mode}"))
    };
    record(&log, phase, &details);

    let mut ctx = build_context(config, mode, &args.input, interactive);
    if let Some(delay) = args.reboot_delay {
        ctx.reboot_delay_secs = delay;
    }
    let report = StepEngine::new(&mut ctx).run();

    match &report.outcome {
        RunOutcome::Success => {
            // The state directory is gone by now; keep it that way.
            info!(domain = %ctx.target_domain, "Automated migration complete");
            Output::success(format!("Migration to {} complete", ctx.target_domain));
        }
        RunOutcome::RebootPending => {
            record(
                &log,
                AutomationPhase::RebootScheduled,
                &format!("after step {}", report.last_completed),
            );
        }
        RunOutcome::Failed { step, exit_code } => {
            record(
                &log,
                AutomationPhase::Failed,
                &format!("{step} exit={exit_code}"),
            );
            surface_failure(&report, &ctx);
        }
        RunOutcome::CancelledByUser => {
            record(&log, AutomationPhase::Failed, "cancelled");
            surface_failure(&report, &ctx);
        }
    }
    Ok(report.exit_code())
}

fn record(log: &AutomationLog, phase: AutomationPhase, details: &str) {
    if let Err(err) = log.record(phase, details) {
        warn!(%err, phase = phase.as_str(), "Automation log not written");
    }
}
