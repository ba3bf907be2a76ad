//! `realmshift migrate`: the operator-driven migration and its revert.

use anyhow::{Context, Result};
use clap::{ArgGroup, Args};
use std::fs;
use std::sync::Arc;

use super::{InputArgs, build_context, prompter, require_root, surface_failure};
use crate::backup::{latest_snapshot, restore_snapshot, revert_files};
use crate::command_runner::RealCommandRunner;
use crate::config::Config;
use crate::effects::Executor;
use crate::engine::{RunOutcome, StepEngine};
use crate::events::ConsolePresenter;
use crate::output::Output;
use crate::reboot::RebootBridge;
use crate::state::{Mode, StateStore};

#[derive(Debug, Args)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["technician", "live", "dry_run", "revert"])
))]
pub struct MigrateArgs {
    /// Interactive migration with a full rollback snapshot
    #[arg(long)]
    pub technician: bool,

    /// Interactive migration with per-file backups
    #[arg(long)]
    pub live: bool,

    /// Show every action without changing the system
    #[arg(long)]
    pub dry_run: bool,

    /// Undo a migration from its backups
    #[arg(long)]
    pub revert: bool,

    /// With --revert: restore the newest full rollback snapshot instead of file backups
    #[arg(long, requires = "revert")]
    pub snapshot: bool,

    #[command(flatten)]
    pub input: InputArgs,

    /// Do not prompt; accept defaults
    #[arg(long, short = 'y')]
    pub yes: bool,
}

impl MigrateArgs {
    fn mode(&self) -> Mode {
        if self.technician {
            Mode::Technician
        } else if self.dry_run {
            Mode::DryRun
        } else {
            Mode::Live
        }
    }
}

pub fn run(args: MigrateArgs, config: &Config) -> Result<i32> {
    if args.revert {
        return revert(&args, config);
    }

    let mode = args.mode();
    if !mode.is_dry_run() {
        require_root("migrate")?;
    }

    let mut ctx = build_context(config, mode, &args.input, !args.yes);
    let report = StepEngine::new(&mut ctx).run();
    match &report.outcome {
        RunOutcome::Success => {
            Output::blank();
            if mode.is_dry_run() {
                Output::success("Dry run complete; nothing was changed");
            } else {
                Output::success(format!("Migration to {} complete", ctx.target_domain));
            }
        }
        RunOutcome::RebootPending => {
            Output::info("Rebooting; the migration continues automatically after boot");
        }
        RunOutcome::Failed { .. } | RunOutcome::CancelledByUser => surface_failure(&report, &ctx),
    }
    Ok(report.exit_code())
}

fn revert(args: &MigrateArgs, config: &Config) -> Result<i32> {
    require_root("migrate --revert")?;
    let prompter = prompter(!args.yes, false);

    let what = if args.snapshot {
        "the newest full rollback snapshot"
    } else {
        "the newest backup of each tracked file"
    };
    if !prompter.confirm(&format!("Restore {what} and abandon the migration?"), false)?
        && prompter.is_interactive()
    {
        Output::info("Revert cancelled");
        return Ok(130);
    }

    let mut exec = Executor::new(false, Arc::new(RealCommandRunner), Arc::new(ConsolePresenter));

    if args.snapshot {
        let archive = latest_snapshot(&config.snapshot_dir())
            .context("No rollback snapshot found; try a file-based revert")?;
        let count = restore_snapshot(&archive, &config.root)?;
        Output::success(format!(
            "Restored {count} entries from {}",
            archive.display()
        ));
    } else {
        let tracked: Vec<_> = config.tracked_files.iter().map(|p| config.path(p)).collect();
        let restored = revert_files(&tracked, &mut exec)?;
        if restored.is_empty() {
            Output::warning("No backups found to restore");
        }
        for (original, backup) in &restored {
            Output::list_item(format!("{} <- {}", original.display(), backup.display()));
        }
    }

    RebootBridge::new(config).remove(&mut exec)?;
    StateStore::new(config.state_file()).clear()?;
    let state_dir = config.path(&config.state_dir);
    if state_dir.exists() {
        fs::remove_dir_all(&state_dir)
            .with_context(|| format!("Failed to remove {}", state_dir.display()))?;
    }

    Output::success("Revert complete");
    Output::hint("Reboot now so every service picks up the restored configuration");
    Ok(0)
}
