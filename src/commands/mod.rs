//! CLI command implementations.

pub mod automate;
pub mod completions;
pub mod migrate;
pub mod status;
pub mod verify;

use clap::Args;
use is_terminal::IsTerminal;
use std::path::Path;
use std::sync::Arc;

use crate::backup::latest_backup_set;
use crate::command_runner::{CommandRunner, RealCommandRunner};
use crate::config::Config;
use crate::context::{MigrationContext, MigrationInput};
use crate::domain::RealmCli;
use crate::engine::{RunOutcome, RunReport};
use crate::error::MigrationError;
use crate::events::ConsolePresenter;
use crate::output::Output;
use crate::prompt::{NonInteractivePrompter, Prompter, TerminalPrompter};
use crate::state::Mode;

pub const REVERT_COMMAND: &str = "realmshift migrate --revert";

/// Values that are otherwise asked for interactively.
#[derive(Debug, Clone, Default, Args)]
pub struct InputArgs {
    /// Target domain (FQDN)
    #[arg(long, value_name = "FQDN")]
    pub domain: Option<String>,

    /// Short hostname to use in the new domain
    #[arg(long)]
    pub hostname: Option<String>,

    /// Domain being left (detected from current membership if omitted)
    #[arg(long, value_name = "FQDN")]
    pub old_domain: Option<String>,

    /// Administrator account used for the join
    #[arg(long, value_name = "USER")]
    pub admin: Option<String>,

    /// Read the administrator password from the first line of stdin
    #[arg(long)]
    pub password_stdin: bool,
}

impl From<&InputArgs> for MigrationInput {
    fn from(args: &InputArgs) -> Self {
        MigrationInput {
            domain: args.domain.clone(),
            hostname: args.hostname.clone(),
            old_domain: args.old_domain.clone(),
            admin: args.admin.clone(),
        }
    }
}

/// Mutating modes need root.
pub fn require_root(what: &str) -> Result<(), MigrationError> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(MigrationError::Precondition(format!(
            "{what} must be run as root (try sudo)"
        )))
    }
}

pub fn prompter(interactive: bool, password_stdin: bool) -> Box<dyn Prompter> {
    if interactive && !password_stdin && std::io::stdin().is_terminal() {
        Box::new(TerminalPrompter)
    } else {
        Box::new(NonInteractivePrompter::new(password_stdin))
    }
}

/// Wire the real collaborators into a context.
///
/// Ctrl-C is routed to the context's cancel flag from here on.
pub fn build_context(
    config: &Config,
    mode: Mode,
    input: &InputArgs,
    interactive: bool,
) -> MigrationContext {
    let runner: Arc<dyn CommandRunner> = Arc::new(RealCommandRunner);
    let ctx = MigrationContext::new(
        config.clone(),
        mode,
        input.into(),
        runner.clone(),
        Box::new(RealmCli::new(runner)),
        Arc::new(ConsolePresenter),
        prompter(interactive, input.password_stdin),
    );
    ctx.cancel.install_handler();
    ctx
}

/// Tell the operator what happened and what to do next.
pub fn surface_failure(report: &RunReport, ctx: &MigrationContext) {
    Output::blank();
    match &report.outcome {
        RunOutcome::Failed { step, exit_code } => {
            Output::error(format!("Migration failed at {step} (exit code {exit_code})"));
            if let Some(err) = &report.error {
                Output::hint(err);
            }
        }
        RunOutcome::CancelledByUser => Output::warning("Migration cancelled"),
        RunOutcome::Success | RunOutcome::RebootPending => return,
    }

    let completed = report.completed_steps();
    Output::subheader(format!("Completed ({})", completed.len()));
    for step in &completed {
        Output::list_item(format!("{:>2}. {}", step.ordinal(), step.name()));
    }
    let pending = report.pending_steps();
    Output::subheader(format!("Pending ({})", pending.len()));
    for step in &pending {
        Output::list_item(format!("{:>2}. {}", step.ordinal(), step.name()));
    }

    Output::blank();
    Output::kv("Revert with", REVERT_COMMAND);
    let tracked: Vec<_> = ctx
        .config
        .tracked_files
        .iter()
        .map(|p| ctx.config.path(p))
        .collect();
    match latest_backup_set(&tracked) {
        Some(stamp) => Output::kv("Latest backup set", stamp),
        None => Output::kv("Latest backup set", "none"),
    }
    let log = ctx.config.log_file();
    Output::kv("Log", log.display().to_string());

    if ctx.is_interactive() {
        open_log(&log);
        if let Err(err) = ctx.prompter.acknowledge("Press Enter to exit") {
            tracing::debug!(%err, "Acknowledgement prompt failed");
        }
    }
}

/// Best effort: show the log in the operator's pager.
fn open_log(log: &Path) {
    if !log.exists() {
        return;
    }
    let pager = std::env::var("PAGER").unwrap_or_else(|_| "less".to_string());
    let mut parts = shlex::split(&pager).unwrap_or_default().into_iter();
    let Some(program) = parts.next() else {
        return;
    };
    let status = std::process::Command::new(&program)
        .args(parts)
        .arg(log)
        .status();
    if let Err(err) = status {
        tracing::debug!(%err, pager = %program, "Could not open log in pager");
    }
}
