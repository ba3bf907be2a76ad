//! CLI argument definitions for realmshift.
//!
//! Kept out of `main.rs` so completion generation can reference these types.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::commands;

#[derive(Debug, Parser)]
#[command(name = "realmshift")]
#[command(about = "Move a Debian/Ubuntu host from one Active Directory domain to another")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (default: /etc/realmshift/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Operate on a filesystem tree other than / (for rehearsals)
    #[arg(long, global = true, hide = true, env = "REALMSHIFT_ROOT")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run or revert a migration
    ///
    /// Exactly one of --technician, --live, --dry-run or --revert is required.
    /// An interrupted migration is offered for resumption on the next run.
    Migrate(commands::migrate::MigrateArgs),

    /// Unattended migration; also the entry point after the reboot
    Automate(commands::automate::AutomateArgs),

    /// Check that the host works in its new domain
    Verify(commands::verify::VerifyArgs),

    /// Show the progress of an in-flight migration
    Status(commands::status::StatusArgs),

    /// Generate shell completions
    Completions(commands::completions::CompletionsArgs),
}
