//! Status command implementation.
//!
//! Shows where an interrupted or in-flight migration stands.

use anyhow::Result;
use clap::Args;
use owo_colors::OwoColorize;
use tracing::debug;

use crate::backup::latest_backup_set;
use crate::config::Config;
use crate::reboot::{RebootBridge, describe_hook};
use crate::state::{AutomationLog, StateStore};
use crate::steps::{StepId, TOTAL_STEPS};

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Output format (table, json)
    #[arg(short, long, default_value = "table")]
    format: String,
}

#[derive(Debug, serde::Serialize)]
struct StatusReport {
    migration: Option<MigrationStatus>,
    continuation: Option<ContinuationStatus>,
    automation: Vec<AutomationStatus>,
    latest_backup_set: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct MigrationStatus {
    domain: String,
    hostname: String,
    old_domain: Option<String>,
    mode: String,
    phase: String,
    completed: u32,
    total: u32,
    next_step: Option<String>,
    updated: String,
}

#[derive(Debug, serde::Serialize)]
struct ContinuationStatus {
    method: String,
    path: String,
    command: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct AutomationStatus {
    phase: String,
    details: String,
    timestamp: String,
}

fn gather(config: &Config) -> StatusReport {
    debug!("Gathering status information");
    let migration = StateStore::new(config.state_file())
        .load()
        .map(|state| MigrationStatus {
            next_step: StepId::from_ordinal(state.step + 1).map(|s| s.name().to_string()),
            domain: state.domain,
            hostname: state.hostname,
            old_domain: state.old_domain,
            mode: state.mode.to_string(),
            phase: state.phase.as_str().to_string(),
            completed: state.step,
            total: TOTAL_STEPS,
            updated: state.timestamp.to_rfc3339(),
        });

    let continuation = RebootBridge::new(config)
        .active()
        .map(|handle| ContinuationStatus {
            method: handle.method.as_str().to_string(),
            command: describe_hook(&handle.installed_path),
            path: handle.installed_path.display().to_string(),
        });

    let automation = AutomationLog::new(config.automation_file())
        .entries()
        .into_iter()
        .map(|e| AutomationStatus {
            phase: e.phase,
            details: e.details,
            timestamp: e.timestamp,
        })
        .collect();

    let tracked: Vec<_> = config.tracked_files.iter().map(|p| config.path(p)).collect();

    StatusReport {
        migration,
        continuation,
        automation,
        latest_backup_set: latest_backup_set(&tracked),
    }
}

pub fn run(args: StatusArgs, config: &Config) -> Result<()> {
    let report = gather(config);

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", "realmshift status".bold());
    println!();

    match &report.migration {
        Some(m) => {
            println!("  {:<14} {}", "Domain:".cyan(), m.domain);
            if let Some(old) = &m.old_domain {
                println!("  {:<14} {}", "Leaving:".cyan(), old);
            }
            println!("  {:<14} {}", "Hostname:".cyan(), m.hostname);
            println!("  {:<14} {} ({})", "Mode:".cyan(), m.mode, m.phase);
            let progress = format!("{}/{} steps", m.completed, m.total);
            let next = match &m.next_step {
                Some(name) => format!("{progress}, next: {}", name.yellow()),
                None => progress,
            };
            println!("  {:<14} {}", "Progress:".cyan(), next);
            println!("  {:<14} {}", "Updated:".cyan(), m.updated);
        }
        None => println!("  {:<14} {}", "Migration:".cyan(), "none in progress".dimmed()),
    }

    let hook = match &report.continuation {
        Some(c) => format!("{} ({})", c.method.yellow(), c.path),
        None => "not installed".dimmed().to_string(),
    };
    println!("  {:<14} {}", "Boot hook:".cyan(), hook);
    if let Some(command) = report.continuation.as_ref().and_then(|c| c.command.as_ref()) {
        println!("  {:<14} {}", "", command.dimmed());
    }

    let backups = match &report.latest_backup_set {
        Some(stamp) => stamp.clone(),
        None => "none".dimmed().to_string(),
    };
    println!("  {:<14} {}", "Backups:".cyan(), backups);

    if !report.automation.is_empty() {
        println!();
        println!("{}", "Automation".bold());
        for entry in &report.automation {
            println!("  {:<18} {} {}", entry.phase, entry.timestamp.dimmed(), entry.details);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MigrationState, Mode};
    use tempfile::tempdir;

    #[test]
    fn test_gather_reports_next_step() {
        let root = tempdir().unwrap();
        let config = Config {
            root: root.path().to_path_buf(),
            ..Config::default()
        };
        let mut state = MigrationState::new(Mode::Live, "newco.local", "ws01", Some("oldco.local"));
        state.step = 8;
        StateStore::new(config.state_file()).save(&state).unwrap();

        let report = gather(&config);
        let migration = report.migration.unwrap();
        assert_eq!(migration.completed, 8);
        assert_eq!(migration.next_step.as_deref(), Some(StepId::from_ordinal(9).unwrap().name()));
        assert!(report.continuation.is_none());
    }

    #[test]
    fn test_gather_empty_host() {
        let root = tempdir().unwrap();
        let config = Config {
            root: root.path().to_path_buf(),
            ..Config::default()
        };
        let report = gather(&config);
        assert!(report.migration.is_none());
        assert!(report.automation.is_empty());
        assert!(report.latest_backup_set.is_none());
    }
}
