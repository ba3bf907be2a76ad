//! Final report and cleanup of everything the run left behind.

use chrono::Local;
use std::fmt::Write as _;

use super::CATALOGUE;
use crate::backup::latest_backup;
use crate::context::MigrationContext;
use crate::error::StepResult;
use crate::profiles::read_mappings;
use crate::reboot::RebootBridge;

fn render_report(ctx: &MigrationContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "realmshift migration report");
    let _ = writeln!(out, "generated: {}", Local::now().format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "mode:      {}", ctx.mode);
    let _ = writeln!(out, "hostname:  {}", ctx.hostname);
    let _ = writeln!(
        out,
        "domain:    {} -> {}",
        ctx.old_domain.as_deref().unwrap_or("(none)"),
        ctx.target_domain
    );

    let _ = writeln!(out, "\nsteps:");
    for step in CATALOGUE {
        let failure = ctx
            .continued_failures
            .iter()
            .find(|(name, _)| *name == step.name());
        match failure {
            Some((_, err)) => {
                let _ = writeln!(out, "  {:>2}. {:<26} continued after failure: {err}", step.ordinal(), step.name());
            }
            None => {
                let _ = writeln!(out, "  {:>2}. {}", step.ordinal(), step.name());
            }
        }
    }

    let _ = writeln!(out, "\nbackups:");
    for file in &ctx.config.tracked_files {
        if let Some(backup) = latest_backup(&ctx.config.path(file)) {
            let _ = writeln!(out, "  {} -> {}", file.display(), backup.display());
        }
    }
    for record in ctx.backups.records() {
        if record.backup_path.to_string_lossy().ends_with(".tar.gz") {
            let _ = writeln!(out, "  snapshot {} ({} bytes)", record.backup_path.display(), record.size_bytes);
        }
    }

    let _ = writeln!(out, "\nuser mappings:");
    if ctx.mappings.is_empty() {
        for (old, new, status) in read_mappings(&ctx.config.mapping_file()) {
            let _ = writeln!(out, "  {old} -> {new} [{status}]");
        }
    } else {
        for mapping in &ctx.mappings {
            let _ = writeln!(
                out,
                "  {} -> {} [{}]",
                mapping.old_principal, mapping.new_principal, mapping.status
            );
        }
    }
    out
}

pub fn generate_report(ctx: &mut MigrationContext) -> StepResult<()> {
    let report = render_report(ctx);
    let path = ctx
        .config
        .path(&ctx.config.log_dir)
        .join(format!("migration-report-{}.txt", ctx.backups.stamp()));
    ctx.exec.write_file(&path, &report, "migration report")?;
    ctx.note(format!("Report written to {}", path.display()));
    Ok(())
}

/// Remove the boot hook (verified) and the scratch directory.
pub fn cleanup(ctx: &mut MigrationContext) -> StepResult<()> {
    RebootBridge::new(&ctx.config).remove(&mut ctx.exec)?;
    let scratch = ctx.config.scratch_dir();
    ctx.exec.remove_dir_all(&scratch)?;
    Ok(())
}
