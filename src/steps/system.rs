//! Host checks, packages, backups, services and the pre-reboot verification.

use std::fs;

use super::{ensure_success, protect, tool_available};
use crate::command_runner::CommandOptions;
use crate::context::MigrationContext;
use crate::error::{MigrationError, StepResult};
use crate::output::Output;

/// Needed before anything else runs.
pub const BASE_TOOLS: &[&str] = &["apt-get", "systemctl", "hostnamectl"];

/// Installed by InstallPackages; required from PreflightChecks on.
pub const DOMAIN_TOOLS: &[&str] = &["realm", "sssctl"];

fn os_release_is_debian_family(content: &str) -> bool {
    content.lines().any(|line| {
        let Some((key, value)) = line.split_once('=') else {
            return false;
        };
        if key != "ID" && key != "ID_LIKE" {
            return false;
        }
        let value = value.trim_matches('"').to_lowercase();
        value
            .split_whitespace()
            .any(|id| id == "debian" || id == "ubuntu")
    })
}

/// Fatal checks made before any state exists.
pub fn preconditions(ctx: &MigrationContext) -> StepResult<()> {
    let os_release = ctx.config.path("/etc/os-release");
    let content = fs::read_to_string(&os_release).map_err(|_| {
        MigrationError::Precondition(format!("cannot read {}", os_release.display()))
    })?;
    if !os_release_is_debian_family(&content) {
        return Err(MigrationError::Precondition(
            "unsupported operating system; Debian or Ubuntu required".to_string(),
        ));
    }

    let missing: Vec<&str> = BASE_TOOLS
        .iter()
        .copied()
        .filter(|tool| !tool_available(&ctx.config, tool))
        .collect();
    if !missing.is_empty() {
        return Err(MigrationError::Precondition(format!(
            "required tools not found on PATH: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

pub fn check_system(ctx: &mut MigrationContext) -> StepResult<()> {
    preconditions(ctx)?;

    if let Ok(out) = ctx.query("uname", &["-r"]) {
        let kernel = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if !kernel.is_empty() {
            ctx.note(format!("Kernel {kernel}"));
        }
    }

    match ctx.domain_service.list_membership() {
        Ok(domains) if domains.is_empty() => ctx.note("Not currently joined to any domain"),
        Ok(domains) => ctx.note(format!("Current membership: {}", domains.join(", "))),
        Err(err) => ctx.warn(format!("Could not query current membership: {err}")),
    }
    match &ctx.old_domain {
        Some(old) => ctx.note(format!("Migrating from {old} to {}", ctx.target_domain)),
        None => ctx.note(format!("Joining {} (no previous domain)", ctx.target_domain)),
    }
    Ok(())
}

pub fn install_packages(ctx: &mut MigrationContext) -> StepResult<()> {
    let options = CommandOptions::with_env("DEBIAN_FRONTEND", "noninteractive");
    let packages = ctx.config.packages.clone();
    let mut args = vec!["install", "-y"];
    args.extend(packages.iter().map(String::as_str));

    let spinner = (!ctx.exec.is_dry_run() && ctx.is_interactive())
        .then(|| Output::spinner(format!("Installing {} packages...", packages.len())));

    let update = ctx
        .exec
        .run_command_with("apt-get", &["update"], &options, "refresh package lists")?;
    if !update.status.success() {
        ctx.warn("apt-get update failed; installing from cached lists");
    }
    let install = ctx
        .exec
        .run_command_with("apt-get", &args, &options, "install domain packages")?;

    if install.status.success() {
        if let Some(spinner) = spinner {
            spinner.finish_success("Packages installed");
        }
    } else {
        if let Some(spinner) = spinner {
            spinner.finish_warning("Package installation incomplete");
        }
        ctx.warn(format!(
            "apt-get install exited with {:?}; continuing with what is installed",
            install.status.code()
        ));
    }
    Ok(())
}

pub fn create_backup_account(ctx: &mut MigrationContext) -> StepResult<()> {
    let name = ctx.config.backup_account.clone();
    let passwd = fs::read_to_string(ctx.config.path("/etc/passwd")).unwrap_or_default();
    if passwd.lines().any(|l| l.split(':').next() == Some(name.as_str())) {
        ctx.note(format!("Local fallback account {name} already exists"));
        return Ok(());
    }

    let out = ctx.exec.run_command(
        "useradd",
        &["-m", "-s", "/bin/bash", "-G", "sudo", &name],
        "create local fallback account",
    )?;
    ensure_success(&out, "useradd")?;

    if ctx.exec.is_dry_run() {
        return Ok(());
    }
    if ctx.is_interactive() {
        let secret = ctx
            .prompter
            .secret(&format!("Password for local account {name}"))?;
        let input = zeroize::Zeroizing::new(format!("{name}:{}\n", secret.expose()).into_bytes());
        drop(secret);
        let out = ctx
            .exec
            .run_command_with_input("chpasswd", &[], &input, "set fallback account password")?;
        ensure_success(&out, "chpasswd")?;
    } else {
        ctx.warn(format!(
            "Local account {name} has no password; set one with `passwd {name}`"
        ));
    }
    Ok(())
}

pub fn preflight_checks(ctx: &mut MigrationContext) -> StepResult<()> {
    let missing: Vec<&str> = DOMAIN_TOOLS
        .iter()
        .copied()
        .filter(|tool| !tool_available(&ctx.config, tool))
        .collect();
    if !missing.is_empty() {
        if ctx.exec.is_dry_run() {
            ctx.warn(format!(
                "{} not installed yet; a live run installs them first",
                missing.join(", ")
            ));
        } else {
            return Err(MigrationError::Precondition(format!(
                "required tools not found on PATH: {}",
                missing.join(", ")
            )));
        }
    }

    let domain = ctx.target_domain.clone();
    match ctx.query("getent", &["hosts", &domain]) {
        Ok(out) if out.status.success() => ctx.note(format!("{domain} resolves")),
        _ => ctx.warn(format!("{domain} does not resolve; check DNS settings")),
    }

    match ctx.query("timedatectl", &["show", "-p", "NTPSynchronized", "--value"]) {
        Ok(out) if String::from_utf8_lossy(&out.stdout).trim() == "yes" => {
            ctx.note("Clock is NTP-synchronised")
        }
        _ => ctx.warn("Clock is not NTP-synchronised; Kerberos needs accurate time"),
    }
    Ok(())
}

pub fn backup_configs(ctx: &mut MigrationContext) -> StepResult<()> {
    let tracked: Vec<_> = ctx
        .config
        .tracked_files
        .iter()
        .map(|p| ctx.config.path(p))
        .collect();
    for path in &tracked {
        protect(ctx, path)?;
    }
    ctx.note(format!(
        "{} configuration file(s) backed up with stamp {}",
        ctx.backups.records().len(),
        ctx.backups.stamp()
    ));

    if ctx.snapshot {
        let root = ctx.config.root.clone();
        let paths = ctx.config.snapshot_paths.clone();
        let snapshot_dir = ctx.config.snapshot_dir();
        let (hostname, domain) = (ctx.hostname.clone(), ctx.target_domain.clone());
        if let Some(record) = ctx.backups.create_snapshot(
            &root,
            &paths,
            &snapshot_dir,
            &hostname,
            &domain,
            &mut ctx.exec,
        )? {
            ctx.note(format!(
                "Rollback snapshot {} ({} bytes)",
                record.backup_path.display(),
                record.size_bytes
            ));
        }
    }
    Ok(())
}

pub fn restart_services(ctx: &mut MigrationContext) -> StepResult<()> {
    let out = ctx
        .exec
        .run_command("systemctl", &["restart", "sssd"], "restart identity daemon")?;
    ensure_success(&out, "systemctl")?;

    let out = ctx.exec.run_command("sss_cache", &["-E"], "flush identity cache")?;
    if !out.status.success() {
        ctx.warn("sss_cache -E failed; stale cache entries may linger");
    }
    Ok(())
}

pub fn verify(ctx: &mut MigrationContext) -> StepResult<()> {
    if ctx.exec.is_dry_run() {
        ctx.note(format!(
            "Would verify membership of {} and that sssd is active",
            ctx.target_domain
        ));
        return Ok(());
    }

    let domain = ctx.target_domain.clone();
    if !ctx.driver().is_member(&domain)? {
        return Err(MigrationError::Verification(format!(
            "host is not a member of {domain}"
        )));
    }
    let active = ctx
        .query("systemctl", &["is-active", "sssd"])
        .map(|out| out.status.success())
        .unwrap_or(false);
    if !active {
        return Err(MigrationError::Verification("sssd is not active".to_string()));
    }
    ctx.note(format!("Member of {domain}; sssd active"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_release_detection() {
        assert!(os_release_is_debian_family("ID=ubuntu\nID_LIKE=debian\n"));
        assert!(os_release_is_debian_family("ID=linuxmint\nID_LIKE=\"ubuntu debian\"\n"));
        assert!(os_release_is_debian_family("ID=debian\n"));
        assert!(!os_release_is_debian_family("ID=fedora\nID_LIKE=\"rhel centos\"\n"));
        assert!(!os_release_is_debian_family("NAME=Debian\n"));
    }
}
