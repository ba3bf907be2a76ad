//! The fixed, ordered catalogue of migration steps.
//!
//! Ordinals are strictly monotonic. Everything up to [`StepId::Verify`] runs
//! before the reboot, [`StepId::Reboot`] is the boundary, and the rest run in
//! the continuation after boot.

mod configure;
mod domain;
mod migrate;
mod report;
mod system;

pub use configure::SUDOERS_DROP_IN;
pub use migrate::replace_domain;
pub use system::{BASE_TOOLS, DOMAIN_TOOLS, preconditions};

use std::path::Path;
use std::process::Output;

use crate::config::Config;
use crate::context::MigrationContext;
use crate::error::{MigrationError, StepResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StepId {
    CheckSystem,
    InstallPackages,
    CreateBackupAccount,
    PreflightChecks,
    BackupConfigs,
    DiscoverDcs,
    LeaveOldDomain,
    DiscoverNewDomain,
    JoinNewDomain,
    ConfigureHostname,
    ConfigureNetworkFiles,
    ConfigureAuth,
    RestartServices,
    ConfigurePamNss,
    ConfigureHomeDirCreation,
    Verify,
    Reboot,
    MigrateUserProfiles,
    MigrateNetworkResources,
    MigrateAppConfigs,
    ConfigureSudo,
    GenerateReport,
    Cleanup,
}

/// Every step in execution order.
pub const CATALOGUE: [StepId; 23] = [
    StepId::CheckSystem,
    StepId::InstallPackages,
    StepId::CreateBackupAccount,
    StepId::PreflightChecks,
    StepId::BackupConfigs,
    StepId::DiscoverDcs,
    StepId::LeaveOldDomain,
    StepId::DiscoverNewDomain,
    StepId::JoinNewDomain,
    StepId::ConfigureHostname,
    StepId::ConfigureNetworkFiles,
    StepId::ConfigureAuth,
    StepId::RestartServices,
    StepId::ConfigurePamNss,
    StepId::ConfigureHomeDirCreation,
    StepId::Verify,
    StepId::Reboot,
    StepId::MigrateUserProfiles,
    StepId::MigrateNetworkResources,
    StepId::MigrateAppConfigs,
    StepId::ConfigureSudo,
    StepId::GenerateReport,
    StepId::Cleanup,
];

pub const TOTAL_STEPS: u32 = CATALOGUE.len() as u32;

impl StepId {
    /// 1-based position in [`CATALOGUE`].
    pub fn ordinal(self) -> u32 {
        self as u32 + 1
    }

    pub fn from_ordinal(ordinal: u32) -> Option<Self> {
        CATALOGUE.get(ordinal.checked_sub(1)? as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            StepId::CheckSystem => "CheckSystem",
            StepId::InstallPackages => "InstallPackages",
            StepId::CreateBackupAccount => "CreateBackupAccount",
            StepId::PreflightChecks => "PreflightChecks",
            StepId::BackupConfigs => "BackupConfigs",
            StepId::DiscoverDcs => "DiscoverDCs",
            StepId::LeaveOldDomain => "LeaveOldDomain",
            StepId::DiscoverNewDomain => "DiscoverNewDomain",
            StepId::JoinNewDomain => "JoinNewDomain",
            StepId::ConfigureHostname => "ConfigureHostname",
            StepId::ConfigureNetworkFiles => "ConfigureNetworkFiles",
            StepId::ConfigureAuth => "ConfigureAuth",
            StepId::RestartServices => "RestartServices",
            StepId::ConfigurePamNss => "ConfigurePAMNSS",
            StepId::ConfigureHomeDirCreation => "ConfigureHomeDirCreation",
            StepId::Verify => "Verify",
            StepId::Reboot => "Reboot",
            StepId::MigrateUserProfiles => "MigrateUserProfiles",
            StepId::MigrateNetworkResources => "MigrateNetworkResources",
            StepId::MigrateAppConfigs => "MigrateAppConfigs",
            StepId::ConfigureSudo => "ConfigureSudo",
            StepId::GenerateReport => "GenerateReport",
            StepId::Cleanup => "Cleanup",
        }
    }

    /// A failure here aborts unattended runs whatever the failure policy says.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            StepId::CheckSystem
                | StepId::PreflightChecks
                | StepId::BackupConfigs
                | StepId::JoinNewDomain
                | StepId::ConfigureAuth
                | StepId::Verify
                | StepId::Reboot
                | StepId::Cleanup
        )
    }
}

/// Run the body of `step`. The reboot boundary is driven by the engine.
pub fn execute(step: StepId, ctx: &mut MigrationContext) -> StepResult<()> {
    match step {
        StepId::CheckSystem => system::check_system(ctx),
        StepId::InstallPackages => system::install_packages(ctx),
        StepId::CreateBackupAccount => system::create_backup_account(ctx),
        StepId::PreflightChecks => system::preflight_checks(ctx),
        StepId::BackupConfigs => system::backup_configs(ctx),
        StepId::DiscoverDcs => domain::discover_dcs(ctx),
        StepId::LeaveOldDomain => domain::leave_old_domain(ctx),
        StepId::DiscoverNewDomain => domain::discover_new_domain(ctx),
        StepId::JoinNewDomain => domain::join_new_domain(ctx),
        StepId::ConfigureHostname => configure::configure_hostname(ctx),
        StepId::ConfigureNetworkFiles => configure::configure_network_files(ctx),
        StepId::ConfigureAuth => configure::configure_auth(ctx),
        StepId::RestartServices => system::restart_services(ctx),
        StepId::ConfigurePamNss => configure::configure_pam_nss(ctx),
        StepId::ConfigureHomeDirCreation => configure::configure_home_dir_creation(ctx),
        StepId::Verify => system::verify(ctx),
        StepId::Reboot => Ok(()),
        StepId::MigrateUserProfiles => migrate::migrate_user_profiles(ctx),
        StepId::MigrateNetworkResources => migrate::migrate_network_resources(ctx),
        StepId::MigrateAppConfigs => migrate::migrate_app_configs(ctx),
        StepId::ConfigureSudo => configure::configure_sudo(ctx),
        StepId::GenerateReport => report::generate_report(ctx),
        StepId::Cleanup => report::cleanup(ctx),
    }
}

fn ensure_success(output: &Output, program: &str) -> StepResult<()> {
    if output.status.success() {
        Ok(())
    } else {
        Err(MigrationError::command_failed(program, output.status.code()))
    }
}

/// Verified backup of `path` before it is mutated. Absent files are skipped.
fn protect(ctx: &mut MigrationContext, path: &Path) -> StepResult<()> {
    ctx.backups.backup(path, &mut ctx.exec).map(|_| ())
}

const STANDARD_BIN_DIRS: &[&str] = &[
    "/usr/local/sbin",
    "/usr/local/bin",
    "/usr/sbin",
    "/usr/bin",
    "/sbin",
    "/bin",
];

/// Whether `tool` is an executable file on PATH (resolved under the root).
fn tool_available(config: &Config, tool: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let path_var = std::env::var("PATH").unwrap_or_default();
    path_var
        .split(':')
        .filter(|dir| dir.starts_with('/'))
        .chain(STANDARD_BIN_DIRS.iter().copied())
        .map(|dir| config.path(dir).join(tool))
        .any(|candidate| {
            std::fs::metadata(&candidate)
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}
