//! Verify command implementation.
//!
//! Read-only checklist of a finished migration. Nothing here changes the host.

use anyhow::{Result, bail};
use clap::Args;
use owo_colors::OwoColorize;
use std::fs;
use std::sync::Arc;

use crate::command_runner::{CommandRunner, RealCommandRunner};
use crate::config::Config;
use crate::domain::{DomainService, RealmCli};
use crate::reboot::RebootBridge;
use crate::state::StateStore;

#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// Domain the host should be joined to (default: state file, then krb5.conf)
    #[arg(long, value_name = "FQDN")]
    domain: Option<String>,

    /// Also resolve this domain user through NSS
    #[arg(long, value_name = "USER")]
    user: Option<String>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table")]
    format: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl Check {
    fn new(name: &'static str, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct VerifyReport {
    domain: String,
    passed: bool,
    checks: Vec<Check>,
}

/// `default_realm` from krb5.conf, if set.
pub fn default_realm(krb5_conf: &str) -> Option<String> {
    krb5_conf.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == "default_realm").then(|| value.trim().to_string())
    })
}

/// Whether the `passwd:` line of nsswitch.conf consults sss.
pub fn nsswitch_uses_sss(nsswitch: &str) -> bool {
    nsswitch.lines().any(|line| {
        let line = line.trim();
        line.strip_prefix("passwd:")
            .is_some_and(|sources| sources.split_whitespace().any(|s| s == "sss"))
    })
}

fn resolve_domain(config: &Config, explicit: Option<&str>) -> Option<String> {
    if let Some(domain) = explicit {
        return Some(domain.trim().to_lowercase());
    }
    if let Some(state) = StateStore::new(config.state_file()).load() {
        return Some(state.domain);
    }
    fs::read_to_string(config.path("/etc/krb5.conf"))
        .ok()
        .and_then(|c| default_realm(&c))
        .map(|realm| realm.to_lowercase())
}

fn succeeded(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Option<String> {
    let output = runner.run_output(program, args, &Default::default()).ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn run_checks(
    config: &Config,
    runner: &dyn CommandRunner,
    service: &dyn DomainService,
    domain: &str,
    user: Option<&str>,
) -> Vec<Check> {
    let mut checks = Vec::new();

    let membership = service.list_membership().unwrap_or_default();
    let joined = membership.iter().any(|d| d.eq_ignore_ascii_case(domain));
    checks.push(Check::new(
        "membership",
        joined,
        if membership.is_empty() {
            "not joined to any domain".to_string()
        } else {
            format!("joined: {}", membership.join(", "))
        },
    ));

    let sssd = succeeded(runner, "systemctl", &["is-active", "sssd"]);
    checks.push(Check::new(
        "sssd",
        sssd.is_some(),
        sssd.unwrap_or_else(|| "inactive".to_string()),
    ));

    if let Some(user) = user {
        let principal = if user.contains('@') {
            user.to_string()
        } else {
            format!("{user}@{domain}")
        };
        let id = succeeded(runner, "id", &[principal.as_str()]);
        checks.push(Check::new(
            "user",
            id.is_some(),
            id.unwrap_or_else(|| format!("{principal} does not resolve")),
        ));
    }

    let realm = fs::read_to_string(config.path("/etc/krb5.conf"))
        .ok()
        .and_then(|c| default_realm(&c));
    let expected = domain.to_uppercase();
    checks.push(Check::new(
        "kerberos",
        realm.as_deref() == Some(expected.as_str()),
        realm.unwrap_or_else(|| "no default_realm".to_string()),
    ));

    let fqdn = succeeded(runner, "hostname", &["-f"]);
    let suffix = format!(".{domain}");
    checks.push(Check::new(
        "hostname",
        fqdn.as_deref()
            .is_some_and(|f| f.to_lowercase().ends_with(&suffix)),
        fqdn.unwrap_or_else(|| "hostname -f failed".to_string()),
    ));

    let nss = fs::read_to_string(config.path("/etc/nsswitch.conf")).unwrap_or_default();
    let uses_sss = nsswitch_uses_sss(&nss);
    checks.push(Check::new(
        "nsswitch",
        uses_sss,
        if uses_sss { "passwd uses sss" } else { "passwd does not use sss" },
    ));

    let hook = RebootBridge::new(config).active();
    let state = StateStore::new(config.state_file()).exists();
    let residue = match (&hook, state) {
        (None, false) => "none".to_string(),
        (Some(h), _) => format!("boot hook in {}", h.installed_path.display()),
        (None, true) => "state file present".to_string(),
    };
    checks.push(Check::new("residue", hook.is_none() && !state, residue));

    checks
}

pub fn run(args: VerifyArgs, config: &Config) -> Result<i32> {
    let Some(domain) = resolve_domain(config, args.domain.as_deref()) else {
        bail!("No domain given and none could be found; pass --domain");
    };

    let runner: Arc<dyn CommandRunner> = Arc::new(RealCommandRunner);
    let service = RealmCli::new(runner.clone());
    let checks = run_checks(config, runner.as_ref(), &service, &domain, args.user.as_deref());
    let report = VerifyReport {
        passed: checks.iter().all(|c| c.passed),
        domain,
        checks,
    };

    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{} {}", "realmshift verify".bold(), report.domain);
        println!();
        for check in &report.checks {
            let mark = if check.passed {
                "✓".green().to_string()
            } else {
                "✗".red().to_string()
            };
            println!("  {mark} {:<12} {}", check.name.cyan(), check.detail);
        }
    }

    Ok(if report.passed { 0 } else { 1 })
}
