//! Leaving the old domain and joining the new one.

use crate::context::MigrationContext;
use crate::domain::{Credentials, DomainTransitionDriver, JoinOutcome};
use crate::error::{MigrationError, StepResult};
use crate::prompt::Secret;

/// Controller host names from `host -t SRV` output.
fn parse_srv_targets(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.contains("has SRV record"))
        .filter_map(|line| line.split_whitespace().last())
        .map(|target| target.trim_end_matches('.').to_string())
        .collect()
}

pub fn discover_dcs(ctx: &mut MigrationContext) -> StepResult<()> {
    let record = format!("_ldap._tcp.dc._msdcs.{}", ctx.target_domain);
    let controllers = match ctx.query("host", &["-t", "SRV", &record]) {
        Ok(out) if out.status.success() => parse_srv_targets(&String::from_utf8_lossy(&out.stdout)),
        _ => Vec::new(),
    };
    if controllers.is_empty() {
        ctx.warn(format!("No domain controllers found via {record}"));
    } else {
        ctx.note(format!("Domain controllers: {}", controllers.join(", ")));
    }
    Ok(())
}

pub fn leave_old_domain(ctx: &mut MigrationContext) -> StepResult<()> {
    let Some(old) = ctx.old_domain.clone() else {
        ctx.note("No previous domain to leave");
        return Ok(());
    };
    let driver = DomainTransitionDriver::new(
        ctx.domain_service.as_ref(),
        ctx.presenter.clone(),
        ctx.config.join_settle(),
    );
    if driver.leave(&old, &mut ctx.exec) {
        ctx.note(format!("Left {old}"));
    }

    let out = ctx.exec.run_command(
        "sssctl",
        &["cache-remove", "-o", "--stop", "--start"],
        "clear identity cache",
    )?;
    if !out.status.success() {
        ctx.warn("sssctl cache-remove failed; old cache entries may linger");
    }
    Ok(())
}

pub fn discover_new_domain(ctx: &mut MigrationContext) -> StepResult<()> {
    let domain = ctx.target_domain.clone();
    if let Some(info) = ctx.driver().discover(&domain) {
        let software = info.server_software.unwrap_or_else(|| "unknown".to_string());
        ctx.note(format!("{} ({software})", info.domain_name));
    }
    Ok(())
}

pub fn join_new_domain(ctx: &mut MigrationContext) -> StepResult<()> {
    let domain = ctx.target_domain.clone();
    if !ctx.exec.is_dry_run() && ctx.driver().is_member(&domain).unwrap_or(false) {
        ctx.note(format!("Already joined to {domain}"));
        return Ok(());
    }
    let principal = ctx.admin_principal()?;
    let password = if ctx.exec.is_dry_run() {
        Secret::new(String::new())
    } else {
        let secret = ctx
            .prompter
            .secret(&format!("Password for {principal}@{}", domain.to_uppercase()))?;
        if secret.is_empty() {
            return Err(MigrationError::InvalidArguments(
                "an administrator password is required to join".to_string(),
            ));
        }
        secret
    };
    let fallback_ou = ctx.config.computer_ou_for(&domain);

    let driver = DomainTransitionDriver::new(
        ctx.domain_service.as_ref(),
        ctx.presenter.clone(),
        ctx.config.join_settle(),
    );
    let outcome = driver.join(
        &domain,
        Credentials {
            principal,
            password,
        },
        &fallback_ou,
        &mut ctx.exec,
    )?;
    match outcome {
        JoinOutcome::Joined { used_fallback: true } => {
            ctx.note(format!("Joined {domain} using computer OU {fallback_ou}"))
        }
        JoinOutcome::Joined { .. } => ctx.note(format!("Joined {domain}")),
        JoinOutcome::AlreadyMember => ctx.note(format!("Already joined to {domain}")),
        JoinOutcome::Simulated => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_srv_targets() {
        let output = "\
_ldap._tcp.dc._msdcs.newco.local has SRV record 0 100 389 dc1.newco.local.
_ldap._tcp.dc._msdcs.newco.local has SRV record 0 100 389 dc2.newco.local.
";
        assert_eq!(
            parse_srv_targets(output),
            vec!["dc1.newco.local", "dc2.newco.local"]
        );
        assert!(parse_srv_targets("Host not found: 3(NXDOMAIN)").is_empty());
    }
}
