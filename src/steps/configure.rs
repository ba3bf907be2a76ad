//! Host configuration rewritten for the new domain.
//!
//! Every file is backed up (and the backup verified) before it is touched.

use std::fs;
use std::path::Path;

use super::{ensure_success, protect};
use crate::context::MigrationContext;
use crate::error::{MigrationError, StepResult};

pub const SUDOERS_DROP_IN: &str = "/etc/sudoers.d/realmshift";
const MKHOMEDIR_LINE: &str = "session optional pam_mkhomedir.so skel=/etc/skel umask=0077";

/// Point the `127.0.1.1` entry at the new FQDN, appending it when absent.
pub fn rewrite_hosts(content: &str, hostname: &str, domain: &str) -> String {
    let entry = format!("127.0.1.1\t{hostname}.{domain} {hostname}");
    let mut replaced = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            if line.split_whitespace().next() == Some("127.0.1.1") {
                replaced = true;
                entry.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        let localhost = lines
            .iter()
            .position(|l| l.split_whitespace().next() == Some("127.0.0.1"));
        match localhost {
            Some(index) => lines.insert(index + 1, entry),
            None => lines.push(entry),
        }
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Add `sss` to the passwd, group and shadow databases.
pub fn ensure_sss(content: &str) -> String {
    let mut seen = Vec::new();
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            let Some((db, sources)) = line.split_once(':') else {
                return line.to_string();
            };
            let db = db.trim();
            if !matches!(db, "passwd" | "group" | "shadow") {
                return line.to_string();
            }
            seen.push(db.to_string());
            if sources.split_whitespace().any(|s| s == "sss") {
                line.to_string()
            } else {
                format!("{db}:{} sss", sources.trim_end())
            }
        })
        .collect();
    for db in ["passwd", "group", "shadow"] {
        if !seen.iter().any(|s| s == db) {
            lines.push(format!("{db}:         files sss"));
        }
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

pub fn krb5_conf(domain: &str) -> String {
    let realm = domain.to_uppercase();
    format!(
        "[libdefaults]\n\
         \x20   default_realm = {realm}\n\
         \x20   dns_lookup_realm = false\n\
         \x20   dns_lookup_kdc = true\n\
         \x20   rdns = false\n\
         \x20   ticket_lifetime = 24h\n\
         \x20   renew_lifetime = 7d\n\
         \x20   forwardable = true\n\
         \n\
         [domain_realm]\n\
         \x20   .{domain} = {realm}\n\
         \x20   {domain} = {realm}\n"
    )
}

pub fn sssd_conf(domain: &str, home_root: &Path) -> String {
    let realm = domain.to_uppercase();
    let home_root = home_root.display();
    format!(
        "[sssd]\n\
         domains = {domain}\n\
         config_file_version = 2\n\
         services = nss, pam\n\
         \n\
         [domain/{domain}]\n\
         ad_domain = {domain}\n\
         krb5_realm = {realm}\n\
         realmd_tags = manages-system joined-with-adcli\n\
         id_provider = ad\n\
         access_provider = ad\n\
         cache_credentials = True\n\
         krb5_store_password_if_offline = True\n\
         ldap_id_mapping = True\n\
         use_fully_qualified_names = True\n\
         default_shell = /bin/bash\n\
         fallback_homedir = {home_root}/%u@%d\n"
    )
}

/// One sudoers rule per group; spaces in group names are escaped.
pub fn sudoers_rules(groups: &[String], domain: &str) -> String {
    let mut out = String::from("# Managed by realmshift\n");
    for group in groups {
        let escaped = group.replace(' ', "\\ ");
        out.push_str(&format!("%{escaped}@{domain} ALL=(ALL:ALL) ALL\n"));
    }
    out
}

pub fn configure_hostname(ctx: &mut MigrationContext) -> StepResult<()> {
    let path = ctx.config.path("/etc/hostname");
    protect(ctx, &path)?;
    let hostname = ctx.hostname.clone();
    let out = ctx
        .exec
        .run_command("hostnamectl", &["set-hostname", &hostname], "set hostname")?;
    ensure_success(&out, "hostnamectl")
}

pub fn configure_network_files(ctx: &mut MigrationContext) -> StepResult<()> {
    let path = ctx.config.path("/etc/hosts");
    protect(ctx, &path)?;
    let current = fs::read_to_string(&path).unwrap_or_default();
    let updated = rewrite_hosts(&current, &ctx.hostname, &ctx.target_domain);
    if updated != current {
        ctx.exec.write_file(&path, &updated, "hosts entry for new FQDN")?;
    }
    Ok(())
}

pub fn configure_auth(ctx: &mut MigrationContext) -> StepResult<()> {
    let krb5 = ctx.config.path("/etc/krb5.conf");
    let sssd = ctx.config.path("/etc/sssd/sssd.conf");
    protect(ctx, &krb5)?;
    protect(ctx, &sssd)?;

    let domain = ctx.target_domain.clone();
    let krb5_content = krb5_conf(&domain);
    let sssd_content = sssd_conf(&domain, &ctx.config.home_root);
    ctx.exec
        .write_file_mode(&krb5, &krb5_content, 0o644, "Kerberos configuration")?;
    ctx.exec
        .write_file_mode(&sssd, &sssd_content, 0o600, "SSSD configuration")?;
    Ok(())
}

pub fn configure_pam_nss(ctx: &mut MigrationContext) -> StepResult<()> {
    let path = ctx.config.path("/etc/nsswitch.conf");
    protect(ctx, &path)?;
    let current = fs::read_to_string(&path).unwrap_or_default();
    let updated = ensure_sss(&current);
    if updated != current {
        ctx.exec
            .write_file(&path, &updated, "add sss to name service switch")?;
    }
    Ok(())
}

pub fn configure_home_dir_creation(ctx: &mut MigrationContext) -> StepResult<()> {
    let out = ctx.exec.run_command(
        "pam-auth-update",
        &["--enable", "mkhomedir"],
        "enable home directory creation",
    )?;
    if out.status.success() {
        return Ok(());
    }

    ctx.warn("pam-auth-update failed; adding pam_mkhomedir to common-session directly");
    let path = ctx.config.path("/etc/pam.d/common-session");
    let current = fs::read_to_string(&path).unwrap_or_default();
    if current.lines().any(|l| l.contains("pam_mkhomedir.so")) {
        return Ok(());
    }
    protect(ctx, &path)?;
    ctx.exec.append_line(&path, MKHOMEDIR_LINE)?;
    Ok(())
}

pub fn configure_sudo(ctx: &mut MigrationContext) -> StepResult<()> {
    if ctx.config.sudo_groups.is_empty() {
        ctx.note("No sudo groups configured");
        return Ok(());
    }
    let path = ctx.config.path(SUDOERS_DROP_IN);
    protect(ctx, &path)?;
    let rules = sudoers_rules(&ctx.config.sudo_groups, &ctx.target_domain);
    ctx.exec
        .write_file_mode(&path, &rules, 0o440, "sudo rules for domain groups")?;

    let path_arg = path.to_string_lossy().into_owned();
    let check = ctx
        .exec
        .run_command("visudo", &["-cf", &path_arg], "validate sudo rules")?;
    if !check.status.success() {
        ctx.exec.remove_file(&path)?;
        return Err(MigrationError::Verification(format!(
            "visudo rejected {}; file removed",
            path.display()
        )));
    }
    Ok(())
}
