//! Post-reboot migration of profiles and domain references in config files.

use std::fs;
use std::path::PathBuf;

use super::protect;
use crate::context::MigrationContext;
use crate::error::{MigrationError, StepResult};
use crate::profiles::{CONFLICT_NOTE, MigrationStatus, UserProfileRelocator};

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

/// Replace case-insensitive whole-word occurrences of `needle`.
///
/// `dot_is_word` treats `.` as part of a word, so a bare NetBIOS name does
/// not match the first label of some other FQDN.
fn replace_word(haystack: &str, needle: &str, replacement: &str, dot_is_word: bool) -> String {
    if needle.is_empty() {
        return haystack.to_string();
    }
    let boundary = |c: Option<char>| match c {
        None => true,
        Some(c) => !(is_name_char(c) || (dot_is_word && c == '.')),
    };
    let lower = haystack.to_ascii_lowercase();
    let needle_lower = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut cursor = 0;
    while let Some(found) = lower[cursor..].find(&needle_lower) {
        let start = cursor + found;
        let end = start + needle.len();
        let before = haystack[..start].chars().next_back();
        let after = haystack[end..].chars().next();
        out.push_str(&haystack[cursor..start]);
        if boundary(before) && boundary(after) {
            let matched = &haystack[start..end];
            if matched.chars().any(|c| c.is_ascii_lowercase()) {
                out.push_str(&replacement.to_ascii_lowercase());
            } else {
                out.push_str(&replacement.to_ascii_uppercase());
            }
        } else {
            out.push_str(&haystack[start..end]);
        }
        cursor = end;
    }
    out.push_str(&haystack[cursor..]);
    out
}

/// Rewrite the old domain (FQDN or NetBIOS form) to the new one.
pub fn replace_domain(content: &str, old: &str, new: &str) -> String {
    let fqdn = replace_word(content, old, new, false);
    let old_netbios = old.split('.').next().unwrap_or_default();
    let new_netbios = new.split('.').next().unwrap_or_default();
    if old_netbios == old {
        return fqdn;
    }
    replace_word(&fqdn, old_netbios, new_netbios, true)
}

pub fn migrate_user_profiles(ctx: &mut MigrationContext) -> StepResult<()> {
    let Some(old) = ctx.old_domain.clone() else {
        ctx.note("No previous domain recorded; no profiles to migrate");
        return Ok(());
    };
    let stamp = ctx.backups.stamp().to_string();
    let relocator = UserProfileRelocator::new(&ctx.config, &old, &ctx.target_domain, &stamp);
    let mappings = relocator.relocate_all(ctx.prompter.as_ref(), &mut ctx.exec)?;
    let log_path = relocator.log_path().to_path_buf();

    let count = |status: MigrationStatus| mappings.iter().filter(|m| m.status == status).count();
    let (migrated, failed) = (count(MigrationStatus::Migrated), count(MigrationStatus::Failed));
    let conflicts = mappings.iter().filter(|m| m.note == Some(CONFLICT_NOTE)).count();
    ctx.note(format!(
        "Profiles: {migrated} migrated, {} local, {} without account, {conflicts} conflicting, {failed} failed",
        count(MigrationStatus::SkippedLocal),
        count(MigrationStatus::SkippedMissingAccount),
    ));
    if conflicts > 0 {
        ctx.warn(format!(
            "{conflicts} profile(s) already had a home in {}; {CONFLICT_NOTE} (see {})",
            ctx.target_domain,
            log_path.display()
        ));
    }
    ctx.mappings = mappings;

    if failed > 0 {
        return Err(MigrationError::Other(anyhow::anyhow!(
            "{failed} profile(s) failed to migrate; see {}",
            log_path.display()
        )));
    }
    Ok(())
}

fn migrate_domain_references(ctx: &mut MigrationContext, files: Vec<PathBuf>, what: &str) -> StepResult<()> {
    let Some(old) = ctx.old_domain.clone() else {
        ctx.note(format!("No previous domain recorded; {what} left as they are"));
        return Ok(());
    };
    let new = ctx.target_domain.clone();
    let mut changed = 0;
    for file in files {
        let path = ctx.config.path(&file);
        let Ok(current) = fs::read_to_string(&path) else {
            continue;
        };
        let updated = replace_domain(&current, &old, &new);
        if updated == current {
            continue;
        }
        protect(ctx, &path)?;
        ctx.exec
            .write_file(&path, &updated, &format!("point {} at {new}", file.display()))?;
        changed += 1;
    }
    ctx.note(format!("{changed} {what} file(s) updated"));
    Ok(())
}

pub fn migrate_network_resources(ctx: &mut MigrationContext) -> StepResult<()> {
    let files = ctx.config.network_resource_files.clone();
    migrate_domain_references(ctx, files, "network resource")
}

pub fn migrate_app_configs(ctx: &mut MigrationContext) -> StepResult<()> {
    let files = ctx.config.app_config_files.clone();
    migrate_domain_references(ctx, files, "application config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_domain_fqdn_and_netbios() {
        let fstab = "//fs1.oldco.local/share /mnt/share cifs domain=OLDCO,user=bob 0 0\n";
        assert_eq!(
            replace_domain(fstab, "oldco.local", "newco.local"),
            "//fs1.newco.local/share /mnt/share cifs domain=NEWCO,user=bob 0 0\n"
        );
    }

    #[test]
    fn test_replace_domain_respects_word_boundaries() {
        let text = "workgroup = OLDCO\nserver = oldcorp.example\nrealm = OLDCO.LOCAL\n";
        assert_eq!(
            replace_domain(text, "oldco.local", "newco.local"),
            "workgroup = NEWCO\nserver = oldcorp.example\nrealm = NEWCO.LOCAL\n"
        );
    }

    #[test]
    fn test_replace_domain_leaves_unrelated_text() {
        let text = "printer = lab-1\n";
        assert_eq!(replace_domain(text, "oldco.local", "newco.local"), text);
    }
}
