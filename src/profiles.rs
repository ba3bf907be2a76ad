//! Relocation of domain-account home directories to the new domain.
//!
//! Home directories of domain users are named `<user>@<domain>`. After the
//! join, each one belonging to the old domain moves to `<user>@<newdomain>`
//! and the old path becomes a symlink to the new one.

use anyhow::Result;
use chrono::Utc;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backup::BACKUP_INFIX;
use crate::config::{Config, ConflictPolicy};
use crate::effects::Executor;
use crate::prompt::Prompter;

pub const ACCOUNT_SEPARATOR: char = '@';

/// Any of these inside a home directory marks the account as local.
pub const LOCAL_MARKERS: &[&str] = &[".local-account", ".realmshift-skip"];

/// A home directory whose name carries the account separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub dir_name: String,
    pub user: String,
    pub domain: String,
    pub home: PathBuf,
}

impl Candidate {
    /// `None` for names without the separator: those are local by definition.
    pub fn from_dir(home: PathBuf) -> Option<Self> {
        let dir_name = home.file_name()?.to_str()?.to_string();
        let (user, domain) = dir_name.split_once(ACCOUNT_SEPARATOR)?;
        if user.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self {
            user: user.to_string(),
            domain: domain.to_string(),
            dir_name,
            home,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalReason {
    /// Listed in the local account database.
    AccountDatabase,
    MarkerFile(&'static str),
    /// Suffix is not the domain being migrated away from.
    ForeignSuffix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Domain,
    Local(LocalReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Pending,
    Migrated,
    SkippedLocal,
    SkippedMissingAccount,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Migrated => "migrated",
            MigrationStatus::SkippedLocal => "skipped-local",
            MigrationStatus::SkippedMissingAccount => "skipped-missing-account",
            MigrationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainUserMapping {
    pub old_principal: String,
    pub new_principal: String,
    pub home_dir_target: PathBuf,
    pub status: MigrationStatus,
    /// Why a `pending` entry was not processed.
    pub note: Option<&'static str>,
}

/// Marks a profile whose target already existed and was not merged.
pub const CONFLICT_NOTE: &str = "conflict: left for operator";

impl DomainUserMapping {
    fn to_tsv(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.old_principal,
            self.new_principal,
            self.home_dir_target.display(),
            self.status,
            Utc::now().to_rfc3339(),
            self.note.unwrap_or("-")
        )
    }
}

pub struct UserProfileRelocator<'a> {
    config: &'a Config,
    old_domain: String,
    new_domain: String,
    stamp: String,
    log_path: PathBuf,
}

impl<'a> UserProfileRelocator<'a> {
    pub fn new(config: &'a Config, old_domain: &str, new_domain: &str, stamp: &str) -> Self {
        Self {
            config,
            old_domain: old_domain.to_lowercase(),
            new_domain: new_domain.to_lowercase(),
            stamp: stamp.to_string(),
            log_path: config
                .path(&config.log_dir)
                .join(format!("profile-migration-{stamp}.log")),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn home_root(&self) -> PathBuf {
        self.config.path(&self.config.home_root)
    }

    /// Domain-account candidates under the home root, sorted by name.
    ///
    /// Symlinks are left out: they are old paths already relocated.
    pub fn discover(&self) -> Result<Vec<Candidate>> {
        let root = self.home_root();
        let Ok(entries) = fs::read_dir(&root) else {
            warn!(path = %root.display(), "Home root not readable");
            return Ok(Vec::new());
        };
        let mut candidates: Vec<Candidate> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| Candidate::from_dir(e.path()))
            .collect();
        candidates.sort_by(|a, b| a.dir_name.cmp(&b.dir_name));
        Ok(candidates)
    }

    fn forced(&self, candidate: &Candidate) -> bool {
        self.config
            .force_migrate
            .iter()
            .any(|name| name == &candidate.dir_name || name == &candidate.user)
    }

    fn in_account_database(&self, candidate: &Candidate) -> bool {
        let Ok(passwd) = fs::read_to_string(self.config.path("/etc/passwd")) else {
            return false;
        };
        let system_home = self.config.home_root.join(&candidate.dir_name);
        passwd.lines().any(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            let name = fields.first().copied().unwrap_or_default();
            let home_matches = fields.get(5).map(Path::new) == Some(system_home.as_path());
            // A same-named local user whose comment says so owns the profile.
            let comment_local = name == candidate.user
                && fields
                    .get(4)
                    .map(|gecos| gecos.to_lowercase().contains("local"))
                    .unwrap_or(false);
            name == candidate.dir_name || home_matches || comment_local
        })
    }

    fn suffix_matches(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        let netbios = self.old_domain.split('.').next().unwrap_or_default();
        domain == self.old_domain || (!netbios.is_empty() && domain == netbios)
    }

    /// Any positive local signal excludes the account unless forced.
    pub fn classify(&self, candidate: &Candidate) -> Classification {
        if self.forced(candidate) {
            return Classification::Domain;
        }
        if self.in_account_database(candidate) {
            return Classification::Local(LocalReason::AccountDatabase);
        }
        if let Some(marker) = LOCAL_MARKERS
            .iter()
            .find(|m| candidate.home.join(m).exists())
        {
            return Classification::Local(LocalReason::MarkerFile(*marker));
        }
        if !self.suffix_matches(&candidate.domain) {
            return Classification::Local(LocalReason::ForeignSuffix);
        }
        Classification::Domain
    }

    fn audit(&self, exec: &mut Executor, message: &str) -> Result<()> {
        info!(target: "realmshift::profiles", "{message}");
        exec.append_line(
            &self.log_path,
            &format!("{} {message}", Utc::now().format("%Y-%m-%d %H:%M:%S")),
        )
    }

    fn account_exists(&self, exec: &Executor, principal: &str) -> bool {
        exec.runner()
            .run_output("id", &[principal], &Default::default())
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Move one domain profile to the new domain.
    pub fn migrate(
        &self,
        candidate: &Candidate,
        prompter: &dyn Prompter,
        exec: &mut Executor,
    ) -> Result<DomainUserMapping> {
        let new_principal = format!("{}{}{}", candidate.user, ACCOUNT_SEPARATOR, self.new_domain);
        let target = self.home_root().join(&new_principal);
        let mut mapping = DomainUserMapping {
            old_principal: candidate.dir_name.clone(),
            new_principal: new_principal.clone(),
            home_dir_target: target.clone(),
            status: MigrationStatus::Pending,
            note: None,
        };

        if !self.account_exists(exec, &new_principal) {
            mapping.status = MigrationStatus::SkippedMissingAccount;
            self.audit(exec, &format!("{}: no account {new_principal}; skipped", candidate.dir_name))?;
            return Ok(mapping);
        }

        if target.exists() {
            let merge = if prompter.is_interactive() {
                prompter.confirm(
                    &format!(
                        "{} already exists. Merge {} into it? (No skips this account)",
                        target.display(),
                        candidate.dir_name
                    ),
                    true,
                )?
            } else {
                self.config.conflict_policy == ConflictPolicy::Merge
            };
            if !merge {
                mapping.note = Some(CONFLICT_NOTE);
                self.audit(exec, &format!("{}: {} exists; {CONFLICT_NOTE}", candidate.dir_name, target.display()))?;
                return Ok(mapping);
            }

            let target_backup = backup_sibling(&target, &self.stamp);
            exec.copy_tree(&target, &target_backup)?;
            self.audit(exec, &format!("backed up {} to {}", target.display(), target_backup.display()))?;
            let copied = exec.copy_tree(&candidate.home, &target)?;
            self.audit(exec, &format!("merged {copied} file(s) from {} into {}", candidate.home.display(), target.display()))?;
            let old_backup = backup_sibling(&candidate.home, &self.stamp);
            exec.rename(&candidate.home, &old_backup)?;
            self.audit(exec, &format!("kept original {} as {}", candidate.home.display(), old_backup.display()))?;
        } else {
            exec.rename(&candidate.home, &target)?;
            self.audit(exec, &format!("moved {} to {}", candidate.home.display(), target.display()))?;
        }

        exec.symlink(&target, &candidate.home)?;
        self.audit(exec, &format!("linked {} -> {}", candidate.home.display(), target.display()))?;

        let owner = format!("{new_principal}:");
        let target_arg = target.to_string_lossy();
        let out = exec.run_command("chown", &["-R", &owner, &target_arg], "transfer ownership")?;
        if out.status.success() {
            mapping.status = MigrationStatus::Migrated;
            self.audit(exec, &format!("{}: ownership set to {new_principal}", candidate.dir_name))?;
        } else {
            mapping.status = MigrationStatus::Failed;
            self.audit(exec, &format!("{}: chown to {new_principal} failed", candidate.dir_name))?;
        }
        Ok(mapping)
    }

    /// Discover, classify and migrate every candidate, recording each mapping.
    pub fn relocate_all(
        &self,
        prompter: &dyn Prompter,
        exec: &mut Executor,
    ) -> Result<Vec<DomainUserMapping>> {
        exec.create_dir_all(&self.config.path(&self.config.log_dir))?;
        self.audit(
            exec,
            &format!("profile migration {} -> {}", self.old_domain, self.new_domain),
        )?;

        let mut mappings = Vec::new();
        for candidate in self.discover()? {
            let mapping = match self.classify(&candidate) {
                Classification::Local(reason) => {
                    self.audit(exec, &format!("{}: local account ({reason:?}); untouched", candidate.dir_name))?;
                    DomainUserMapping {
                        old_principal: candidate.dir_name.clone(),
                        new_principal: candidate.dir_name.clone(),
                        home_dir_target: candidate.home.clone(),
                        status: MigrationStatus::SkippedLocal,
                        note: None,
                    }
                }
                Classification::Domain => match self.migrate(&candidate, prompter, exec) {
                    Ok(mapping) => mapping,
                    Err(err) => {
                        warn!(account = %candidate.dir_name, error = %format!("{err:#}"), "Profile migration failed");
                        self.audit(exec, &format!("{}: failed: {err:#}", candidate.dir_name))?;
                        DomainUserMapping {
                            old_principal: candidate.dir_name.clone(),
                            new_principal: format!("{}{}{}", candidate.user, ACCOUNT_SEPARATOR, self.new_domain),
                            home_dir_target: self.home_root().join(format!("{}{}{}", candidate.user, ACCOUNT_SEPARATOR, self.new_domain)),
                            status: MigrationStatus::Failed,
                            note: None,
                        }
                    }
                },
            };
            exec.append_line(&self.config.mapping_file(), &mapping.to_tsv())?;
            mappings.push(mapping);
        }
        Ok(mappings)
    }
}

fn backup_sibling(path: &Path, stamp: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!("{BACKUP_INFIX}{stamp}"));
    PathBuf::from(name)
}

/// Mappings recorded by earlier runs, oldest first.
pub fn read_mappings(path: &Path) -> Vec<(String, String, String)> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            Some((
                fields.next()?.to_string(),
                fields.next()?.to_string(),
                fields.nth(1)?.to_string(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::MockCommandRunner;
    use crate::events::RecordingPresenter;
    use crate::prompt::{Answer, NonInteractivePrompter, ScriptedPrompter};
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    fn setup() -> (TempDir, Config) {
        let root = tempdir().unwrap();
        let config = Config {
            root: root.path().to_path_buf(),
            ..Config::default()
        };
        fs::create_dir_all(config.path("/home")).unwrap();
        fs::create_dir_all(config.path("/etc")).unwrap();
        fs::write(config.path("/etc/passwd"), "root:x:0:0:root:/root:/bin/bash\n").unwrap();
        (root, config)
    }

    fn home(config: &Config, name: &str) -> PathBuf {
        let dir = config.path("/home").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(".bashrc"), format!("# {name}\n")).unwrap();
        dir
    }

    fn exec(dry_run: bool) -> (Executor, Arc<MockCommandRunner>) {
        let runner = Arc::new(MockCommandRunner::new());
        (
            Executor::new(dry_run, runner.clone(), Arc::new(RecordingPresenter::new())),
            runner,
        )
    }

    #[test]
    fn test_discover_only_separator_names() {
        let (_root, config) = setup();
        home(&config, "alice@oldco.local");
        home(&config, "bob");
        home(&config, "carol@oldco.local");
        let relocator = UserProfileRelocator::new(&config, "oldco.local", "newco.local", "s");

        let names: Vec<String> = relocator
            .discover()
            .unwrap()
            .into_iter()
            .map(|c| c.dir_name)
            .collect();
        assert_eq!(names, vec!["alice@oldco.local", "carol@oldco.local"]);
    }

    #[test]
    fn test_classify_signals() {
        let (_root, config) = setup();
        let marked = home(&config, "dave@oldco.local");
        fs::write(marked.join(".local-account"), "").unwrap();
        home(&config, "erin@other.org");
        home(&config, "frank@OLDCO");
        home(&config, "svc@oldco.local");
        fs::write(
            config.path("/etc/passwd"),
            "svc@oldco.local:x:1001:1001:Local service:/home/svc@oldco.local:/bin/sh\n",
        )
        .unwrap();
        let relocator = UserProfileRelocator::new(&config, "oldco.local", "newco.local", "s");
        let by_name = |name: &str| {
            let c = Candidate::from_dir(config.path("/home").join(name)).unwrap();
            relocator.classify(&c)
        };

        assert_eq!(
            by_name("dave@oldco.local"),
            Classification::Local(LocalReason::MarkerFile(".local-account"))
        );
        assert_eq!(
            by_name("erin@other.org"),
            Classification::Local(LocalReason::ForeignSuffix)
        );
        assert_eq!(by_name("frank@OLDCO"), Classification::Domain);
        assert_eq!(
            by_name("svc@oldco.local"),
            Classification::Local(LocalReason::AccountDatabase)
        );
    }

    #[test]
    fn test_force_overrides_local_signal() {
        let (_root, mut config) = setup();
        let marked = home(&config, "dave@oldco.local");
        fs::write(marked.join(".realmshift-skip"), "").unwrap();
        config.force_migrate = vec!["dave".to_string()];
        let relocator = UserProfileRelocator::new(&config, "oldco.local", "newco.local", "s");
        let candidate = Candidate::from_dir(marked).unwrap();
        assert_eq!(relocator.classify(&candidate), Classification::Domain);
    }

    #[test]
    fn test_migrate_moves_links_and_chowns() {
        let (_root, config) = setup();
        let old = home(&config, "alice@oldco.local");
        let relocator = UserProfileRelocator::new(&config, "oldco.local", "newco.local", "s");
        let (mut exec, runner) = exec(false);

        let mappings = relocator
            .relocate_all(&NonInteractivePrompter::new(false), &mut exec)
            .unwrap();

        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].status, MigrationStatus::Migrated);
        assert_eq!(mappings[0].new_principal, "alice@newco.local");
        let target = config.path("/home/alice@newco.local");
        assert!(target.join(".bashrc").exists());
        assert_eq!(fs::read_link(&old).unwrap(), target);
        assert!(runner.was_called("chown", &["-R", "alice@newco.local:"]));

        let recorded = read_mappings(&config.mapping_file());
        assert_eq!(recorded[0].0, "alice@oldco.local");
        assert_eq!(recorded[0].2, "migrated");
        assert!(relocator.log_path().exists());
    }

    #[test]
    fn test_missing_account_is_skipped_untouched() {
        let (_root, config) = setup();
        let old = home(&config, "ghost@oldco.local");
        let relocator = UserProfileRelocator::new(&config, "oldco.local", "newco.local", "s");
        let (mut exec, runner) = exec(false);
        runner.respond("id", &["ghost@newco.local"], 1, "");

        let mappings = relocator
            .relocate_all(&NonInteractivePrompter::new(false), &mut exec)
            .unwrap();
        assert_eq!(mappings[0].status, MigrationStatus::SkippedMissingAccount);
        assert!(old.is_dir());
        assert!(fs::symlink_metadata(&old).unwrap().file_type().is_dir());
    }

    #[test]
    fn test_conflict_merge_backs_up_target_first() {
        let (_root, config) = setup();
        let old = home(&config, "alice@oldco.local");
        fs::write(old.join("notes.txt"), "old notes").unwrap();
        let target = home(&config, "alice@newco.local");
        fs::write(target.join("notes.txt"), "new notes").unwrap();
        let relocator = UserProfileRelocator::new(&config, "oldco.local", "newco.local", "s1");
        let (mut exec, _) = exec(false);
        let prompter = ScriptedPrompter::new([Answer::Confirm(true)]);

        let mappings = relocator.relocate_all(&prompter, &mut exec).unwrap();

        assert_eq!(mappings[0].status, MigrationStatus::Migrated);
        assert_eq!(fs::read_to_string(target.join("notes.txt")).unwrap(), "old notes");
        let target_backup = backup_sibling(&target, "s1");
        assert_eq!(
            fs::read_to_string(target_backup.join("notes.txt")).unwrap(),
            "new notes"
        );
        assert!(backup_sibling(&old, "s1").join("notes.txt").exists());
        assert_eq!(fs::read_link(&old).unwrap(), target);
    }

    #[test]
    fn test_conflict_skip_leaves_both() {
        let (_root, config) = setup();
        let old = home(&config, "alice@oldco.local");
        home(&config, "alice@newco.local");
        let relocator = UserProfileRelocator::new(&config, "oldco.local", "newco.local", "s");
        let (mut exec, _) = exec(false);
        let prompter = ScriptedPrompter::new([Answer::Confirm(false)]);

        let mappings = relocator.relocate_all(&prompter, &mut exec).unwrap();
        let alice = mappings
            .iter()
            .find(|m| m.old_principal == "alice@oldco.local")
            .unwrap();
        assert_eq!(alice.status, MigrationStatus::Pending);
        assert_eq!(alice.note, Some(CONFLICT_NOTE));
        assert!(fs::symlink_metadata(&old).unwrap().file_type().is_dir());

        let recorded = fs::read_to_string(config.mapping_file()).unwrap();
        let line = recorded
            .lines()
            .find(|l| l.starts_with("alice@oldco.local\t"))
            .unwrap();
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields[3], "pending");
        assert_eq!(fields[5], CONFLICT_NOTE);
        let audit = fs::read_to_string(relocator.log_path()).unwrap();
        assert!(
            audit
                .lines()
                .any(|l| l.contains("alice@oldco.local:") && l.contains(CONFLICT_NOTE))
        );
    }

    #[test]
    fn test_unattended_conflict_follows_skip_policy() {
        let (_root, mut config) = setup();
        home(&config, "alice@oldco.local");
        home(&config, "alice@newco.local");
        config.conflict_policy = ConflictPolicy::Skip;
        let relocator = UserProfileRelocator::new(&config, "oldco.local", "newco.local", "s");
        let (mut exec, _) = exec(false);

        let mappings = relocator
            .relocate_all(&NonInteractivePrompter::new(false), &mut exec)
            .unwrap();
        let alice = mappings
            .iter()
            .find(|m| m.old_principal == "alice@oldco.local")
            .unwrap();
        assert_eq!(alice.status, MigrationStatus::Pending);
        assert_eq!(alice.note, Some(CONFLICT_NOTE));
        assert!(config.path("/home/alice@oldco.local").is_dir());
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let (_root, config) = setup();
        let old = home(&config, "alice@oldco.local");
        let relocator = UserProfileRelocator::new(&config, "oldco.local", "newco.local", "s");
        let (mut exec, _) = exec(true);

        relocator
            .relocate_all(&NonInteractivePrompter::new(false), &mut exec)
            .unwrap();
        assert!(fs::symlink_metadata(&old).unwrap().file_type().is_dir());
        assert!(!config.path("/home/alice@newco.local").exists());
        assert!(!config.mapping_file().exists());
    }
}
