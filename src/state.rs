//! Durable migration state.
//!
//! The state file is the resumability anchor: a single delimited line
//! `step|mode|domain|hostname|old_domain|phase|timestamp` that survives process
//! exit and reboot. Anything that does not parse is treated as absent.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::MigrationError;

/// How a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Interactive, with the full rollback snapshot.
    Technician,
    /// Interactive, file backups only.
    Live,
    /// Every mutation replaced by a log line.
    DryRun,
    /// Non-interactive live run that simulates the reboot.
    Test,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Technician => "technician",
            Mode::Live => "live",
            Mode::DryRun => "dry-run",
            Mode::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "technician" => Some(Mode::Technician),
            "live" => Some(Mode::Live),
            "dry-run" | "dryrun" => Some(Mode::DryRun),
            "test" => Some(Mode::Test),
            _ => None,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, Mode::DryRun)
    }

    /// Whether the reboot is performed for real.
    pub fn reboots(&self) -> bool {
        matches!(self, Mode::Technician | Mode::Live)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the run is relative to the reboot boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InProgress,
    /// Sentinel written right before rebooting.
    PostReboot,
    /// The post-reboot run has picked up the sentinel.
    Resumed,
    Complete,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::InProgress => "in-progress",
            Phase::PostReboot => "post-reboot",
            Phase::Resumed => "resumed",
            Phase::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in-progress" => Some(Phase::InProgress),
            "post-reboot" | "POST_REBOOT" => Some(Phase::PostReboot),
            "resumed" => Some(Phase::Resumed),
            "complete" | "COMPLETE" => Some(Phase::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationState {
    /// Ordinal of the last completed step; 0 before any step ran.
    pub step: u32,
    pub mode: Mode,
    pub domain: String,
    pub hostname: String,
    pub old_domain: Option<String>,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
}

impl MigrationState {
    pub fn new(mode: Mode, domain: &str, hostname: &str, old_domain: Option<&str>) -> Self {
        Self {
            step: 0,
            mode,
            domain: domain.to_string(),
            hostname: hostname.to_string(),
            old_domain: old_domain.map(str::to_string),
            phase: Phase::InProgress,
            timestamp: Utc::now(),
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.step,
            self.mode.as_str(),
            self.domain,
            self.hostname,
            self.old_domain.as_deref().unwrap_or(""),
            self.phase.as_str(),
            self.timestamp.to_rfc3339()
        )
    }

    /// Parse a state line. Returns `None` for anything unrecognized.
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.trim().split('|').map(strip_field_name).collect();
        let (step, mode, domain, hostname) = match fields.as_slice() {
            [step, mode, domain, hostname, ..] => (*step, *mode, *domain, *hostname),
            _ => return None,
        };
        if fields.len() != 4 && fields.len() != 7 {
            return None;
        }

        let step = step.parse::<u32>().ok()?;
        let mode = Mode::parse(mode)?;
        if !valid_domain(domain) || !valid_hostname(hostname) {
            return None;
        }

        let mut state = MigrationState {
            step,
            mode,
            domain: domain.to_string(),
            hostname: hostname.to_string(),
            old_domain: None,
            phase: Phase::InProgress,
            timestamp: Utc::now(),
        };

        if fields.len() == 7 {
            let old_domain = fields[4];
            if !old_domain.is_empty() {
                if !valid_domain(old_domain) {
                    return None;
                }
                state.old_domain = Some(old_domain.to_string());
            }
            state.phase = Phase::parse(fields[5])?;
            state.timestamp = DateTime::parse_from_rfc3339(fields[6])
                .ok()?
                .with_timezone(&Utc);
        }

        Some(state)
    }
}

fn strip_field_name(field: &str) -> &str {
    let field = field.trim();
    match field.split_once('=') {
        Some((name, value))
            if !name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase() || c == '_') =>
        {
            value
        }
        _ => field,
    }
}

/// A plausible DNS name: non-empty dot-separated labels of `[A-Za-z0-9-]`.
pub fn valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
        })
}

/// A short (single-label) hostname.
pub fn valid_hostname(hostname: &str) -> bool {
    !hostname.contains('.') && valid_domain(hostname) && hostname.len() <= 63
}

/// Reads and writes the state file.
///
/// Writes go through a sibling temporary file and `rename`, so a crash never
/// leaves a half-written line behind.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted state. Missing or corrupt files yield `None`.
    pub fn load(&self) -> Option<MigrationState> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) => {
                debug!(path = %self.path.display(), %err, "No readable state file");
                return None;
            }
        };
        let state = content
            .lines()
            .find(|l| !l.trim().is_empty())
            .and_then(MigrationState::parse);
        if state.is_none() {
            warn!(path = %self.path.display(), "Ignoring unrecognized state file");
        }
        state
    }

    pub fn save(&self, state: &MigrationState) -> Result<(), MigrationError> {
        self.write_line(&state.to_line()).map_err(|err| {
            MigrationError::Persistence(format!("{}: {:#}", self.path.display(), err))
        })
    }

    fn write_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, format!("{line}\n"))
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn clear(&self) -> Result<(), MigrationError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MigrationError::Persistence(format!(
                "cannot remove {}: {}",
                self.path.display(),
                err
            ))),
        }
    }
}

/// Coarse progress markers written by `realmshift automate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomationPhase {
    Started,
    RebootScheduled,
    PostReboot,
    Failed,
}

impl AutomationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutomationPhase::Started => "started",
            AutomationPhase::RebootScheduled => "reboot-scheduled",
            AutomationPhase::PostReboot => "post-reboot",
            AutomationPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomationEntry {
    pub phase: String,
    pub details: String,
    pub timestamp: String,
}

/// Append-only `phase|details|timestamp` record.
pub struct AutomationLog {
    path: PathBuf,
}

impl AutomationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn record(&self, phase: AutomationPhase, details: &str) -> Result<()> {
        use std::io::Write;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let details = details.replace(['|', '\n'], " ");
        writeln!(
            file,
            "{}|{}|{}",
            phase.as_str(),
            details,
            Utc::now().to_rfc3339()
        )?;
        Ok(())
    }

    pub fn entries(&self) -> Vec<AutomationEntry> {
        let Ok(content) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(3, '|');
                Some(AutomationEntry {
                    phase: parts.next()?.to_string(),
                    details: parts.next()?.to_string(),
                    timestamp: parts.next()?.to_string(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_legacy_four_fields() {
        let state = MigrationState::parse("9|live|newco.local|ws01").unwrap();
        assert_eq!(state.step, 9);
        assert_eq!(state.mode, Mode::Live);
        assert_eq!(state.domain, "newco.local");
        assert_eq!(state.hostname, "ws01");
        assert_eq!(state.phase, Phase::InProgress);
        assert!(state.old_domain.is_none());
    }

    #[test]
    fn test_parse_named_fields() {
        let state =
            MigrationState::parse("step=9|mode=live|domain=newco.local|hostname=ws01").unwrap();
        assert_eq!(state.step, 9);
        assert_eq!(state.hostname, "ws01");
    }

    #[test]
    fn test_full_line_roundtrip() {
        let mut state = MigrationState::new(Mode::Technician, "newco.local", "ws01", Some("oldco.local"));
        state.step = 17;
        state.phase = Phase::PostReboot;
        let parsed = MigrationState::parse(&state.to_line()).unwrap();
        assert_eq!(parsed.step, 17);
        assert_eq!(parsed.phase, Phase::PostReboot);
        assert_eq!(parsed.old_domain.as_deref(), Some("oldco.local"));
        assert_eq!(parsed.timestamp.timestamp(), state.timestamp.timestamp());
    }

    #[test]
    fn test_corrupt_lines_are_absent() {
        for line in [
            "",
            "garbage",
            "x|live|newco.local|ws01",
            "9|bogus|newco.local|ws01",
            "9|live|new co|ws01",
            "9|live|newco.local|ws01.newco.local",
            "9|live|newco.local|ws01|extra",
            "9|live|newco.local|ws01||nope|2024-01-01T00:00:00Z",
            "-1|live|newco.local|ws01",
        ] {
            assert!(MigrationState::parse(line).is_none(), "accepted {line:?}");
        }
    }

    #[test]
    fn test_store_save_load_clear() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested/state"));
        assert!(store.load().is_none());

        let mut state = MigrationState::new(Mode::Live, "newco.local", "ws01", None);
        state.step = 4;
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap().step, 4);
        assert!(!dir.path().join("nested/state.tmp").exists());

        store.clear().unwrap();
        assert!(!store.exists());
        store.clear().unwrap();
    }

    #[test]
    fn test_store_treats_corrupt_file_as_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state");
        std::fs::write(&path, "\u{0}\u{1}not a state file").unwrap();
        assert!(StateStore::new(&path).load().is_none());
    }

    #[test]
    fn test_automation_log_appends() {
        let dir = tempdir().unwrap();
        let log = AutomationLog::new(dir.path().join("automation"));
        log.record(AutomationPhase::Started, "newco.local|ws01").unwrap();
        log.record(AutomationPhase::RebootScheduled, "step 17").unwrap();

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].phase, "started");
        assert_eq!(entries[0].details, "newco.local ws01");
        assert_eq!(entries[1].phase, "reboot-scheduled");
    }
}
