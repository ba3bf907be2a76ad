//! Reboot persistence: the boot hook that resumes the migration after restart.
//!
//! `NONE -> INSTALLED -> (reboot) -> DETECTED -> REMOVED`
//!
//! The hook is one line in `/etc/rc.local`, a oneshot systemd unit, or a
//! legacy init script, whichever the host supports first. Every artifact
//! carries [`MARKER`] so removal can find it again without trusting any
//! other record. Whether a run is a continuation is decided only by the
//! persisted state phase.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{BootMethod, Config};
use crate::effects::Executor;
use crate::error::MigrationError;
use crate::events::{Presenter, StepEvent};
use crate::state::{MigrationState, Phase, StateStore};

/// Identifies every line or file the hook installs.
pub const MARKER: &str = "realmshift-continuation";
pub const UNIT_NAME: &str = "realmshift-continue.service";
pub const INIT_NAME: &str = "realmshift-continue";
const CREATED_HEADER: &str = "# realmshift-continuation: created by realmshift";

/// A cancellation request owned by one run.
///
/// Ctrl-C sets it; the engine consumes it between steps and the reboot
/// countdown polls it every tick.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route Ctrl-C to this flag instead of killing the process mid-step.
    pub fn install_handler(&self) {
        let flag = self.clone();
        if let Err(err) = ctrlc::set_handler(move || flag.request()) {
            debug!(%err, "Interrupt handler not installed");
        }
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consume a pending request.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Count down `seconds`, one tick per second. Returns false if cancelled.
pub fn countdown(seconds: u64, presenter: &dyn Presenter, cancel: &CancelFlag) -> bool {
    for remaining in (1..=seconds).rev() {
        if cancel.take() {
            return false;
        }
        presenter.emit(StepEvent::Info(format!(
            "Rebooting in {remaining}s (Ctrl-C to cancel)"
        )));
        std::thread::sleep(Duration::from_secs(1));
    }
    !cancel.take()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootPersistenceHandle {
    pub method: BootMethod,
    pub installed_path: PathBuf,
    /// The file did not exist before install and is deleted on removal.
    pub created: bool,
}

impl RebootPersistenceHandle {
    fn to_line(&self) -> String {
        format!(
            "{}|{}|{}",
            self.method.as_str(),
            self.installed_path.display(),
            self.created
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().split('|');
        let method = BootMethod::parse(parts.next()?)?;
        let installed_path = PathBuf::from(parts.next()?);
        let created = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            method,
            installed_path,
            created,
        })
    }
}

/// True iff the persisted state carries the post-reboot sentinel.
pub fn is_post_reboot(store: &StateStore) -> bool {
    store
        .load()
        .map(|s| s.phase == Phase::PostReboot)
        .unwrap_or(false)
}

/// Write the post-reboot sentinel into `state`.
pub fn mark_post_reboot(store: &StateStore, state: &mut MigrationState) -> Result<(), MigrationError> {
    state.phase = Phase::PostReboot;
    store.save(state)
}

/// Consume the sentinel: wait for services to settle, then record the resume.
pub fn detect_continuation(
    store: &StateStore,
    settle: Duration,
    presenter: &dyn Presenter,
) -> Result<Option<MigrationState>, MigrationError> {
    let Some(mut state) = store.load() else {
        return Ok(None);
    };
    if state.phase != Phase::PostReboot {
        return Ok(None);
    }
    presenter.emit(StepEvent::Info(format!(
        "Post-reboot continuation detected; waiting {}s for services to settle",
        settle.as_secs()
    )));
    if !settle.is_zero() {
        std::thread::sleep(settle);
    }
    state.phase = Phase::Resumed;
    store.save(&state)?;
    Ok(Some(state))
}

pub struct RebootBridge<'a> {
    config: &'a Config,
}

impl<'a> RebootBridge<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    fn boot_script(&self) -> PathBuf {
        self.config.path("/etc/rc.local")
    }

    fn unit_path(&self) -> PathBuf {
        self.config.path("/etc/systemd/system").join(UNIT_NAME)
    }

    fn init_path(&self) -> PathBuf {
        self.config.path("/etc/init.d").join(INIT_NAME)
    }

    fn path_for(&self, method: BootMethod) -> PathBuf {
        match method {
            BootMethod::BootScript => self.boot_script(),
            BootMethod::ServiceUnit => self.unit_path(),
            BootMethod::InitScript => self.init_path(),
        }
    }

    fn invocation(&self) -> String {
        let binary = self.config.binary_path();
        let binary = binary.to_string_lossy();
        let quoted = shlex::try_quote(&binary)
            .map(|q| q.into_owned())
            .unwrap_or_else(|_| binary.to_string());
        format!("{quoted} automate --auto")
    }

    /// Whether this host can run `method` at boot.
    pub fn supports(&self, method: BootMethod) -> bool {
        match method {
            BootMethod::BootScript => {
                let script = self.boot_script();
                if script.exists() {
                    return fs::metadata(&script)
                        .map(|m| m.permissions().mode() & 0o111 != 0)
                        .unwrap_or(false);
                }
                [
                    "/lib/systemd/system/rc-local.service",
                    "/usr/lib/systemd/system/rc-local.service",
                    "/etc/systemd/system/rc-local.service",
                ]
                .iter()
                .any(|p| self.config.path(p).exists())
            }
            BootMethod::ServiceUnit => self.config.path("/etc/systemd/system").is_dir(),
            BootMethod::InitScript => self.config.path("/etc/init.d").is_dir(),
        }
    }

    /// Every place a hook artifact is currently present.
    pub fn scan(&self) -> Vec<(BootMethod, PathBuf)> {
        [
            BootMethod::BootScript,
            BootMethod::ServiceUnit,
            BootMethod::InitScript,
        ]
        .into_iter()
        .filter_map(|method| {
            let path = self.path_for(method);
            fs::read_to_string(&path)
                .ok()
                .filter(|content| content.contains(MARKER))
                .map(|_| (method, path))
        })
        .collect()
    }

    fn load_handle(&self) -> Option<RebootPersistenceHandle> {
        fs::read_to_string(self.config.hook_file())
            .ok()
            .and_then(|c| RebootPersistenceHandle::parse(&c))
    }

    /// The active hook, if any.
    pub fn active(&self) -> Option<RebootPersistenceHandle> {
        let found = self.scan();
        if let Some(handle) = self.load_handle() {
            if found.iter().any(|(m, _)| *m == handle.method) {
                return Some(handle);
            }
        }
        found.into_iter().next().map(|(method, installed_path)| {
            let created = method != BootMethod::BootScript
                || fs::read_to_string(&installed_path)
                    .map(|c| c.contains(CREATED_HEADER))
                    .unwrap_or(false);
            RebootPersistenceHandle {
                method,
                installed_path,
                created,
            }
        })
    }

    /// Install the hook with the first supported method.
    ///
    /// An already-active hook is returned as is, so repeated calls never
    /// produce a second boot-time invocation.
    pub fn install(&self, exec: &mut Executor) -> Result<RebootPersistenceHandle, MigrationError> {
        if let Some(existing) = self.active() {
            info!(method = existing.method.as_str(), "Boot hook already installed");
            return Ok(existing);
        }

        for method in &self.config.boot_methods {
            if !self.supports(*method) {
                debug!(method = method.as_str(), "Boot method unsupported");
                continue;
            }
            match self.install_with(*method, exec) {
                Ok(handle) => {
                    exec.write_file(&self.config.hook_file(), &handle.to_line(), "boot hook handle")?;
                    info!(method = method.as_str(), path = %handle.installed_path.display(), "Boot hook installed");
                    return Ok(handle);
                }
                Err(err) => {
                    warn!(method = method.as_str(), error = %format!("{err:#}"), "Boot hook install failed; trying next method");
                }
            }
        }

        Err(MigrationError::Persistence(
            "no supported boot-time mechanism accepted the continuation hook".to_string(),
        ))
    }

    fn install_with(&self, method: BootMethod, exec: &mut Executor) -> Result<RebootPersistenceHandle> {
        let path = self.path_for(method);
        let command = self.invocation();
        let created = match method {
            BootMethod::BootScript => {
                let line = format!("{command} >/dev/null 2>&1 & # {MARKER}");
                if path.exists() {
                    let content = fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    exec.write_file(&path, &insert_before_exit(&content, &line), "add continuation line")?;
                    false
                } else {
                    let content = format!("#!/bin/sh -e\n{CREATED_HEADER}\n{line}\nexit 0\n");
                    exec.write_file_mode(&path, &content, 0o755, "create boot script")?;
                    true
                }
            }
            BootMethod::ServiceUnit => {
                exec.write_file_mode(&path, &unit_file(&command), 0o644, "continuation unit")?;
                let out = exec.run_command("systemctl", &["daemon-reload"], "reload units")?;
                if !out.status.success() {
                    warn!("systemctl daemon-reload failed");
                }
                let out = exec.run_command("systemctl", &["enable", UNIT_NAME], "enable continuation unit")?;
                if !out.status.success() {
                    exec.remove_file(&path)?;
                    anyhow::bail!("systemctl enable {UNIT_NAME} failed");
                }
                true
            }
            BootMethod::InitScript => {
                exec.write_file_mode(&path, &init_script(&command), 0o755, "continuation init script")?;
                let out = exec.run_command("update-rc.d", &[INIT_NAME, "defaults"], "register init script")?;
                if !out.status.success() {
                    exec.remove_file(&path)?;
                    anyhow::bail!("update-rc.d {INIT_NAME} defaults failed");
                }
                true
            }
        };
        Ok(RebootPersistenceHandle {
            method,
            installed_path: path,
            created,
        })
    }

    /// Remove every hook artifact and verify nothing is left.
    ///
    /// Unrelated lines of a pre-existing boot script are preserved verbatim.
    pub fn remove(&self, exec: &mut Executor) -> Result<(), MigrationError> {
        let handle = self.load_handle();

        let script = self.boot_script();
        if let Ok(content) = fs::read_to_string(&script) {
            if content.contains(MARKER) {
                let created = content.contains(CREATED_HEADER)
                    || handle
                        .as_ref()
                        .map(|h| h.method == BootMethod::BootScript && h.created)
                        .unwrap_or(false);
                let stripped = strip_marker_lines(&content);
                if created && is_trivial_script(&stripped) {
                    exec.remove_file(&script)?;
                } else {
                    exec.write_file(&script, &stripped, "remove continuation line")?;
                }
            }
        }

        let unit = self.unit_path();
        if unit.exists() {
            let out = exec.run_command("systemctl", &["disable", UNIT_NAME], "disable continuation unit")?;
            if !out.status.success() {
                warn!("systemctl disable {} failed", UNIT_NAME);
            }
            exec.remove_file(&unit)?;
            exec.run_command("systemctl", &["daemon-reload"], "reload units")?;
        }

        let init = self.init_path();
        if init.exists() {
            exec.run_command("update-rc.d", &["-f", INIT_NAME, "remove"], "unregister init script")?;
            exec.remove_file(&init)?;
        }

        exec.remove_file(&self.config.hook_file())?;

        if exec.is_dry_run() {
            return Ok(());
        }
        let left = self.scan();
        if !left.is_empty() {
            let paths: Vec<String> = left.iter().map(|(_, p)| p.display().to_string()).collect();
            return Err(MigrationError::Persistence(format!(
                "boot hook residue remains in {}",
                paths.join(", ")
            )));
        }
        info!("Boot hook removed");
        Ok(())
    }
}

fn insert_before_exit(content: &str, line: &str) -> String {
    let mut lines: Vec<&str> = content.lines().collect();
    match lines.iter().rposition(|l| l.trim() == "exit 0") {
        Some(index) => lines.insert(index, line),
        None => lines.push(line),
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn strip_marker_lines(content: &str) -> String {
    let kept: Vec<&str> = content.lines().filter(|l| !l.contains(MARKER)).collect();
    if kept.is_empty() {
        return String::new();
    }
    let mut out = kept.join("\n");
    if content.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn is_trivial_script(content: &str) -> bool {
    content
        .lines()
        .map(str::trim)
        .all(|l| l.is_empty() || l.starts_with("#!") || l == "exit 0")
}

fn unit_file(command: &str) -> String {
    format!(
        "# {MARKER}\n\
         [Unit]\n\
         Description=Resume realmshift domain migration after reboot\n\
         After=network-online.target sssd.service\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=oneshot\n\
         ExecStart={command}\n\
         RemainAfterExit=no\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n"
    )
}

fn init_script(command: &str) -> String {
    format!(
        "#!/bin/sh\n\
         # {MARKER}\n\
         ### BEGIN INIT INFO\n\
         # Provides:          {INIT_NAME}\n\
         # Required-Start:    $network $remote_fs $syslog\n\
         # Required-Stop:\n\
         # Default-Start:     2 3 4 5\n\
         # Default-Stop:\n\
         # Short-Description: Resume realmshift domain migration\n\
         ### END INIT INFO\n\
         \n\
         case \"$1\" in\n\
         \x20 start) {command} >/dev/null 2>&1 & ;;\n\
         esac\n\
         exit 0\n"
    )
}

/// Read a hook artifact; used by `status`.
pub fn describe_hook(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()?
        .lines()
        .find(|l| l.contains("automate --auto"))
        .map(|l| l.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::MockCommandRunner;
    use crate::events::RecordingPresenter;
    use crate::state::Mode;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn config(root: &Path) -> Config {
        Config {
            root: root.to_path_buf(),
            binary_path: Some(PathBuf::from("/usr/local/sbin/realmshift")),
            ..Config::default()
        }
    }

    fn exec() -> (Executor, Arc<MockCommandRunner>) {
        let runner = Arc::new(MockCommandRunner::new());
        (
            Executor::new(false, runner.clone(), Arc::new(RecordingPresenter::new())),
            runner,
        )
    }

    #[test]
    fn test_install_appends_to_existing_rc_local_before_exit() {
        let root = tempdir().unwrap();
        let config = config(root.path());
        let rc = config.path("/etc/rc.local");
        fs::create_dir_all(rc.parent().unwrap()).unwrap();
        fs::write(&rc, "#!/bin/sh -e\n/usr/bin/keep-me\nexit 0\n").unwrap();
        fs::set_permissions(&rc, fs::Permissions::from_mode(0o755)).unwrap();

        let (mut exec, _) = exec();
        let handle = RebootBridge::new(&config).install(&mut exec).unwrap();

        assert_eq!(handle.method, BootMethod::BootScript);
        assert!(!handle.created);
        let content = fs::read_to_string(&rc).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[1], "/usr/bin/keep-me");
        assert!(lines[2].contains("automate --auto"));
        assert!(lines[2].contains(MARKER));
        assert_eq!(lines[3], "exit 0");
    }

    #[test]
    fn test_remove_restores_existing_script_exactly() {
        let root = tempdir().unwrap();
        let config = config(root.path());
        let rc = config.path("/etc/rc.local");
        fs::create_dir_all(rc.parent().unwrap()).unwrap();
        let original = "#!/bin/sh -e\n/usr/bin/keep-me\nexit 0\n";
        fs::write(&rc, original).unwrap();
        fs::set_permissions(&rc, fs::Permissions::from_mode(0o755)).unwrap();

        let (mut exec, _) = exec();
        let bridge = RebootBridge::new(&config);
        bridge.install(&mut exec).unwrap();
        bridge.remove(&mut exec).unwrap();

        assert_eq!(fs::read_to_string(&rc).unwrap(), original);
        assert!(bridge.scan().is_empty());
        assert!(!config.hook_file().exists());
    }

    #[test]
    fn test_created_script_is_deleted_on_remove() {
        let root = tempdir().unwrap();
        let config = config(root.path());
        fs::create_dir_all(config.path("/lib/systemd/system")).unwrap();
        fs::write(config.path("/lib/systemd/system/rc-local.service"), "[Unit]\n").unwrap();

        let (mut exec, _) = exec();
        let bridge = RebootBridge::new(&config);
        let handle = bridge.install(&mut exec).unwrap();
        assert!(handle.created);
        let mode = fs::metadata(&handle.installed_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        bridge.remove(&mut exec).unwrap();
        assert!(!config.path("/etc/rc.local").exists());
    }

    #[test]
    fn test_install_twice_yields_one_hook() {
        let root = tempdir().unwrap();
        let config = config(root.path());
        let rc = config.path("/etc/rc.local");
        fs::create_dir_all(rc.parent().unwrap()).unwrap();
        fs::write(&rc, "#!/bin/sh -e\nexit 0\n").unwrap();
        fs::set_permissions(&rc, fs::Permissions::from_mode(0o755)).unwrap();

        let (mut exec, _) = exec();
        let bridge = RebootBridge::new(&config);
        let first = bridge.install(&mut exec).unwrap();
        let second = bridge.install(&mut exec).unwrap();

        assert_eq!(first, second);
        let content = fs::read_to_string(&rc).unwrap();
        assert_eq!(content.matches(MARKER).count(), 1);
    }

    #[test]
    fn test_falls_back_to_service_unit() {
        let root = tempdir().unwrap();
        let config = config(root.path());
        fs::create_dir_all(config.path("/etc/systemd/system")).unwrap();

        let (mut exec, runner) = exec();
        let bridge = RebootBridge::new(&config);
        let handle = bridge.install(&mut exec).unwrap();

        assert_eq!(handle.method, BootMethod::ServiceUnit);
        assert!(runner.was_called("systemctl", &["enable", UNIT_NAME]));
        let unit = fs::read_to_string(&handle.installed_path).unwrap();
        assert!(unit.contains("ExecStart=/usr/local/sbin/realmshift automate --auto"));

        bridge.remove(&mut exec).unwrap();
        assert!(!handle.installed_path.exists());
        assert!(runner.was_called("systemctl", &["disable", UNIT_NAME]));
    }

    #[test]
    fn test_failed_enable_tries_init_script() {
        let root = tempdir().unwrap();
        let config = config(root.path());
        fs::create_dir_all(config.path("/etc/systemd/system")).unwrap();
        fs::create_dir_all(config.path("/etc/init.d")).unwrap();

        let (mut exec, runner) = exec();
        runner.respond("systemctl", &["enable"], 1, "");
        let handle = RebootBridge::new(&config).install(&mut exec).unwrap();

        assert_eq!(handle.method, BootMethod::InitScript);
        assert!(!config.path("/etc/systemd/system").join(UNIT_NAME).exists());
        assert!(runner.was_called("update-rc.d", &[INIT_NAME, "defaults"]));
    }

    #[test]
    fn test_no_supported_method_is_persistence_error() {
        let root = tempdir().unwrap();
        let config = config(root.path());
        let (mut exec, _) = exec();
        let err = RebootBridge::new(&config).install(&mut exec).unwrap_err();
        assert!(matches!(err, MigrationError::Persistence(_)));
    }

    #[test]
    fn test_non_executable_rc_local_is_unsupported() {
        let root = tempdir().unwrap();
        let config = config(root.path());
        let rc = config.path("/etc/rc.local");
        fs::create_dir_all(rc.parent().unwrap()).unwrap();
        fs::write(&rc, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(&rc, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(!RebootBridge::new(&config).supports(BootMethod::BootScript));
    }

    #[test]
    fn test_post_reboot_sentinel_detection() {
        let root = tempdir().unwrap();
        let store = StateStore::new(root.path().join("state"));
        assert!(!is_post_reboot(&store));

        let mut state = MigrationState::new(Mode::Live, "newco.local", "ws01", None);
        state.step = 17;
        store.save(&state).unwrap();
        assert!(!is_post_reboot(&store));

        mark_post_reboot(&store, &mut state).unwrap();
        assert!(is_post_reboot(&store));

        let presenter = RecordingPresenter::new();
        let resumed = detect_continuation(&store, Duration::ZERO, &presenter)
            .unwrap()
            .unwrap();
        assert_eq!(resumed.phase, Phase::Resumed);
        assert_eq!(resumed.step, 17);
        assert!(!is_post_reboot(&store));
    }

    #[test]
    fn test_handle_line_roundtrip() {
        let handle = RebootPersistenceHandle {
            method: BootMethod::InitScript,
            installed_path: PathBuf::from("/etc/init.d/realmshift-continue"),
            created: true,
        };
        assert_eq!(RebootPersistenceHandle::parse(&handle.to_line()), Some(handle));
        assert!(RebootPersistenceHandle::parse("bogus|/x|true").is_none());
    }

    #[test]
    fn test_countdown_cancel() {
        let presenter = RecordingPresenter::new();
        let cancel = CancelFlag::new();
        assert!(countdown(0, &presenter, &cancel));
        cancel.request();
        assert!(!countdown(1, &presenter, &cancel));
        // The request is consumed.
        assert!(!cancel.is_requested());
        assert!(presenter.events().is_empty());
    }

    #[test]
    fn test_cancel_flag_shared_between_clones() {
        let flag = CancelFlag::new();
        let handler_side = flag.clone();
        handler_side.request();
        assert!(flag.is_requested());
        assert!(flag.take());
        assert!(!handler_side.is_requested());
    }
}
