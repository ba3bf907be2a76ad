//! Effect system for dry-run support.
//!
//! Every mutating action a step performs goes through an [`Executor`], which
//! either performs it or emits a `[DRY-RUN]` simulation event. Read-only
//! diagnostics bypass the executor and always run for real.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use tracing::debug;
use walkdir::WalkDir;

use crate::command_runner::{CommandOptions, CommandRunner, exit_status};
use crate::events::{Presenter, StepEvent};

/// Represents a side effect a step can perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    WriteFile { path: PathBuf, description: String },
    AppendLine { path: PathBuf, line: String },
    CopyFile { from: PathBuf, to: PathBuf },
    CopyTree { from: PathBuf, to: PathBuf },
    Rename { from: PathBuf, to: PathBuf },
    Symlink { target: PathBuf, link: PathBuf },
    RemoveFile { path: PathBuf },
    RemoveDir { path: PathBuf },
    CreateDir { path: PathBuf },
    RunCommand { program: String, args: Vec<String>, description: String },
}

impl Effect {
    /// Human-readable description for dry-run output.
    pub fn describe(&self) -> String {
        match self {
            Effect::WriteFile { path, description } => {
                format!("Write {}: {}", path.display(), description)
            }
            Effect::AppendLine { path, line } => {
                format!("Append to {}: {}", path.display(), line)
            }
            Effect::CopyFile { from, to } => {
                format!("Copy {} -> {}", from.display(), to.display())
            }
            Effect::CopyTree { from, to } => {
                format!("Copy tree {} -> {}", from.display(), to.display())
            }
            Effect::Rename { from, to } => {
                format!("Move {} -> {}", from.display(), to.display())
            }
            Effect::Symlink { target, link } => {
                format!("Link {} -> {}", link.display(), target.display())
            }
            Effect::RemoveFile { path } => format!("Remove {}", path.display()),
            Effect::RemoveDir { path } => format!("Remove directory {}", path.display()),
            Effect::CreateDir { path } => format!("Create directory {}", path.display()),
            Effect::RunCommand {
                program,
                args,
                description,
            } => {
                format!("Run `{} {}`: {}", program, args.join(" "), description)
            }
        }
    }
}

/// Performs effects, or reports them in dry-run mode.
pub struct Executor {
    dry_run: bool,
    runner: Arc<dyn CommandRunner>,
    presenter: Arc<dyn Presenter>,
    effects: Vec<Effect>,
}

impl Executor {
    pub fn new(dry_run: bool, runner: Arc<dyn CommandRunner>, presenter: Arc<dyn Presenter>) -> Self {
        Self {
            dry_run,
            runner,
            presenter,
            effects: Vec::new(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Runner for read-only queries, which are never simulated.
    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// Effects simulated so far.
    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    /// Record the effect. Returns true when the caller should skip the real action.
    fn simulate(&mut self, effect: Effect) -> bool {
        if self.dry_run {
            self.presenter.emit(StepEvent::Simulated(effect.describe()));
            self.effects.push(effect);
            true
        } else {
            debug!(effect = %effect.describe(), "Applying effect");
            false
        }
    }

    pub fn write_file(&mut self, path: &Path, content: &str, description: &str) -> Result<()> {
        if self.simulate(Effect::WriteFile {
            path: path.to_path_buf(),
            description: description.to_string(),
        }) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Write a file and set its permission bits.
    pub fn write_file_mode(
        &mut self,
        path: &Path,
        content: &str,
        mode: u32,
        description: &str,
    ) -> Result<()> {
        if self.simulate(Effect::WriteFile {
            path: path.to_path_buf(),
            description: format!("{description} (mode {mode:o})"),
        }) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to chmod {}", path.display()))
    }

    pub fn append_line(&mut self, path: &Path, line: &str) -> Result<()> {
        if self.simulate(Effect::AppendLine {
            path: path.to_path_buf(),
            line: line.to_string(),
        }) {
            return Ok(());
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("Failed to append to {}", path.display()))
    }

    pub fn copy_file(&mut self, from: &Path, to: &Path) -> Result<()> {
        if self.simulate(Effect::CopyFile {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        }) {
            return Ok(());
        }
        fs::copy(from, to)
            .map(|_| ())
            .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))
    }

    /// Copy a directory tree, overwriting same-named files in `to`.
    ///
    /// Symlinks are recreated rather than followed.
    pub fn copy_tree(&mut self, from: &Path, to: &Path) -> Result<u64> {
        if self.simulate(Effect::CopyTree {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        }) {
            return Ok(0);
        }
        copy_tree(from, to)
    }

    pub fn rename(&mut self, from: &Path, to: &Path) -> Result<()> {
        if self.simulate(Effect::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        }) {
            return Ok(());
        }
        fs::rename(from, to)
            .with_context(|| format!("Failed to move {} to {}", from.display(), to.display()))
    }

    pub fn symlink(&mut self, target: &Path, link: &Path) -> Result<()> {
        if self.simulate(Effect::Symlink {
            target: target.to_path_buf(),
            link: link.to_path_buf(),
        }) {
            return Ok(());
        }
        std::os::unix::fs::symlink(target, link).with_context(|| {
            format!("Failed to link {} -> {}", link.display(), target.display())
        })
    }

    /// Remove a file. A missing file is not an error.
    pub fn remove_file(&mut self, path: &Path) -> Result<()> {
        if self.simulate(Effect::RemoveFile {
            path: path.to_path_buf(),
        }) {
            return Ok(());
        }
        match fs::remove_file(path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                Err(err).with_context(|| format!("Failed to remove {}", path.display()))
            }
            _ => Ok(()),
        }
    }

    /// Remove a directory tree. A missing directory is not an error.
    pub fn remove_dir_all(&mut self, path: &Path) -> Result<()> {
        if self.simulate(Effect::RemoveDir {
            path: path.to_path_buf(),
        }) {
            return Ok(());
        }
        match fs::remove_dir_all(path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                Err(err).with_context(|| format!("Failed to remove {}", path.display()))
            }
            _ => Ok(()),
        }
    }

    pub fn create_dir_all(&mut self, path: &Path) -> Result<()> {
        if self.simulate(Effect::CreateDir {
            path: path.to_path_buf(),
        }) {
            return Ok(());
        }
        fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path.display()))
    }

    /// Run a mutating command. Dry-run returns a synthetic success.
    pub fn run_command(&mut self, program: &str, args: &[&str], description: &str) -> Result<Output> {
        self.run_command_with(program, args, &CommandOptions::default(), description)
    }

    pub fn run_command_with(
        &mut self,
        program: &str,
        args: &[&str],
        options: &CommandOptions,
        description: &str,
    ) -> Result<Output> {
        if self.simulate(command_effect(program, args, description)) {
            return Ok(simulated_output());
        }
        self.presenter.emit(StepEvent::Action(format!(
            "Running: {} {}",
            program,
            args.join(" ")
        )));
        self.runner.run_output(program, args, options)
    }

    /// Run a mutating command with `input` on stdin. The input is never logged.
    pub fn run_command_with_input(
        &mut self,
        program: &str,
        args: &[&str],
        input: &[u8],
        description: &str,
    ) -> Result<Output> {
        if self.simulate(command_effect(program, args, description)) {
            return Ok(simulated_output());
        }
        self.presenter.emit(StepEvent::Action(format!(
            "Running: {} {}",
            program,
            args.join(" ")
        )));
        self.runner
            .run_with_input(program, args, &CommandOptions::default(), input)
    }
}

fn command_effect(program: &str, args: &[&str], description: &str) -> Effect {
    Effect::RunCommand {
        program: program.to_string(),
        args: args.iter().map(|s| s.to_string()).collect(),
        description: description.to_string(),
    }
}

fn simulated_output() -> Output {
    Output {
        status: exit_status(0),
        stdout: Vec::new(),
        stderr: Vec::new(),
    }
}

/// Recursively copy `from` into `to`. Returns the number of files copied.
pub fn copy_tree(from: &Path, to: &Path) -> Result<u64> {
    let mut copied = 0;
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", from.display()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .with_context(|| format!("Unexpected path {}", entry.path().display()))?;
        let dest = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&dest)
                .with_context(|| format!("Failed to create {}", dest.display()))?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            if fs::symlink_metadata(&dest).is_ok() {
                fs::remove_file(&dest)?;
            }
            std::os::unix::fs::symlink(&target, &dest)
                .with_context(|| format!("Failed to link {}", dest.display()))?;
        } else {
            fs::copy(entry.path(), &dest).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), dest.display())
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::MockCommandRunner;
    use crate::events::RecordingPresenter;
    use tempfile::tempdir;

    fn executor(dry_run: bool) -> (Executor, Arc<MockCommandRunner>, Arc<RecordingPresenter>) {
        let runner = Arc::new(MockCommandRunner::new());
        let presenter = Arc::new(RecordingPresenter::new());
        (
            Executor::new(dry_run, runner.clone(), presenter.clone()),
            runner,
            presenter,
        )
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts");
        let (mut exec, runner, presenter) = executor(true);

        exec.write_file(&path, "127.0.0.1 localhost\n", "hosts").unwrap();
        exec.run_command("systemctl", &["restart", "sssd"], "restart sssd")
            .unwrap();

        assert!(!path.exists());
        assert!(runner.calls().is_empty());
        assert_eq!(exec.effects().len(), 2);
        assert_eq!(presenter.simulated().len(), 2);
    }

    #[test]
    fn test_real_mode_executes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etc/krb5.conf");
        let (mut exec, runner, _) = executor(false);

        exec.write_file_mode(&path, "[libdefaults]\n", 0o600, "krb5").unwrap();
        exec.append_line(&path, "# tail").unwrap();
        exec.run_command("systemctl", &["restart", "sssd"], "restart")
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "[libdefaults]\n# tail\n"
        );
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert!(runner.was_called("systemctl", &["restart", "sssd"]));
        assert!(exec.effects().is_empty());
    }

    #[test]
    fn test_copy_tree_preserves_layout_and_links() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("from");
        std::fs::create_dir_all(from.join("docs/deep")).unwrap();
        std::fs::write(from.join("docs/deep/a.txt"), "a").unwrap();
        std::fs::write(from.join(".bashrc"), "rc").unwrap();
        std::os::unix::fs::symlink("docs/deep/a.txt", from.join("link")).unwrap();

        let to = dir.path().join("to");
        let copied = copy_tree(&from, &to).unwrap();

        assert_eq!(copied, 2);
        assert_eq!(std::fs::read_to_string(to.join("docs/deep/a.txt")).unwrap(), "a");
        assert_eq!(
            std::fs::read_link(to.join("link")).unwrap(),
            PathBuf::from("docs/deep/a.txt")
        );
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = tempdir().unwrap();
        let (mut exec, _, _) = executor(false);
        exec.remove_file(&dir.path().join("nope")).unwrap();
        exec.remove_dir_all(&dir.path().join("nope")).unwrap();
    }
}
