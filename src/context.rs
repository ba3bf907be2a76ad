//! Everything a step needs, threaded explicitly through the run.

use anyhow::Result;
use std::fs;
use std::sync::Arc;

use crate::backup::BackupManager;
use crate::command_runner::CommandRunner;
use crate::config::Config;
use crate::domain::{DomainService, DomainTransitionDriver};
use crate::effects::Executor;
use crate::error::MigrationError;
use crate::events::{Presenter, StepEvent};
use crate::profiles::DomainUserMapping;
use crate::prompt::Prompter;
use crate::reboot::CancelFlag;
use crate::state::{MigrationState, Mode, valid_domain, valid_hostname};

/// Operator-supplied values; anything missing is asked for on a fresh run.
#[derive(Debug, Clone, Default)]
pub struct MigrationInput {
    pub domain: Option<String>,
    pub hostname: Option<String>,
    pub old_domain: Option<String>,
    pub admin: Option<String>,
}

pub struct MigrationContext {
    pub config: Config,
    pub mode: Mode,
    pub input: MigrationInput,
    pub target_domain: String,
    pub hostname: String,
    pub old_domain: Option<String>,
    /// Take the full rollback archive during BackupConfigs.
    pub snapshot: bool,
    pub reboot_delay_secs: u64,
    pub runner: Arc<dyn CommandRunner>,
    pub domain_service: Box<dyn DomainService>,
    pub presenter: Arc<dyn Presenter>,
    pub prompter: Box<dyn Prompter>,
    pub exec: Executor,
    /// Set by Ctrl-C; checked between steps and during the reboot countdown.
    pub cancel: CancelFlag,
    pub backups: BackupManager,
    pub mappings: Vec<DomainUserMapping>,
    /// Steps that failed but the run was allowed to continue past.
    pub continued_failures: Vec<(&'static str, String)>,
}

impl MigrationContext {
    pub fn new(
        config: Config,
        mode: Mode,
        input: MigrationInput,
        runner: Arc<dyn CommandRunner>,
        domain_service: Box<dyn DomainService>,
        presenter: Arc<dyn Presenter>,
        prompter: Box<dyn Prompter>,
    ) -> Self {
        let exec = Executor::new(mode.is_dry_run(), runner.clone(), presenter.clone());
        let reboot_delay_secs = config.reboot_delay_secs;
        Self {
            snapshot: mode == Mode::Technician,
            target_domain: input.domain.clone().unwrap_or_default(),
            hostname: input.hostname.clone().unwrap_or_default(),
            old_domain: input.old_domain.clone(),
            config,
            mode,
            input,
            reboot_delay_secs,
            runner,
            domain_service,
            presenter,
            prompter,
            exec,
            cancel: CancelFlag::new(),
            backups: BackupManager::now(),
            mappings: Vec::new(),
            continued_failures: Vec::new(),
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.prompter.is_interactive()
    }

    pub fn driver(&self) -> DomainTransitionDriver<'_> {
        DomainTransitionDriver::new(
            self.domain_service.as_ref(),
            self.presenter.clone(),
            self.config.join_settle(),
        )
    }

    pub fn emit(&self, event: StepEvent) {
        self.presenter.emit(event);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.presenter.emit(StepEvent::Warning(message.into()));
    }

    pub fn note(&self, message: impl Into<String>) {
        self.presenter.emit(StepEvent::Info(message.into()));
    }

    /// Read-only query through the runner; runs for real in every mode.
    pub fn query(&self, program: &str, args: &[&str]) -> Result<std::process::Output> {
        self.runner.run_output(program, args, &Default::default())
    }

    /// Continue a run from persisted state.
    pub fn adopt(&mut self, state: &MigrationState) {
        self.target_domain = state.domain.clone();
        self.hostname = state.hostname.clone();
        self.old_domain = state.old_domain.clone();
    }

    /// Fill in the target domain, hostname and old domain for a fresh run.
    pub fn collect_input(&mut self) -> Result<(), MigrationError> {
        let domain = match self.input.domain.clone() {
            Some(domain) => domain,
            None => self.prompter.input("Target domain (FQDN)", None)?,
        };
        let domain = domain.trim().to_lowercase();
        if !valid_domain(&domain) {
            return Err(MigrationError::InvalidArguments(format!(
                "'{domain}' is not a valid domain name"
            )));
        }

        let current = self.current_hostname();
        let hostname = match self.input.hostname.clone() {
            Some(hostname) => hostname,
            None => self
                .prompter
                .input("Short hostname", current.as_deref())?,
        };
        let hostname = hostname.trim().to_string();
        if !valid_hostname(&hostname) {
            return Err(MigrationError::InvalidArguments(format!(
                "'{hostname}' is not a valid short hostname"
            )));
        }

        let old_domain = match self.input.old_domain.clone() {
            Some(old) => Some(old.trim().to_lowercase()),
            None => self.detect_old_domain(&domain),
        };
        if let Some(old) = &old_domain {
            if !valid_domain(old) {
                return Err(MigrationError::InvalidArguments(format!(
                    "'{old}' is not a valid domain name"
                )));
            }
        }

        self.target_domain = domain;
        self.hostname = hostname;
        self.old_domain = old_domain;
        Ok(())
    }

    fn current_hostname(&self) -> Option<String> {
        fs::read_to_string(self.config.path("/etc/hostname"))
            .ok()
            .map(|h| h.trim().split('.').next().unwrap_or_default().to_string())
            .filter(|h| valid_hostname(h))
    }

    /// The domain currently joined, other than the target.
    fn detect_old_domain(&self, target: &str) -> Option<String> {
        self.domain_service
            .list_membership()
            .ok()?
            .into_iter()
            .map(|d| d.to_lowercase())
            .find(|d| d != target)
    }

    /// Admin principal for the join; asked for when not given.
    pub fn admin_principal(&self) -> Result<String, MigrationError> {
        match &self.input.admin {
            Some(admin) => Ok(admin.clone()),
            None => Ok(self
                .prompter
                .input("Domain administrator account", Some("Administrator"))?),
        }
    }

    pub fn state(&self) -> MigrationState {
        MigrationState::new(
            self.mode,
            &self.target_domain,
            &self.hostname,
            self.old_domain.as_deref(),
        )
    }
}
