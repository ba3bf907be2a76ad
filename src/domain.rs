//! Domain membership: the adapter over the domain-join tool and the driver
//! that sequences leave / discover / join.
//!
//! [`DomainService`] is the only place that interprets `realm` output. The
//! [`DomainTransitionDriver`] decides what is fatal: leave and discover
//! failures are warnings, a join is retried once with an alternate computer
//! OU, and success is only believed once membership is re-queried.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::command_runner::{CommandOptions, CommandRunner};
use crate::effects::Executor;
use crate::error::MigrationError;
use crate::events::{Presenter, StepEvent};
use crate::prompt::Secret;

/// Administrative credentials for a join. Wiped when dropped.
#[derive(Debug)]
pub struct Credentials {
    pub principal: String,
    pub password: Secret,
}

/// What `realm discover` reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryInfo {
    pub domain_name: String,
    pub realm_name: Option<String>,
    pub server_software: Option<String>,
    pub configured: bool,
}

impl DiscoveryInfo {
    pub fn parse(output: &str) -> Self {
        let mut info = DiscoveryInfo::default();
        for line in output.lines() {
            if !line.starts_with(' ') && !line.trim().is_empty() && info.domain_name.is_empty() {
                info.domain_name = line.trim().to_string();
                continue;
            }
            let Some((key, value)) = line.trim().split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "realm-name" => info.realm_name = Some(value.to_string()),
                "server-software" => info.server_software = Some(value.to_string()),
                "configured" => info.configured = value != "no",
                _ => {}
            }
        }
        info
    }
}

/// Typed interface over the external domain-membership tool.
pub trait DomainService {
    fn leave(&self, domain: &str) -> Result<(), MigrationError>;

    fn discover(&self, domain: &str) -> Result<DiscoveryInfo, MigrationError>;

    fn join(
        &self,
        domain: &str,
        credentials: &Credentials,
        computer_ou: Option<&str>,
    ) -> Result<(), MigrationError>;

    /// Domains this host is currently a member of.
    fn list_membership(&self) -> Result<Vec<String>, MigrationError>;
}

impl<T: DomainService + ?Sized> DomainService for Arc<T> {
    fn leave(&self, domain: &str) -> Result<(), MigrationError> {
        (**self).leave(domain)
    }

    fn discover(&self, domain: &str) -> Result<DiscoveryInfo, MigrationError> {
        (**self).discover(domain)
    }

    fn join(
        &self,
        domain: &str,
        credentials: &Credentials,
        computer_ou: Option<&str>,
    ) -> Result<(), MigrationError> {
        (**self).join(domain, credentials, computer_ou)
    }

    fn list_membership(&self) -> Result<Vec<String>, MigrationError> {
        (**self).list_membership()
    }
}

/// [`DomainService`] backed by realmd's `realm` CLI.
pub struct RealmCli {
    runner: Arc<dyn CommandRunner>,
}

impl RealmCli {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn run(&self, args: &[&str]) -> Result<String, MigrationError> {
        let output = self.runner.run_output("realm", args, &CommandOptions::default())?;
        if !output.status.success() {
            debug!(stderr = %String::from_utf8_lossy(&output.stderr), "realm failed");
            return Err(MigrationError::command_failed("realm", output.status.code()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl DomainService for RealmCli {
    fn leave(&self, domain: &str) -> Result<(), MigrationError> {
        self.run(&["leave", domain]).map(|_| ())
    }

    fn discover(&self, domain: &str) -> Result<DiscoveryInfo, MigrationError> {
        let stdout = self.run(&["discover", domain])?;
        let mut info = DiscoveryInfo::parse(&stdout);
        if info.domain_name.is_empty() {
            info.domain_name = domain.to_string();
        }
        Ok(info)
    }

    fn join(
        &self,
        domain: &str,
        credentials: &Credentials,
        computer_ou: Option<&str>,
    ) -> Result<(), MigrationError> {
        let user = format!("--user={}", credentials.principal);
        let ou = computer_ou.map(|ou| format!("--computer-ou={ou}"));
        let mut args = vec!["join", "--verbose", user.as_str()];
        if let Some(ou) = &ou {
            args.push(ou.as_str());
        }
        args.push(domain);

        let mut input = zeroize::Zeroizing::new(credentials.password.expose().as_bytes().to_vec());
        input.push(b'\n');
        let output =
            self.runner
                .run_with_input("realm", &args, &CommandOptions::default(), &input)?;
        if !output.status.success() {
            debug!(stderr = %String::from_utf8_lossy(&output.stderr), "realm join failed");
            return Err(MigrationError::command_failed("realm", output.status.code()));
        }
        Ok(())
    }

    fn list_membership(&self) -> Result<Vec<String>, MigrationError> {
        let stdout = self.run(&["list", "--name-only"])?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// How a join attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined { used_fallback: bool },
    AlreadyMember,
    Simulated,
}

pub struct DomainTransitionDriver<'a> {
    service: &'a dyn DomainService,
    presenter: Arc<dyn Presenter>,
    join_settle: Duration,
}

impl<'a> DomainTransitionDriver<'a> {
    pub fn new(
        service: &'a dyn DomainService,
        presenter: Arc<dyn Presenter>,
        join_settle: Duration,
    ) -> Self {
        Self {
            service,
            presenter,
            join_settle,
        }
    }

    fn warn(&self, message: String) {
        self.presenter.emit(StepEvent::Warning(message));
    }

    /// Whether the host is a member of `domain`, per the membership query.
    pub fn is_member(&self, domain: &str) -> Result<bool, MigrationError> {
        Ok(self
            .service
            .list_membership()?
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain)))
    }

    /// Leave `domain`. Failure is logged and ignored. Returns whether the host left.
    pub fn leave(&self, domain: &str, exec: &mut Executor) -> bool {
        if exec.is_dry_run() {
            self.presenter
                .emit(StepEvent::Simulated(format!("realm leave {domain}")));
            return true;
        }
        match self.service.leave(domain) {
            Ok(()) => {
                info!(domain, "Left domain");
                true
            }
            Err(err) => {
                self.warn(format!(
                    "Leaving {domain} failed ({err}); continuing, an unjoined host is a valid start"
                ));
                false
            }
        }
    }

    /// Discover `domain`. Failure is a warning; the join proceeds regardless.
    pub fn discover(&self, domain: &str) -> Option<DiscoveryInfo> {
        match self.service.discover(domain) {
            Ok(info) => {
                info!(domain, realm = ?info.realm_name, software = ?info.server_software, "Domain discovered");
                Some(info)
            }
            Err(err) => {
                self.warn(format!(
                    "Discovery of {domain} failed ({err}); some controllers reject anonymous discovery"
                ));
                None
            }
        }
    }

    /// Join `domain`, retrying once with `fallback_ou`, then verify membership.
    ///
    /// `credentials` is consumed and dropped (wiped) as soon as the join
    /// attempts are over, before the settle delay.
    pub fn join(
        &self,
        domain: &str,
        credentials: Credentials,
        fallback_ou: &str,
        exec: &mut Executor,
    ) -> Result<JoinOutcome, MigrationError> {
        if exec.is_dry_run() {
            self.presenter.emit(StepEvent::Simulated(format!(
                "realm join --user={} {domain}",
                credentials.principal
            )));
            return Ok(JoinOutcome::Simulated);
        }

        if self.is_member(domain).unwrap_or(false) {
            self.presenter
                .emit(StepEvent::Info(format!("Already a member of {domain}")));
            return Ok(JoinOutcome::AlreadyMember);
        }

        let attempt = match self.service.join(domain, &credentials, None) {
            Ok(()) => Ok(false),
            Err(err) => {
                self.warn(format!(
                    "Join failed ({err}); retrying once with computer OU {fallback_ou}"
                ));
                self.service
                    .join(domain, &credentials, Some(fallback_ou))
                    .map(|()| true)
            }
        };
        drop(credentials);
        let used_fallback = attempt?;

        if !self.join_settle.is_zero() {
            std::thread::sleep(self.join_settle);
        }

        match self.is_member(domain) {
            Ok(true) => {
                info!(domain, used_fallback, "Join verified");
                Ok(JoinOutcome::Joined { used_fallback })
            }
            Ok(false) => Err(MigrationError::Verification(format!(
                "join reported success but {domain} is not in the membership list"
            ))),
            Err(err) => {
                warn!(%err, "Membership query failed after join");
                Err(MigrationError::Verification(format!(
                    "cannot confirm membership of {domain}: {err}"
                )))
            }
        }
    }
}

/// Scripted behaviour of the next join attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinBehaviour {
    Succeed,
    Fail(i32),
    /// Exit 0 without the host becoming a member.
    SucceedWithoutMembership,
}

/// In-memory [`DomainService`] for tests.
#[derive(Debug, Default)]
pub struct ScriptedDomainService {
    memberships: Mutex<Vec<String>>,
    leave_fails: bool,
    discover_fails: bool,
    joins: Mutex<VecDeque<JoinBehaviour>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedDomainService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memberships(self, domains: &[&str]) -> Self {
        *self.memberships.lock().unwrap_or_else(|e| e.into_inner()) =
            domains.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn failing_leave(mut self) -> Self {
        self.leave_fails = true;
        self
    }

    pub fn failing_discover(mut self) -> Self {
        self.discover_fails = true;
        self
    }

    pub fn with_joins(self, joins: impl IntoIterator<Item = JoinBehaviour>) -> Self {
        self.joins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(joins);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn memberships(&self) -> Vec<String> {
        self.memberships
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }
}

impl DomainService for ScriptedDomainService {
    fn leave(&self, domain: &str) -> Result<(), MigrationError> {
        self.record(format!("leave {domain}"));
        if self.leave_fails {
            return Err(MigrationError::command_failed("realm", Some(1)));
        }
        self.memberships
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|d| !d.eq_ignore_ascii_case(domain));
        Ok(())
    }

    fn discover(&self, domain: &str) -> Result<DiscoveryInfo, MigrationError> {
        self.record(format!("discover {domain}"));
        if self.discover_fails {
            return Err(MigrationError::command_failed("realm", Some(1)));
        }
        Ok(DiscoveryInfo {
            domain_name: domain.to_string(),
            realm_name: Some(domain.to_uppercase()),
            server_software: Some("active-directory".to_string()),
            configured: false,
        })
    }

    fn join(
        &self,
        domain: &str,
        credentials: &Credentials,
        computer_ou: Option<&str>,
    ) -> Result<(), MigrationError> {
        self.record(format!(
            "join {domain} user={} ou={}",
            credentials.principal,
            computer_ou.unwrap_or("-")
        ));
        let behaviour = self
            .joins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(JoinBehaviour::Succeed);
        match behaviour {
            JoinBehaviour::Succeed => {
                self.memberships
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(domain.to_string());
                Ok(())
            }
            JoinBehaviour::Fail(code) => Err(MigrationError::command_failed("realm", Some(code))),
            JoinBehaviour::SucceedWithoutMembership => Ok(()),
        }
    }

    fn list_membership(&self) -> Result<Vec<String>, MigrationError> {
        self.record("list".to_string());
        Ok(self.memberships())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::MockCommandRunner;
    use crate::events::RecordingPresenter;

    fn creds() -> Credentials {
        Credentials {
            principal: "admin".to_string(),
            password: Secret::new("pw".to_string()),
        }
    }

    fn exec(dry_run: bool) -> Executor {
        Executor::new(
            dry_run,
            Arc::new(MockCommandRunner::new()),
            Arc::new(RecordingPresenter::new()),
        )
    }

    fn driver(service: &dyn DomainService) -> DomainTransitionDriver<'_> {
        DomainTransitionDriver::new(service, Arc::new(RecordingPresenter::new()), Duration::ZERO)
    }

    #[test]
    fn test_discovery_parse() {
        let info = DiscoveryInfo::parse(
            "newco.local\n  type: kerberos\n  realm-name: NEWCO.LOCAL\n  configured: no\n  server-software: active-directory\n",
        );
        assert_eq!(info.domain_name, "newco.local");
        assert_eq!(info.realm_name.as_deref(), Some("NEWCO.LOCAL"));
        assert_eq!(info.server_software.as_deref(), Some("active-directory"));
        assert!(!info.configured);
    }

    #[test]
    fn test_realm_cli_join_passes_password_on_stdin() {
        let runner = Arc::new(MockCommandRunner::new());
        let realm = RealmCli::new(runner.clone());
        realm
            .join("newco.local", &creds(), Some("OU=Workstations,DC=newco,DC=local"))
            .unwrap();

        let call = &runner.calls_to("realm")[0];
        assert_eq!(
            call.args,
            vec![
                "join",
                "--verbose",
                "--user=admin",
                "--computer-ou=OU=Workstations,DC=newco,DC=local",
                "newco.local"
            ]
        );
        assert_eq!(call.input_len, Some(3));
    }

    #[test]
    fn test_realm_cli_membership() {
        let runner = Arc::new(MockCommandRunner::new());
        runner.respond("realm", &["list"], 0, "oldco.local\n\nnewco.local\n");
        let realm = RealmCli::new(runner);
        assert_eq!(
            realm.list_membership().unwrap(),
            vec!["oldco.local".to_string(), "newco.local".to_string()]
        );
    }

    #[test]
    fn test_leave_failure_is_not_fatal() {
        let service = ScriptedDomainService::new().failing_leave();
        assert!(!driver(&service).leave("oldco.local", &mut exec(false)));
    }

    #[test]
    fn test_discover_failure_is_a_warning() {
        let service = ScriptedDomainService::new().failing_discover();
        assert!(driver(&service).discover("newco.local").is_none());
    }

    #[test]
    fn test_join_falls_back_once() {
        let service = ScriptedDomainService::new()
            .with_joins([JoinBehaviour::Fail(1), JoinBehaviour::Succeed]);
        let outcome = driver(&service)
            .join("newco.local", creds(), "CN=Computers,DC=newco,DC=local", &mut exec(false))
            .unwrap();
        assert_eq!(outcome, JoinOutcome::Joined { used_fallback: true });
        let joins: Vec<_> = service
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("join"))
            .collect();
        assert_eq!(joins.len(), 2);
        assert!(joins[1].contains("ou=CN=Computers"));
    }

    #[test]
    fn test_join_fails_after_two_attempts() {
        let service = ScriptedDomainService::new()
            .with_joins([JoinBehaviour::Fail(1), JoinBehaviour::Fail(2)]);
        let err = driver(&service)
            .join("newco.local", creds(), "CN=Computers", &mut exec(false))
            .unwrap_err();
        assert!(matches!(err, MigrationError::CommandFailed { code: 2, .. }));
        let joins = service.calls().iter().filter(|c| c.starts_with("join")).count();
        assert_eq!(joins, 2);
    }

    #[test]
    fn test_join_exit_zero_without_membership_is_failure() {
        let service =
            ScriptedDomainService::new().with_joins([JoinBehaviour::SucceedWithoutMembership]);
        let err = driver(&service)
            .join("newco.local", creds(), "CN=Computers", &mut exec(false))
            .unwrap_err();
        assert!(matches!(err, MigrationError::Verification(_)));
    }

    #[test]
    fn test_join_skipped_when_already_member() {
        let service = ScriptedDomainService::new().with_memberships(&["NEWCO.LOCAL"]);
        let outcome = driver(&service)
            .join("newco.local", creds(), "CN=Computers", &mut exec(false))
            .unwrap();
        assert_eq!(outcome, JoinOutcome::AlreadyMember);
    }

    #[test]
    fn test_dry_run_join_touches_nothing() {
        let service = ScriptedDomainService::new();
        let outcome = driver(&service)
            .join("newco.local", creds(), "CN=Computers", &mut exec(true))
            .unwrap();
        assert_eq!(outcome, JoinOutcome::Simulated);
        assert!(service.calls().is_empty());
    }
}
