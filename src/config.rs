//! Operator configuration.
//!
//! Loaded from JSON (`--config`, else `/etc/realmshift/config.json` beneath the
//! root, else defaults). Every absolute path is resolved beneath [`Config::root`]
//! so a whole migration can be rehearsed against a scratch directory.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that relocates the filesystem root.
pub const ROOT_ENV: &str = "REALMSHIFT_ROOT";

/// Config file location, relative to the root.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/realmshift/config.json";

/// Boot-time mechanisms, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootMethod {
    BootScript,
    ServiceUnit,
    InitScript,
}

impl BootMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootMethod::BootScript => "boot-script",
            BootMethod::ServiceUnit => "service-unit",
            BootMethod::InitScript => "init-script",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "boot-script" => Some(BootMethod::BootScript),
            "service-unit" => Some(BootMethod::ServiceUnit),
            "init-script" => Some(BootMethod::InitScript),
            _ => None,
        }
    }
}

/// What automated and test modes do when a non-critical step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    #[default]
    Abort,
    Continue,
}

/// What non-interactive profile migration does when the target home exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    #[default]
    Merge,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filesystem root every other path is resolved beneath.
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub home_root: PathBuf,
    pub tracked_files: Vec<PathBuf>,
    pub snapshot_paths: Vec<PathBuf>,
    pub packages: Vec<String>,
    pub backup_account: String,
    pub sudo_groups: Vec<String>,
    pub network_resource_files: Vec<PathBuf>,
    pub app_config_files: Vec<PathBuf>,
    pub fallback_computer_ou: Option<String>,
    pub boot_methods: Vec<BootMethod>,
    pub binary_path: Option<PathBuf>,
    pub settle_delay_secs: u64,
    pub join_settle_secs: u64,
    pub reboot_delay_secs: u64,
    pub failure_policy: FailurePolicy,
    pub conflict_policy: ConflictPolicy,
    pub force_migrate: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let paths = |items: &[&str]| items.iter().map(PathBuf::from).collect::<Vec<_>>();
        Self {
            root: PathBuf::from("/"),
            state_dir: PathBuf::from("/var/tmp/realmshift"),
            log_dir: PathBuf::from("/var/log/realmshift"),
            home_root: PathBuf::from("/home"),
            tracked_files: paths(&[
                "/etc/hosts",
                "/etc/hostname",
                "/etc/krb5.conf",
                "/etc/sssd/sssd.conf",
                "/etc/nsswitch.conf",
                "/etc/pam.d/common-session",
                "/etc/fstab",
                "/etc/sudoers.d/realmshift",
            ]),
            snapshot_paths: paths(&[
                "/etc/hosts",
                "/etc/hostname",
                "/etc/krb5.conf",
                "/etc/krb5.keytab",
                "/etc/sssd",
                "/etc/netplan",
                "/etc/network/interfaces",
                "/etc/resolv.conf",
                "/etc/machine-id",
                "/etc/passwd",
                "/etc/group",
                "/etc/shadow",
                "/etc/gshadow",
                "/etc/pam.d",
                "/etc/nsswitch.conf",
            ]),
            packages: [
                "realmd",
                "sssd",
                "sssd-tools",
                "libnss-sss",
                "libpam-sss",
                "adcli",
                "samba-common-bin",
                "oddjob",
                "oddjob-mkhomedir",
                "packagekit",
                "krb5-user",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            backup_account: "realmshift-admin".to_string(),
            sudo_groups: vec!["domain admins".to_string()],
            network_resource_files: paths(&["/etc/fstab", "/etc/auto.master", "/etc/auto.cifs"]),
            app_config_files: paths(&["/etc/samba/smb.conf", "/etc/cups/printers.conf"]),
            fallback_computer_ou: None,
            boot_methods: vec![
                BootMethod::BootScript,
                BootMethod::ServiceUnit,
                BootMethod::InitScript,
            ],
            binary_path: None,
            settle_delay_secs: 30,
            join_settle_secs: 5,
            reboot_delay_secs: 10,
            failure_policy: FailurePolicy::Abort,
            conflict_policy: ConflictPolicy::Merge,
            force_migrate: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// `root_override` (from `--root` or `REALMSHIFT_ROOT`) wins over the file.
    pub fn load(explicit: Option<&Path>, root_override: Option<PathBuf>) -> Result<Self> {
        let root = root_override
            .clone()
            .unwrap_or_else(|| PathBuf::from("/"));
        let candidate = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let default = resolve_under(&root, Path::new(DEFAULT_CONFIG_PATH));
                default.is_file().then_some(default)
            }
        };

        let mut config = match candidate {
            Some(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str::<Config>(&content)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => Config::default(),
        };

        if let Some(root) = root_override {
            config.root = root;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let all_paths = [&self.state_dir, &self.log_dir, &self.home_root]
            .into_iter()
            .chain(self.tracked_files.iter())
            .chain(self.snapshot_paths.iter())
            .chain(self.network_resource_files.iter())
            .chain(self.app_config_files.iter());
        for path in all_paths {
            if !path.is_absolute() {
                bail!("Config path must be absolute: {}", path.display());
            }
        }
        if self.packages.is_empty() {
            bail!("Config `packages` must not be empty");
        }
        if self.boot_methods.is_empty() {
            bail!("Config `boot_methods` must name at least one method");
        }
        Ok(())
    }

    /// Resolve an absolute system path beneath the configured root.
    pub fn path(&self, system_path: impl AsRef<Path>) -> PathBuf {
        resolve_under(&self.root, system_path.as_ref())
    }

    pub fn state_file(&self) -> PathBuf {
        self.path(&self.state_dir).join("state")
    }

    pub fn automation_file(&self) -> PathBuf {
        self.path(&self.state_dir).join("automation")
    }

    pub fn hook_file(&self) -> PathBuf {
        self.path(&self.state_dir).join("boot-hook")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.path(&self.state_dir).join("scratch")
    }

    pub fn log_file(&self) -> PathBuf {
        self.path(&self.log_dir).join("realmshift.log")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.path(&self.log_dir).join("snapshots")
    }

    pub fn mapping_file(&self) -> PathBuf {
        self.path(&self.log_dir).join("user-mapping.tsv")
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn join_settle(&self) -> Duration {
        Duration::from_secs(self.join_settle_secs)
    }

    /// Computer OU used by the fallback join attempt.
    pub fn computer_ou_for(&self, domain: &str) -> String {
        if let Some(ou) = &self.fallback_computer_ou {
            return ou.clone();
        }
        let dcs: Vec<String> = domain
            .split('.')
            .filter(|part| !part.is_empty())
            .map(|part| format!("DC={part}"))
            .collect();
        format!("CN=Computers,{}", dcs.join(","))
    }

    /// Binary invoked by the boot hook.
    pub fn binary_path(&self) -> PathBuf {
        self.binary_path
            .clone()
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from("/usr/local/sbin/realmshift"))
    }
}

fn resolve_under(root: &Path, system_path: &Path) -> PathBuf {
    match system_path.strip_prefix("/") {
        Ok(relative) => root.join(relative),
        Err(_) => root.join(system_path),
    }
}
