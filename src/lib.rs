//! realmshift - move a Debian/Ubuntu host between Active Directory domains
//!
//! The migration is a fixed catalogue of steps run by [`engine::StepEngine`]
//! against a durable checkpoint. A reboot in the middle of the catalogue is
//! bridged by a boot-time hook ([`reboot::RebootBridge`]) that re-enters the
//! engine with `realmshift automate --auto`.
//!
//! ## Modes
//!
//! - **Technician**: interactive, with a full rollback snapshot
//! - **Live**: interactive, per-file backups only
//! - **Dry run**: every mutation is reported instead of performed
//! - **Test**: unattended, the reboot is simulated in-process
//!
//! Every system path is resolved beneath [`config::Config::root`], so a run can
//! be rehearsed against a scratch tree.

pub mod backup;
pub mod cli;
pub mod command_runner;
pub mod commands;
pub mod config;
pub mod context;
pub mod domain;
pub mod effects;
pub mod engine;
pub mod error;
pub mod events;
pub mod output;
pub mod profiles;
pub mod prompt;
pub mod reboot;
pub mod state;
pub mod steps;

pub use cli::{Cli, Commands};
pub use error::{ErrorClass, MigrationError};
