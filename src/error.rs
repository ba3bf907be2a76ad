//! Error taxonomy for realmshift.
//!
//! Steps report failures as [`MigrationError`]; the step engine is the only
//! place that turns an error class into a continue/abort decision.

use std::path::PathBuf;
use thiserror::Error;

/// How the step engine treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Not root, unsupported OS, missing tool. Fatal before any mutation.
    Precondition,
    /// Logged as a warning; policy decides whether the run continues.
    Recoverable,
    /// A check after a mutation disagreed with what the command reported.
    Verification,
    /// Progress can no longer be tracked. Always aborts.
    Persistence,
    /// The operator stopped the run.
    Cancelled,
}

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("backup of {path} is invalid: {reason}")]
    InvalidBackup { path: PathBuf, reason: String },

    #[error("cannot persist migration progress: {0}")]
    Persistence(String),

    #[error("`{program}` exited with code {code}")]
    CommandFailed { program: String, code: i32 },

    #[error("cancelled by operator")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MigrationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MigrationError::Precondition(_) | MigrationError::InvalidArguments(_) => {
                ErrorClass::Precondition
            }
            MigrationError::Verification(_) | MigrationError::InvalidBackup { .. } => {
                ErrorClass::Verification
            }
            MigrationError::Persistence(_) => ErrorClass::Persistence,
            MigrationError::Cancelled => ErrorClass::Cancelled,
            MigrationError::CommandFailed { .. }
            | MigrationError::Io(_)
            | MigrationError::Other(_) => ErrorClass::Recoverable,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            MigrationError::InvalidArguments(_) => 2,
            MigrationError::Precondition(_) => 3,
            MigrationError::Cancelled => 130,
            MigrationError::CommandFailed { code, .. } if *code > 0 => *code,
            _ => 1,
        }
    }

    pub fn command_failed(program: impl Into<String>, code: Option<i32>) -> Self {
        MigrationError::CommandFailed {
            program: program.into(),
            code: code.unwrap_or(-1),
        }
    }
}

pub type StepResult<T> = std::result::Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert_eq!(
            MigrationError::Persistence("x".into()).class(),
            ErrorClass::Persistence
        );
        assert_eq!(
            MigrationError::InvalidBackup {
                path: "/etc/hosts".into(),
                reason: "empty".into()
            }
            .class(),
            ErrorClass::Verification
        );
        assert_eq!(
            MigrationError::command_failed("realm", Some(1)).class(),
            ErrorClass::Recoverable
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrationError::InvalidArguments("x".into()).exit_code(), 2);
        assert_eq!(MigrationError::Precondition("x".into()).exit_code(), 3);
        assert_eq!(MigrationError::command_failed("realm", Some(4)).exit_code(), 4);
        assert_eq!(MigrationError::command_failed("realm", None).exit_code(), 1);
        assert_eq!(MigrationError::Verification("x".into()).exit_code(), 1);
    }
}
