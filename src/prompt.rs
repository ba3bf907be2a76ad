//! Operator interaction.
//!
//! Steps never read the terminal directly; they ask a [`Prompter`]. The
//! terminal implementation uses cliclack, automated runs use
//! [`NonInteractivePrompter`], and tests script the answers.

use anyhow::{Context, Result, bail};
use std::collections::VecDeque;
use std::fmt;
use std::io::BufRead;
use std::sync::Mutex;
use zeroize::Zeroizing;

/// A secret held only in process memory and wiped on drop.
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: String) -> Self {
        Self(Zeroizing::new(value))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

pub trait Prompter {
    /// Whether an operator is present to answer.
    fn is_interactive(&self) -> bool;

    fn confirm(&self, message: &str, default: bool) -> Result<bool>;

    fn input(&self, message: &str, default: Option<&str>) -> Result<String>;

    fn secret(&self, message: &str) -> Result<Secret>;

    /// Block until the operator acknowledges `message`.
    fn acknowledge(&self, message: &str) -> Result<()>;
}

/// Prompts on the controlling terminal.
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn is_interactive(&self) -> bool {
        true
    }

    fn confirm(&self, message: &str, default: bool) -> Result<bool> {
        cliclack::confirm(message)
            .initial_value(default)
            .interact()
            .context("Failed to read confirmation")
    }

    fn input(&self, message: &str, default: Option<&str>) -> Result<String> {
        let mut prompt = cliclack::input(message);
        if let Some(default) = default {
            prompt = prompt.default_input(default).placeholder(default);
        }
        let value: String = prompt.interact().context("Failed to read input")?;
        Ok(value.trim().to_string())
    }

    fn secret(&self, message: &str) -> Result<Secret> {
        let value = cliclack::password(message)
            .mask('▪')
            .interact()
            .context("Failed to read secret")?;
        Ok(Secret::new(value))
    }

    fn acknowledge(&self, message: &str) -> Result<()> {
        let _: String = cliclack::input(message)
            .required(false)
            .default_input("")
            .interact()
            .context("Failed to read acknowledgement")?;
        Ok(())
    }
}

/// Answers for unattended runs: defaults for confirmations, errors for input.
pub struct NonInteractivePrompter {
    /// Read a single secret line from stdin when asked.
    secret_from_stdin: bool,
    consumed: Mutex<bool>,
}

impl NonInteractivePrompter {
    pub fn new(secret_from_stdin: bool) -> Self {
        Self {
            secret_from_stdin,
            consumed: Mutex::new(false),
        }
    }
}

impl Prompter for NonInteractivePrompter {
    fn is_interactive(&self) -> bool {
        false
    }

    fn confirm(&self, _message: &str, default: bool) -> Result<bool> {
        Ok(default)
    }

    fn input(&self, message: &str, default: Option<&str>) -> Result<String> {
        match default {
            Some(value) => Ok(value.to_string()),
            None => bail!("No value for '{message}' in non-interactive mode"),
        }
    }

    fn secret(&self, message: &str) -> Result<Secret> {
        if !self.secret_from_stdin {
            bail!("No secret available for '{message}' in non-interactive mode");
        }
        let mut consumed = self.consumed.lock().unwrap_or_else(|e| e.into_inner());
        if *consumed {
            bail!("Secret on stdin was already consumed");
        }
        let mut line = Zeroizing::new(String::new());
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Failed to read secret from stdin")?;
        *consumed = true;
        let value = line.trim_end_matches(['\r', '\n']).to_string();
        Ok(Secret::new(value))
    }

    fn acknowledge(&self, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// A queued answer for [`ScriptedPrompter`].
#[derive(Debug, Clone)]
pub enum Answer {
    Confirm(bool),
    Input(String),
    Secret(String),
}

/// Replays queued answers in order; records every question asked.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<Answer>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn next(&self, message: &str) -> Result<Answer> {
        self.asked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
        self.answers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .with_context(|| format!("No scripted answer for '{message}'"))
    }
}

impl Prompter for ScriptedPrompter {
    fn is_interactive(&self) -> bool {
        true
    }

    fn confirm(&self, message: &str, _default: bool) -> Result<bool> {
        match self.next(message)? {
            Answer::Confirm(value) => Ok(value),
            other => bail!("Expected confirmation for '{message}', got {other:?}"),
        }
    }

    fn input(&self, message: &str, _default: Option<&str>) -> Result<String> {
        match self.next(message)? {
            Answer::Input(value) => Ok(value),
            other => bail!("Expected input for '{message}', got {other:?}"),
        }
    }

    fn secret(&self, message: &str) -> Result<Secret> {
        match self.next(message)? {
            Answer::Secret(value) => Ok(Secret::new(value)),
            other => bail!("Expected secret for '{message}', got {other:?}"),
        }
    }

    fn acknowledge(&self, message: &str) -> Result<()> {
        self.asked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
        Ok(())
    }
}
