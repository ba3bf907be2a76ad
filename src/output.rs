//! Output helpers for consistent CLI output.
//!
//! Status lines with coloured prefixes, step banners, and a spinner for the
//! long blocking installs.
//!
//! # Example
//!
//! ```rust,ignore
//! use realmshift::output::Output;
//!
//! Output::step_banner(9, 23, "Join new domain");
//! Output::warning("Anonymous discovery rejected; continuing with join");
//!
//! let spinner = Output::spinner("Installing packages...");
//! // ... apt-get ...
//! spinner.finish_success("Packages installed");
//! ```

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::borrow::Cow;
use std::time::Duration;

/// Standard output helper for consistent CLI formatting.
pub struct Output;

impl Output {
    /// `✓ Joined newco.local`
    pub fn success(msg: impl AsRef<str>) {
        println!("{} {}", "✓".green().bold(), msg.as_ref());
    }

    /// Print an error message with a red X to stderr.
    pub fn error(msg: impl AsRef<str>) {
        eprintln!("{} {}", "✗".red().bold(), msg.as_ref().red());
    }

    /// `⚠ realm leave failed; host was not joined`
    pub fn warning(msg: impl AsRef<str>) {
        println!("{} {}", "⚠".yellow(), msg.as_ref());
    }

    /// `→ Reading /etc/os-release...`
    pub fn info(msg: impl AsRef<str>) {
        println!("{} {}", "→".cyan(), msg.as_ref().dimmed());
    }

    /// Print an indented sub-action of the current step.
    pub fn step(msg: impl AsRef<str>) {
        println!("  {} {}", "•".cyan(), msg.as_ref());
    }

    /// `[09/23] Join new domain`
    pub fn step_banner(ordinal: u32, total: u32, name: impl AsRef<str>) {
        println!(
            "\n{} {}",
            format!("[{:02}/{:02}]", ordinal, total).cyan().bold(),
            name.as_ref().bold()
        );
    }

    /// Print a header/section title.
    pub fn header(msg: impl AsRef<str>) {
        println!("\n{}\n", msg.as_ref().bold().cyan());
    }

    /// Print a subheader for sections within output.
    pub fn subheader(msg: impl AsRef<str>) {
        println!("{}", msg.as_ref().bold());
    }

    /// Print an item in a list (indented).
    pub fn list_item(msg: impl AsRef<str>) {
        println!("  {}", msg.as_ref());
    }

    /// `  Domain:        newco.local`
    pub fn kv(key: impl AsRef<str>, value: impl AsRef<str>) {
        println!("  {:<14} {}", format!("{}:", key.as_ref()).cyan(), value.as_ref());
    }

    /// `  → Run: realmshift migrate --revert`
    pub fn hint(msg: impl AsRef<str>) {
        println!("  {} {}", "→".cyan(), msg.as_ref());
    }

    /// `[DRY-RUN] Write /etc/hosts: map ws01.newco.local`
    pub fn dry_run(msg: impl AsRef<str>) {
        println!("  {} {}", "[DRY-RUN]".yellow(), msg.as_ref().dimmed());
    }

    /// Create a spinner for long-running blocking operations.
    pub fn spinner(msg: impl Into<Cow<'static, str>>) -> Spinner {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(msg);
        pb.enable_steady_tick(Duration::from_millis(80));
        Spinner(pb)
    }

    /// Print a blank line.
    pub fn blank() {
        println!();
    }
}

/// A spinner for long-running operations.
///
/// Created via `Output::spinner()`.
pub struct Spinner(ProgressBar);

impl Spinner {
    /// Finish with a success message.
    pub fn finish_success(self, msg: impl AsRef<str>) {
        self.0
            .finish_with_message(format!("{} {}", "✓".green().bold(), msg.as_ref()));
    }

    /// Finish with a warning message.
    pub fn finish_warning(self, msg: impl AsRef<str>) {
        self.0
            .finish_with_message(format!("{} {}", "⚠".yellow(), msg.as_ref()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_methods_dont_panic() {
        Output::success("test");
        Output::error("test");
        Output::warning("test");
        Output::info("test");
        Output::step("test");
        Output::step_banner(1, 23, "Check system");
        Output::hint("test");
        Output::dry_run("test");
        Output::kv("key", "value");
        Output::blank();
    }

    #[test]
    fn test_spinner_lifecycle() {
        let spinner = Output::spinner("Testing...");
        spinner.finish_success("Done");
    }
}
