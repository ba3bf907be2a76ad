use anyhow::Result;
use clap::Parser;
use std::fs;
use std::sync::Mutex;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use realmshift::commands;
use realmshift::config::Config;
use realmshift::output::Output;
use realmshift::{Cli, Commands, MigrationError};

/// Commands that change the host keep a persistent log.
fn wants_log_file(command: &Commands) -> bool {
    match command {
        Commands::Migrate(args) => !args.dry_run,
        Commands::Automate(_) => true,
        Commands::Verify(_) | Commands::Status(_) | Commands::Completions(_) => false,
    }
}

/// Initialize tracing: RUST_LOG-filtered stderr, plus an info-level log file.
fn init_tracing(config: Option<&Config>) {
    let stderr = fmt::layer().with_writer(std::io::stderr).with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .from_env_lossy(),
    );

    let log_path = config.map(Config::log_file);
    let opened = log_path.as_deref().map(|path| {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::OpenOptions::new().create(true).append(true).open(path)
    });

    let (file, failure) = match opened {
        Some(Ok(handle)) => (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(handle))
                    .with_filter(LevelFilter::INFO),
            ),
            None,
        ),
        Some(Err(err)) => (None, Some(err)),
        None => (None, None),
    };

    tracing_subscriber::registry().with(stderr).with(file).init();

    if let (Some(err), Some(path)) = (failure, log_path) {
        tracing::warn!(%err, path = %path.display(), "Log file unavailable; logging to stderr only");
    }
}

fn dispatch(cli: Cli, config: &Config) -> Result<i32> {
    match cli.command {
        Commands::Migrate(args) => commands::migrate::run(args, config),
        Commands::Automate(args) => commands::automate::run(args, config),
        Commands::Verify(args) => commands::verify::run(args, config),
        Commands::Status(args) => commands::status::run(args, config).map(|()| 0),
        Commands::Completions(args) => commands::completions::run(args).map(|()| 0),
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<MigrationError>())
        .map(MigrationError::exit_code)
        .unwrap_or(1)
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref(), cli.root.clone()) {
        Ok(config) => config,
        Err(err) => {
            init_tracing(None);
            Output::error(format!("{err:#}"));
            std::process::exit(2);
        }
    };

    init_tracing(wants_log_file(&cli.command).then_some(&config));
    tracing::debug!(root = %config.root.display(), "Configuration loaded");

    let code = match dispatch(cli, &config) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "Command failed");
            Output::error(format!("{err:#}"));
            exit_code(&err)
        }
    };
    std::process::exit(code);
}
