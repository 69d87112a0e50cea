//! CLI entry point for sql-watch.
//! Parses flags, sets up `LEVEL: message` logging, runs one cycle and, in
//! watch mode, keeps feeding file events to the engine.

mod prompt;

use std::collections::HashMap;
use std::io::Write;
use std::process;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;

use sql_watch_core::config::{CliOverrides, Environment, SqlWatchConfig};
use sql_watch_core::error::SqlWatchError;
use sql_watch_core::watch::{self, ScriptWatcher};
use sql_watch_core::{Continuation, SqlWatch};

use prompt::TerminalPrompt;

/// Command line flags.
#[derive(Parser)]
#[command(
    name = "sql-watch",
    about = "Apply new and changed SQL scripts to PostgreSQL, optionally watching for changes",
    version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("GIT_HASH"), " ", env!("BUILD_TIME"), ")"
    )
)]
struct Cli {
    /// Keep running and apply scripts as they change
    #[arg(short, long)]
    watch: bool,

    /// Apply every script in the run directory, not only changed ones
    #[arg(short, long)]
    always_run: bool,

    /// Skip the reset confirmation prompt
    #[arg(short, long)]
    bypass: bool,

    /// Log skipped scripts and whole files on errors
    #[arg(short, long)]
    verbose: bool,

    /// Log level: error, warn, info, debug
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Create the state schema and set the environment: development, staging, production, test, other
    #[arg(short, long, value_name = "ENVIRONMENT")]
    init: Option<String>,

    /// Apply the reset directory first
    #[arg(short, long)]
    reset: bool,

    /// Apply seed scripts
    #[arg(short, long)]
    seed: bool,

    /// When to apply test scripts: always, only, skip
    #[arg(short = 't', long, value_name = "POLICY")]
    run_tests: Option<String>,

    /// Config file path
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Schema holding sql-watch state (overrides config)
    #[arg(long, value_name = "SCHEMA")]
    schema_name: Option<String>,

    /// Script root directory (overrides config)
    #[arg(long, value_name = "DIR")]
    root: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = cli.log_level.clone().unwrap_or_else(|| "info".to_string());
    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or(filter))
        .format(|buf, record| writeln!(buf, "{}: {}", record.level(), record.args()))
        .init();

    if let Err(e) = run(cli).await {
        print_error(&e);
        process::exit(1);
    }
}

/// Build configuration, connect, and drive the engine until it is done.
async fn run(cli: Cli) -> Result<(), SqlWatchError> {
    let env: HashMap<String, String> = std::env::vars().collect();

    let init = cli
        .init
        .as_deref()
        .map(str::parse::<Environment>)
        .transpose()?;

    let overrides = CliOverrides {
        reset: cli.reset,
        watch: cli.watch,
        bypass: cli.bypass,
        always_run: cli.always_run,
        verbose: cli.verbose,
        seed: cli.seed,
        init,
        run_tests: cli.run_tests,
        log_level: cli.log_level,
        schema_name: cli.schema_name,
        root: cli.root,
    };

    let config = SqlWatchConfig::load(cli.config.as_deref(), &overrides, &env)?;
    let mut engine = SqlWatch::connect(&config, &env, TerminalPrompt).await?;

    // Start watching before the first run so edits made during it are not lost.
    let mut watcher = if config.options.watch && config.options.init.is_none() {
        let settle = Duration::from_millis(config.watch.settle_ms);
        match ScriptWatcher::start(&engine.directories().root, settle) {
            Ok(w) => Some(w),
            Err(e) => {
                engine.shutdown().await;
                return Err(e);
            }
        }
    } else {
        None
    };

    if engine.run(false, None).await? == Continuation::Done {
        return Ok(());
    }

    if let Some(ref mut watcher) = watcher {
        watch::watch(&mut engine, watcher).await?;
    }
    engine.shutdown().await;
    Ok(())
}

/// Print a formatted error message with actionable hints to stderr.
fn print_error(error: &SqlWatchError) {
    eprintln!("{} {}", "ERROR:".red().bold(), error);

    match error {
        SqlWatchError::ConfigError(_) => {
            eprintln!(
                "{}",
                "Hint: Check sql-watch.toml or the PGHOST, PGPORT, PGUSER, PGPASSWORD and PGDATABASE environment variables."
                    .dimmed()
            );
        }
        SqlWatchError::Database(_) => {
            eprintln!(
                "{}",
                "Hint: Verify database is running and connection details are correct.".dimmed()
            );
        }
        SqlWatchError::TunnelError(_) => {
            eprintln!(
                "{}",
                "Hint: Check SSH_HOST, SSH_PORT, SSH_USER and SSH_PRIVATE_KEY_PATH, and that `ssh` is on the PATH."
                    .dimmed()
            );
        }
        SqlWatchError::WatchError(_) => {
            eprintln!(
                "{}",
                "Hint: The system limit on watched files may be too low for the script root.".dimmed()
            );
        }
        _ => {}
    }
}
