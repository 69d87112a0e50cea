//! The run engine: applies reset, pre-run, run, seed and post-run scripts in
//! order, skipping scripts older than the last recorded run.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::config::{resolve_connection, Environment, RunContext, RunOptions, SqlWatchConfig};
use crate::db::{Database, PgSession};
use crate::diagnostics;
use crate::directories::{RoleDir, ScriptDirectories};
use crate::error::{Result, SqlWatchError};
use crate::scripts::{bootstrap_scripts, list_scripts, Script};
use crate::selector::FileSelector;
use crate::store::{RunMetadata, RunStateStore};

/// The exact phrase that confirms a reset outside the safe environments.
pub const RESET_CONFIRMATION: &str = "DESTROY IT ALL";

/// Label used for the embedded bootstrap scripts in diagnostics.
const BOOTSTRAP_LABEL: &str = "bootstrap";

/// Asks the operator a question and returns the typed answer.
pub trait Prompt {
    fn ask(&mut self, message: &str) -> Result<String>;
}

/// What the caller should do after a run returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Watch mode is on; keep the process alive and feed file events.
    Watching,
    /// The session is over and the database connection is closed.
    Done,
}

/// Result of one cycle, before the session-end decision.
enum Cycle {
    Completed,
    NotInitialized,
}

struct ResetOutcome {
    started: Option<Instant>,
    skip: bool,
}

/// Applies script directories to one database.
pub struct SqlWatch<D: Database, P: Prompt> {
    db: D,
    prompt: P,
    directories: ScriptDirectories,
    selector: FileSelector,
    options: RunOptions,
    context: RunContext,
    redacted_uri: String,
    bootstrapped: bool,
    closed: bool,
}

impl<P: Prompt> SqlWatch<PgSession, P> {
    /// Resolve the connection, create the script directories, then connect.
    ///
    /// A bad connection configuration fails before any directory is created.
    pub async fn connect(
        config: &SqlWatchConfig,
        env: &HashMap<String, String>,
        prompt: P,
    ) -> Result<Self> {
        let connection = resolve_connection(&config.database, &config.tunnel, env)?;
        let directories = prepare_directories(config)?;
        let db = PgSession::connect(&connection).await?;
        Ok(Self::assemble(
            db,
            prompt,
            directories,
            config,
            connection.redacted_uri(),
        ))
    }
}

fn prepare_directories(config: &SqlWatchConfig) -> Result<ScriptDirectories> {
    let directories = ScriptDirectories::resolve(&config.directories)?;
    directories.create_all()?;
    Ok(directories)
}

impl<D: Database, P: Prompt> SqlWatch<D, P> {
    /// Build an engine around an existing database backend.
    pub fn with_backend(
        db: D,
        prompt: P,
        config: &SqlWatchConfig,
        redacted_uri: impl Into<String>,
    ) -> Result<Self> {
        let directories = prepare_directories(config)?;
        Ok(Self::assemble(
            db,
            prompt,
            directories,
            config,
            redacted_uri.into(),
        ))
    }

    fn assemble(
        db: D,
        prompt: P,
        directories: ScriptDirectories,
        config: &SqlWatchConfig,
        redacted_uri: String,
    ) -> Self {
        let options = config.options.clone();
        let selector = FileSelector::new(
            options.extensions.clone(),
            options.test_extensions.clone(),
            options.run_tests.clone(),
        );
        Self {
            db,
            prompt,
            directories,
            selector,
            options,
            context: config.context.clone(),
            redacted_uri,
            bootstrapped: false,
            closed: false,
        }
    }

    pub fn directories(&self) -> &ScriptDirectories {
        &self.directories
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn prompt(&self) -> &P {
        &self.prompt
    }

    fn store(&self) -> RunStateStore<'_, D> {
        RunStateStore::new(&self.db, &self.options.schema_name)
    }

    /// Run one cycle.
    ///
    /// `ignore_cutoff` applies every run script regardless of modification
    /// time. `changed` is the file that triggered the cycle in watch mode.
    ///
    /// Database errors are logged and do not end a watch session. Any other
    /// error closes the session and is returned.
    pub async fn run(&mut self, ignore_cutoff: bool, changed: Option<&Path>) -> Result<Continuation> {
        let outcome = match self.options.init {
            Some(environment) => self.initialize(environment).await.map(|_| Cycle::Completed),
            None => self.cycle(ignore_cutoff, changed).await,
        };

        match outcome {
            Ok(Cycle::Completed) => {}
            Ok(Cycle::NotInitialized) => {
                self.shutdown().await;
                return Ok(Continuation::Done);
            }
            Err(SqlWatchError::ScriptFailed { .. }) => {}
            Err(SqlWatchError::Database(ref e)) => log::error!("{}", e),
            Err(e) => {
                log::error!("{} {}", e.name(), e);
                self.shutdown().await;
                return Err(e);
            }
        }

        if self.options.init.is_some() || !self.options.watch {
            self.shutdown().await;
            Ok(Continuation::Done)
        } else {
            log::info!("Waiting for changes");
            Ok(Continuation::Watching)
        }
    }

    /// Close the database session. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if !self.closed {
            self.db.close().await;
            self.closed = true;
        }
    }

    async fn initialize(&mut self, environment: Environment) -> Result<()> {
        self.directories.create_all()?;

        if !self.bootstrapped {
            log::debug!(
                "Installing state schema; schema={}",
                self.options.schema_name
            );
            let scripts = bootstrap_scripts(&self.options.schema_name)?;
            self.run_scripts(
                BOOTSTRAP_LABEL,
                BOOTSTRAP_LABEL,
                scripts,
                &FileSelector::default(),
                DateTime::<Utc>::UNIX_EPOCH,
                true,
                true,
            )
            .await?;
            self.bootstrapped = true;
        }

        let store = self.store();
        store.set_environment(environment).await?;
        let recorded = store.environment().await?;

        let schema = &self.options.schema_name;
        log::info!("Sql Watch successfully:");
        log::info!(
            "  * created/updated the {} schema in {}",
            schema,
            self.redacted_uri
        );
        log::info!(
            "  * set the environment in {}.environment to '{}'.",
            schema,
            recorded
        );
        log::info!(
            "  * created/updated required script directories in '{}'.",
            self.directories.root_label
        );
        Ok(())
    }

    async fn cycle(&mut self, ignore_cutoff: bool, changed: Option<&Path>) -> Result<Cycle> {
        let started = Instant::now();

        if !self.store().verify_initialized().await? {
            return Ok(Cycle::NotInitialized);
        }
        let cutoff = self.store().last_run_time().await?;

        let mut ignore = ignore_cutoff || self.options.always_run || self.options.reset;
        if let Some(changed) = changed {
            if self
                .directories
                .pre_run
                .as_ref()
                .is_some_and(|dir| dir.contains(changed))
            {
                ignore = true;
            }
            if !self.options.seed
                && self
                    .directories
                    .seed
                    .as_ref()
                    .is_some_and(|dir| dir.contains(changed))
            {
                log::warn!(
                    "Seed file {} was edited but the seed option was not set; changes were not applied",
                    changed.display()
                );
            }
        }

        let reset = self.do_reset().await?;
        let started = reset.started.unwrap_or(started);

        if !reset.skip {
            if let Some(ref dir) = self.directories.pre_run {
                self.apply_directory(dir, DateTime::<Utc>::UNIX_EPOCH, false)
                    .await?;
            }

            let applied = self
                .apply_directory(&self.directories.run, cutoff, ignore)
                .await?;

            // A first run, or a run that changed the schema, re-applies all seeds.
            let seed_ignore = changed.is_none() || applied || ignore;
            self.apply_seed(cutoff, seed_ignore).await?;

            if let Some(ref dir) = self.directories.post_run {
                self.apply_directory(dir, DateTime::<Utc>::UNIX_EPOCH, false)
                    .await?;
            }

            self.record_run(Utc::now()).await?;
        }

        log::info!("Finished in {} ms", started.elapsed().as_millis());
        Ok(Cycle::Completed)
    }

    async fn do_reset(&mut self) -> Result<ResetOutcome> {
        let mut outcome = ResetOutcome {
            started: None,
            skip: false,
        };
        if !self.options.reset {
            return Ok(outcome);
        }

        let environment = self.store().environment().await?;
        let proceed = if environment.allows_unattended_reset() {
            log::info!("Resetting database");
            true
        } else if self.options.bypass {
            log::info!(
                "Resetting database in the '{}' environment (prompt bypassed)",
                environment
            );
            true
        } else {
            let warning = match environment {
                Environment::Production => {
                    "Resetting database in PRODUCTION environment!!!".to_string()
                }
                other => format!("Resetting database in the '{}' environment.", other),
            };
            let message = format!(
                "WARNING! {} Type '{}' to continue.",
                warning, RESET_CONFIRMATION
            );
            if self.prompt.ask(&message)? == RESET_CONFIRMATION {
                log::info!("Resetting database in production");
                true
            } else {
                log::info!("Reset cancelled");
                false
            }
        };

        if proceed {
            outcome.started = Some(Instant::now());
            match self.directories.reset {
                Some(ref dir) => {
                    self.apply_directory(dir, DateTime::<Utc>::UNIX_EPOCH, false)
                        .await?;
                    self.record_run(DateTime::<Utc>::UNIX_EPOCH).await?;
                }
                None => log::warn!(
                    "The reset directory must be configured for reset to work. Please review the directory settings."
                ),
            }
        } else {
            outcome.skip = true;
        }

        if !self.options.watch {
            outcome.skip = true;
        }
        Ok(outcome)
    }

    async fn apply_seed(&self, cutoff: DateTime<Utc>, ignore: bool) -> Result<()> {
        match self.directories.seed {
            Some(ref dir) if self.options.seed => {
                self.apply_directory(dir, cutoff, ignore).await?;
            }
            Some(ref dir) => {
                if self.options.verbose {
                    log::info!("SKIPPED {}: all (seed option was false)", dir.label);
                }
            }
            None if self.options.verbose => {
                let reason = if self.options.seed {
                    "no seed directory is configured"
                } else {
                    "seed option was false"
                };
                log::info!("SKIPPED {}: all ({})", self.directories.root_label, reason);
            }
            None => {}
        }
        Ok(())
    }

    async fn record_run(&self, ran_at: DateTime<Utc>) -> Result<()> {
        let store = self.store();
        let environment = store.environment().await?;
        let meta = RunMetadata::new(&self.context, environment, &self.options);
        store.record_run(ran_at, &meta).await
    }

    async fn apply_directory(
        &self,
        dir: &RoleDir,
        cutoff: DateTime<Utc>,
        ignore: bool,
    ) -> Result<bool> {
        let location = dir.path.display().to_string();
        log::debug!(
            "Running {}sql in directory {}",
            if ignore { "all " } else { "" },
            location
        );
        let scripts = list_scripts(&dir.path)?;
        if scripts.is_empty() {
            log::debug!("No SQL files were found in {}", location);
        }
        self.run_scripts(
            &dir.label,
            &location,
            scripts,
            &self.selector,
            cutoff,
            ignore,
            false,
        )
        .await
    }

    /// Apply the selected scripts in name order.
    ///
    /// Once one script is at or after `cutoff`, every later script is applied
    /// too. Returns whether anything was applied.
    #[allow(clippy::too_many_arguments)]
    async fn run_scripts(
        &self,
        label: &str,
        location: &str,
        scripts: Vec<Script>,
        selector: &FileSelector,
        cutoff: DateTime<Utc>,
        ignore: bool,
        silent: bool,
    ) -> Result<bool> {
        let names: Vec<&str> = scripts.iter().map(|s| s.name.as_str()).collect();
        let selected: HashSet<String> = selector.select(&names)?.into_iter().collect();
        let scripts: Vec<Script> = scripts
            .into_iter()
            .filter(|s| selected.contains(&s.name))
            .collect();
        if scripts.is_empty() {
            log::debug!(
                "No SQL files were found in {} after running filters.",
                location
            );
            return Ok(false);
        }

        let mut migrating = false;
        let mut applied = false;
        for script in &scripts {
            if !migrating && script.modified >= cutoff {
                migrating = true;
            }
            if migrating || ignore {
                self.apply_script(label, script).await?;
                applied = true;
                if !silent {
                    log::info!("APPLIED {}/{}", label, script.name);
                }
            } else if !silent && self.options.verbose {
                log::info!("SKIPPED {}/{}", label, script.name);
            }
        }
        Ok(applied)
    }

    async fn apply_script(&self, label: &str, script: &Script) -> Result<()> {
        let sql = script.read()?;
        if let Err(e) = self.db.execute_script(&sql).await {
            let file = format!("{}/{}", label, script.name);
            diagnostics::report(&file, &sql, &e, self.options.verbose);
            return Err(SqlWatchError::ScriptFailed {
                script: file,
                source: e,
            });
        }
        Ok(())
    }
}
