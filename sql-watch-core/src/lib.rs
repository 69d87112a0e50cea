//! Incremental SQL script runner for PostgreSQL.
//!
//! Scripts live in ordered role directories under one root (reset, pre-run,
//! run, seed, post-run). Each cycle applies pre-run and post-run scripts in
//! full and applies run scripts from the first one modified since the last
//! recorded run. Run state is kept in a dedicated schema.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//!
//! use sql_watch_core::config::{CliOverrides, SqlWatchConfig};
//! use sql_watch_core::{Prompt, SqlWatch};
//!
//! struct Decline;
//!
//! impl Prompt for Decline {
//!     fn ask(&mut self, _message: &str) -> sql_watch_core::Result<String> {
//!         Ok(String::new())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let env: HashMap<String, String> = std::env::vars().collect();
//! let config = SqlWatchConfig::load(None, &CliOverrides::default(), &env)?;
//! let mut engine = SqlWatch::connect(&config, &env, Decline).await?;
//! engine.run(false, None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`config`]: Configuration loading (TOML, CLI overrides, environment)
//! - [`db`]: Database sessions, TLS, retries, server notices
//! - [`tunnel`]: SSH port forwarding to a remote database
//! - [`directories`]: Role directory resolution and creation
//! - [`scripts`]: Script listing and the embedded state schema scripts
//! - [`selector`]: Extension and test-file filtering
//! - [`placeholder`]: `${key}` placeholder replacement in SQL
//! - [`store`]: Environment and run history in the state schema
//! - [`diagnostics`]: Error line location and context rendering
//! - [`engine`]: The run cycle, reset confirmation, and initialization
//! - [`watch`]: Filesystem events feeding the engine
//! - [`error`]: Error types

pub mod config;
pub mod db;
pub mod diagnostics;
pub mod directories;
pub mod engine;
pub mod error;
pub mod placeholder;
pub mod scripts;
pub mod selector;
pub mod store;
pub mod tunnel;
pub mod watch;

#[cfg(test)]
mod testing;

pub use config::{CliOverrides, Environment, SqlWatchConfig, TestPolicy};
pub use db::{Database, PgSession};
pub use engine::{Continuation, Prompt, SqlWatch, RESET_CONFIRMATION};
pub use error::{DbError, DbErrorKind, Result, SqlWatchError};
pub use watch::{ScriptWatcher, WatchEvent};
