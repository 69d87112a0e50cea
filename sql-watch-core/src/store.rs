//! Run state kept in the database: the environment row, the run history,
//! and the last run time derived from it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{Environment, RunContext, RunOptions, TestPolicy};
use crate::db::Database;
use crate::error::{DbErrorKind, Result};

/// Metadata stored as JSON with each run record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub username: String,
    pub email: String,
    pub process_environment: String,
    pub environment: Environment,
    pub working_directory: String,
    pub options: RunFlags,
}

/// The options that shaped a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFlags {
    pub reset: bool,
    pub watch: bool,
    pub bypass: bool,
    pub always_run: bool,
    pub level: String,
    pub run_tests: TestPolicy,
}

impl RunMetadata {
    pub fn new(context: &RunContext, environment: Environment, options: &RunOptions) -> Self {
        Self {
            username: context.username.clone(),
            email: context.email.clone(),
            process_environment: context.process_environment.clone(),
            environment,
            working_directory: context.working_directory.clone(),
            options: RunFlags {
                reset: options.reset,
                watch: options.watch,
                bypass: options.bypass,
                always_run: options.always_run,
                level: options.log_level.clone(),
                run_tests: options.run_tests.clone(),
            },
        }
    }
}

/// Reads and writes run state in one schema.
pub struct RunStateStore<'a, D> {
    db: &'a D,
    schema: &'a str,
}

impl<'a, D: Database> RunStateStore<'a, D> {
    pub fn new(db: &'a D, schema: &'a str) -> Self {
        Self { db, schema }
    }

    /// Whether the environment table exists.
    ///
    /// A missing relation is logged and reported as `false`. Other errors propagate.
    pub async fn verify_initialized(&self) -> Result<bool> {
        match self.db.select_environment(self.schema).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind == DbErrorKind::UndefinedRelation => {
                log::error!(
                    "sql-watch has not been initialized. Please run sql-watch --init <environment>. If you feel this is in error please check and verify that the {}.environment table exists and has a valid environment entry",
                    self.schema
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The recorded environment, defaulting to production.
    pub async fn environment(&self) -> Result<Environment> {
        let rows = self.db.select_environment(self.schema).await?;
        let Some(value) = rows.first() else {
            log::warn!(
                "{}.environment had no records when it should contain at least one record. Defaulting environment setting to production",
                self.schema
            );
            return Ok(Environment::Production);
        };
        match value.parse::<Environment>() {
            Ok(environment) => Ok(environment),
            Err(_) => {
                log::warn!(
                    "{}.environment contains unknown environment '{}'. Defaulting environment setting to production",
                    self.schema,
                    value
                );
                Ok(Environment::Production)
            }
        }
    }

    /// Time of the most recently recorded run, or the epoch if none.
    pub async fn last_run_time(&self) -> Result<DateTime<Utc>> {
        let ran_at = self.db.select_last_run(self.schema).await?;
        Ok(ran_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH))
    }

    /// Append a run record.
    pub async fn record_run(&self, ran_at: DateTime<Utc>, meta_data: &RunMetadata) -> Result<()> {
        let value = serde_json::to_value(meta_data).map_err(|e| {
            crate::error::SqlWatchError::ConfigError(format!(
                "Failed to serialize run metadata: {}",
                e
            ))
        })?;
        self.db.insert_run(self.schema, ran_at, &value).await?;
        log::debug!("Recorded run; ran_at={}", ran_at.to_rfc3339());
        Ok(())
    }

    /// Overwrite the environment row.
    pub async fn set_environment(&self, environment: Environment) -> Result<()> {
        self.db
            .update_environment(self.schema, environment.as_str())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDatabase;

    #[tokio::test]
    async fn test_uninitialized_store() {
        let db = MemoryDatabase::default();
        let store = RunStateStore::new(&db, "sql_watch");
        assert!(!store.verify_initialized().await.unwrap());
    }

    #[tokio::test]
    async fn test_other_errors_propagate_from_verify() {
        let db = MemoryDatabase::initialized(&["development"]);
        db.fail_selects_with_closed_connection();
        let store = RunStateStore::new(&db, "sql_watch");
        let err = store.verify_initialized().await.unwrap_err();
        assert!(err.is_database_error());
    }

    #[tokio::test]
    async fn test_empty_environment_defaults_to_production() {
        let db = MemoryDatabase::initialized(&[]);
        let store = RunStateStore::new(&db, "sql_watch");
        assert!(store.verify_initialized().await.unwrap());
        assert_eq!(store.environment().await.unwrap(), Environment::Production);
    }

    #[tokio::test]
    async fn test_unknown_environment_defaults_to_production() {
        let db = MemoryDatabase::initialized(&["qa"]);
        let store = RunStateStore::new(&db, "sql_watch");
        assert_eq!(store.environment().await.unwrap(), Environment::Production);
    }

    #[tokio::test]
    async fn test_set_environment() {
        let db = MemoryDatabase::initialized(&["production"]);
        let store = RunStateStore::new(&db, "sql_watch");
        store.set_environment(Environment::Staging).await.unwrap();
        assert_eq!(store.environment().await.unwrap(), Environment::Staging);
    }

    #[tokio::test]
    async fn test_last_run_time_defaults_to_epoch() {
        let db = MemoryDatabase::initialized(&["development"]);
        let store = RunStateStore::new(&db, "sql_watch");
        assert_eq!(
            store.last_run_time().await.unwrap(),
            DateTime::<Utc>::UNIX_EPOCH
        );
    }

    #[tokio::test]
    async fn test_last_run_is_most_recently_recorded() {
        let db = MemoryDatabase::initialized(&["development"]);
        let store = RunStateStore::new(&db, "sql_watch");
        let meta = RunMetadata::new(
            &RunContext::default(),
            Environment::Development,
            &RunOptions::default(),
        );

        let now = Utc::now();
        store.record_run(now, &meta).await.unwrap();
        store
            .record_run(DateTime::<Utc>::UNIX_EPOCH, &meta)
            .await
            .unwrap();

        assert_eq!(
            store.last_run_time().await.unwrap(),
            DateTime::<Utc>::UNIX_EPOCH
        );
        assert_eq!(db.runs().len(), 2);
    }

    #[test]
    fn test_metadata_json_shape() {
        let context = RunContext {
            username: "ops".to_string(),
            email: "ops@example.com".to_string(),
            process_environment: "not set".to_string(),
            working_directory: "/srv/app".to_string(),
        };
        let options = RunOptions {
            reset: true,
            always_run: true,
            ..Default::default()
        };
        let meta = RunMetadata::new(&context, Environment::Test, &options);
        let value = serde_json::to_value(&meta).unwrap();

        assert_eq!(value["username"], "ops");
        assert_eq!(value["processEnvironment"], "not set");
        assert_eq!(value["environment"], "test");
        assert_eq!(value["workingDirectory"], "/srv/app");
        assert_eq!(value["options"]["reset"], true);
        assert_eq!(value["options"]["alwaysRun"], true);
        assert_eq!(value["options"]["level"], "info");
        assert_eq!(value["options"]["runTests"], "always");
    }
}
