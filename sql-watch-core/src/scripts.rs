//! Script files on disk and the embedded scripts that provision the state schema.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::placeholder::{replace_placeholders, schema_placeholders};

/// Where a script's SQL comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    File(PathBuf),
    Embedded(String),
}

/// A single SQL script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// File name, used for ordering and in log lines.
    pub name: String,
    /// Last modification time, compared against the run cutoff.
    pub modified: DateTime<Utc>,
    pub source: ScriptSource,
}

impl Script {
    /// The SQL text of the script.
    pub fn read(&self) -> Result<String> {
        match self.source {
            ScriptSource::File(ref path) => Ok(std::fs::read_to_string(path)?),
            ScriptSource::Embedded(ref sql) => Ok(sql.clone()),
        }
    }
}

/// List the regular files in `dir`, sorted by name.
///
/// Subdirectories are not descended into.
pub fn list_scripts(dir: &Path) -> Result<Vec<Script>> {
    let mut scripts = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        scripts.push(Script {
            name,
            modified: DateTime::<Utc>::from(metadata.modified()?),
            source: ScriptSource::File(entry.path()),
        });
    }
    scripts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(scripts)
}

const CREATE_SCHEMA: &str = r#"
CREATE SCHEMA IF NOT EXISTS ${schema};
"#;

const CREATE_ENVIRONMENT: &str = r#"
CREATE TABLE IF NOT EXISTS ${schema}.environment (
    environment TEXT NOT NULL
);

INSERT INTO ${schema}.environment (environment)
SELECT 'production'
WHERE NOT EXISTS (SELECT 1 FROM ${schema}.environment);
"#;

const CREATE_RUN: &str = r#"
CREATE TABLE IF NOT EXISTS ${schema}.run (
    id        BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY,
    ran_at    TIMESTAMPTZ NOT NULL,
    meta_data JSONB NOT NULL
);

ALTER TABLE ${schema}.run ADD COLUMN IF NOT EXISTS id BIGINT GENERATED BY DEFAULT AS IDENTITY;

CREATE INDEX IF NOT EXISTS run_ran_at_idx ON ${schema}.run (ran_at);
"#;

const CREATE_LAST_RUN: &str = r#"
CREATE OR REPLACE VIEW ${schema}.last_run AS
SELECT ran_at
FROM ${schema}.run
ORDER BY id DESC
LIMIT 1;
"#;

/// The scripts that create or update the state schema, with `${schema}` expanded.
pub fn bootstrap_scripts(schema: &str) -> Result<Vec<Script>> {
    let placeholders = schema_placeholders(schema)?;
    [
        ("001_schema.sql", CREATE_SCHEMA),
        ("002_environment.sql", CREATE_ENVIRONMENT),
        ("003_run.sql", CREATE_RUN),
        ("004_last_run.sql", CREATE_LAST_RUN),
    ]
    .into_iter()
    .map(|(name, sql)| {
        Ok(Script {
            name: name.to_string(),
            modified: DateTime::<Utc>::UNIX_EPOCH,
            source: ScriptSource::Embedded(replace_placeholders(sql, &placeholders)?),
        })
    })
    .collect()
}
