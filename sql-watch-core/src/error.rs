//! Error types for sql-watch operations.

use std::fmt;

use thiserror::Error;
use tokio_postgres::error::ErrorPosition;

/// SQLSTATE for `syntax_error`.
const SYNTAX_ERROR: &str = "42601";
/// SQLSTATE for `undefined_table`, reported when a relation does not exist.
const UNDEFINED_TABLE: &str = "42P01";

/// Broad classification of a database failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    SyntaxError,
    UndefinedRelation,
    ConnectionClosed,
    Other,
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbErrorKind::SyntaxError => write!(f, "SyntaxError"),
            DbErrorKind::UndefinedRelation => write!(f, "UndefinedRelation"),
            DbErrorKind::ConnectionClosed => write!(f, "ConnectionClosed"),
            DbErrorKind::Other => write!(f, "DatabaseError"),
        }
    }
}

/// A structured database error, detached from the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    pub kind: DbErrorKind,
    /// SQLSTATE code, empty when the server did not send one.
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based character position of the error within `query`.
    pub position: Option<u32>,
    /// The SQL text that was submitted, when known.
    pub query: Option<String>,
}

impl DbError {
    /// Build an error with only a kind, code, and message.
    pub fn new(kind: DbErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
            query: None,
        }
    }

    /// The error returned when the session has already been shut down.
    pub fn closed() -> Self {
        Self::new(
            DbErrorKind::ConnectionClosed,
            "08003",
            "The database connection has been closed",
        )
    }

    /// Attach the submitted SQL text.
    pub fn with_query(mut self, query: &str) -> Self {
        self.query = Some(query.to_string());
        self
    }

    /// Attach a 1-based error position.
    pub fn with_position(mut self, position: u32) -> Self {
        self.position = Some(position);
        self
    }

    /// Classify a driver error.
    pub fn from_pg(e: &tokio_postgres::Error) -> Self {
        if let Some(db_err) = e.as_db_error() {
            let code = db_err.code().code();
            let kind = match code {
                SYNTAX_ERROR => DbErrorKind::SyntaxError,
                UNDEFINED_TABLE => DbErrorKind::UndefinedRelation,
                _ => DbErrorKind::Other,
            };
            let (position, detail) = script_position(db_err.position(), db_err.detail());
            return Self {
                kind,
                code: code.to_string(),
                message: db_err.message().to_string(),
                detail,
                hint: db_err.hint().map(str::to_string),
                position,
                query: None,
            };
        }

        // Fallback: walk the source chain
        let mut msg = e.to_string();
        let mut source = std::error::Error::source(e);
        while let Some(s) = source {
            msg.push_str(&format!(": {}", s));
            source = s.source();
        }
        let kind = if e.is_closed() {
            DbErrorKind::ConnectionClosed
        } else {
            DbErrorKind::Other
        };
        Self::new(kind, "", msg)
    }
}

/// The position within the submitted script, plus the detail to report.
///
/// An internal position points into a query the server built itself (a
/// statement inside a function or `DO` body), so it says nothing about the
/// script's lines. That query is appended to the detail instead.
fn script_position(
    position: Option<&ErrorPosition>,
    detail: Option<&str>,
) -> (Option<u32>, Option<String>) {
    match position {
        Some(ErrorPosition::Original(p)) => (Some(*p), detail.map(str::to_string)),
        Some(ErrorPosition::Internal { position, query }) => {
            let internal = format!("Internal query (position {}): {}", position, query);
            let detail = match detail {
                Some(d) => format!("{}\n{}", d, internal),
                None => internal,
            };
            (None, Some(detail))
        }
        None => (None, detail.map(str::to_string)),
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_empty() {
            write!(f, "{} {}", self.kind, self.message)?;
        } else {
            write!(f, "{} ({}) {}", self.kind, self.code, self.message)?;
        }
        if let Some(ref detail) = self.detail {
            write!(f, "\n  Detail: {}", detail)?;
        }
        if let Some(ref hint) = self.hint {
            write!(f, "\n  Hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for DbError {}

impl From<tokio_postgres::Error> for DbError {
    fn from(e: tokio_postgres::Error) -> Self {
        DbError::from_pg(&e)
    }
}

/// All error types that sql-watch operations can produce.
#[derive(Error, Debug)]
pub enum SqlWatchError {
    /// Invalid or missing configuration (connection fields, directories, test policy, TOML).
    #[error("{0}")]
    ConfigError(String),

    /// A database query or connection operation failed.
    #[error("{0}")]
    Database(DbError),

    /// A script failed to apply. The failure has already been reported with line context.
    #[error("{script}: {source}")]
    ScriptFailed { script: String, source: DbError },

    /// A filesystem I/O operation failed (listing directories, reading scripts, etc.).
    #[error("{0}")]
    IoError(#[from] std::io::Error),

    /// The SSH tunnel could not be opened.
    #[error("{0}")]
    TunnelError(String),

    /// The filesystem watcher could not be started.
    #[error("{0}")]
    WatchError(#[from] notify::Error),

    /// The confirmation prompt could not read input.
    #[error("{0}")]
    PromptError(String),
}

impl From<DbError> for SqlWatchError {
    fn from(e: DbError) -> Self {
        SqlWatchError::Database(e)
    }
}

impl From<tokio_postgres::Error> for SqlWatchError {
    fn from(e: tokio_postgres::Error) -> Self {
        SqlWatchError::Database(DbError::from_pg(&e))
    }
}

impl SqlWatchError {
    /// Name of the error variant, used as the prefix of fatal log lines.
    pub fn name(&self) -> &'static str {
        match self {
            SqlWatchError::ConfigError(_) => "ConfigError",
            SqlWatchError::Database(_) => "DatabaseError",
            SqlWatchError::ScriptFailed { .. } => "ScriptFailed",
            SqlWatchError::IoError(_) => "IoError",
            SqlWatchError::TunnelError(_) => "TunnelError",
            SqlWatchError::WatchError(_) => "WatchError",
            SqlWatchError::PromptError(_) => "PromptError",
        }
    }

    /// Database failures are reported and survive a watch session;
    /// everything else is fatal.
    pub fn is_database_error(&self) -> bool {
        matches!(
            self,
            SqlWatchError::Database(_) | SqlWatchError::ScriptFailed { .. }
        )
    }
}

/// Convenience type alias for `Result<T, SqlWatchError>`.
pub type Result<T> = std::result::Result<T, SqlWatchError>;
