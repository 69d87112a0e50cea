//! In-memory `Database`, scripted `Prompt` and log capture used by unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Once};

use chrono::{DateTime, Utc};

use crate::db::Database;
use crate::engine::Prompt;
use crate::error::{DbError, DbErrorKind, Result};

#[derive(Default)]
struct State {
    initialized: bool,
    environment: Vec<String>,
    runs: Vec<(DateTime<Utc>, serde_json::Value)>,
    executed: Vec<String>,
    fail_marker: Option<String>,
    select_error: Option<DbError>,
    closed: bool,
    close_calls: usize,
}

/// A shared in-memory state schema. Clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<State>>,
}

impl MemoryDatabase {
    /// A database whose state schema already exists with the given environment rows.
    pub fn initialized(environment: &[&str]) -> Self {
        let db = Self::default();
        {
            let mut state = db.lock();
            state.initialized = true;
            state.environment = environment.iter().map(|e| e.to_string()).collect();
        }
        db
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Scripts containing `marker` fail with a syntax error at the marker.
    pub fn fail_scripts_containing(&self, marker: &str) {
        self.lock().fail_marker = Some(marker.to_string());
    }

    pub fn fail_selects_with_closed_connection(&self) {
        self.lock().select_error = Some(DbError::closed());
    }

    pub fn runs(&self) -> Vec<(DateTime<Utc>, serde_json::Value)> {
        self.lock().runs.clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    /// Allow use after `close`, as a new session against the same state would.
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    pub fn clear_executed(&self) {
        self.lock().executed.clear();
    }

    pub fn environment_rows(&self) -> Vec<String> {
        self.lock().environment.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }

    fn check_open(state: &State) -> std::result::Result<(), DbError> {
        if state.closed {
            return Err(DbError::closed());
        }
        Ok(())
    }

    fn check_selectable(state: &State, schema: &str) -> std::result::Result<(), DbError> {
        Self::check_open(state)?;
        if let Some(ref e) = state.select_error {
            return Err(e.clone());
        }
        if !state.initialized {
            return Err(DbError::new(
                DbErrorKind::UndefinedRelation,
                "42P01",
                format!("relation \"{}.environment\" does not exist", schema),
            ));
        }
        Ok(())
    }
}

impl Database for MemoryDatabase {
    async fn execute_script(&self, sql: &str) -> std::result::Result<(), DbError> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        if let Some(ref marker) = state.fail_marker {
            if let Some(at) = sql.find(marker.as_str()) {
                let position = sql[..at].chars().count() as u32 + 1;
                return Err(DbError::new(
                    DbErrorKind::SyntaxError,
                    "42601",
                    format!("syntax error at or near \"{}\"", marker),
                )
                .with_position(position)
                .with_query(sql));
            }
        }
        if sql.contains("CREATE TABLE IF NOT EXISTS") && sql.contains(".environment (") {
            state.initialized = true;
        }
        if sql.contains("SELECT 'production'") && state.environment.is_empty() {
            state.environment.push("production".to_string());
        }
        state.executed.push(sql.to_string());
        Ok(())
    }

    async fn select_environment(&self, schema: &str) -> std::result::Result<Vec<String>, DbError> {
        let state = self.lock();
        Self::check_selectable(&state, schema)?;
        Ok(state.environment.clone())
    }

    async fn select_last_run(
        &self,
        schema: &str,
    ) -> std::result::Result<Option<DateTime<Utc>>, DbError> {
        let state = self.lock();
        Self::check_selectable(&state, schema)?;
        Ok(state.runs.last().map(|(ran_at, _)| *ran_at))
    }

    async fn insert_run(
        &self,
        _schema: &str,
        ran_at: DateTime<Utc>,
        meta_data: &serde_json::Value,
    ) -> std::result::Result<(), DbError> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        state.runs.push((ran_at, meta_data.clone()));
        Ok(())
    }

    async fn update_environment(
        &self,
        _schema: &str,
        environment: &str,
    ) -> std::result::Result<(), DbError> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        for row in state.environment.iter_mut() {
            *row = environment.to_string();
        }
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.lock();
        state.closed = true;
        state.close_calls += 1;
    }
}

/// Answers prompts from a queue and remembers what was asked.
#[derive(Default)]
pub struct ScriptedPrompt {
    answers: VecDeque<String>,
    pub asked: Vec<String>,
}

impl ScriptedPrompt {
    pub fn answering(answers: &[&str]) -> Self {
        Self {
            answers: answers.iter().map(|a| a.to_string()).collect(),
            asked: Vec::new(),
        }
    }
}

impl Prompt for ScriptedPrompt {
    fn ask(&mut self, message: &str) -> Result<String> {
        self.asked.push(message.to_string());
        Ok(self.answers.pop_front().unwrap_or_default())
    }
}

thread_local! {
    static CAPTURED: RefCell<Option<Vec<(log::Level, String)>>> = const { RefCell::new(None) };
}

/// Records log lines for threads that are capturing. Tests run the engine
/// on their own thread (`#[tokio::test]` is single threaded), so captures
/// from concurrent tests do not mix.
struct CaptureLogger;

impl log::Log for CaptureLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        CAPTURED.with(|captured| {
            if let Some(lines) = captured.borrow_mut().as_mut() {
                lines.push((record.level(), record.args().to_string()));
            }
        });
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;
static INSTALL: Once = Once::new();

/// Captures log lines on the current thread until dropped.
pub struct LogCapture;

impl LogCapture {
    pub fn start() -> Self {
        INSTALL.call_once(|| {
            let _ = log::set_logger(&LOGGER);
            log::set_max_level(log::LevelFilter::Trace);
        });
        CAPTURED.with(|captured| *captured.borrow_mut() = Some(Vec::new()));
        LogCapture
    }

    /// Lines at `level` or more severe, formatted `LEVEL: message`.
    pub fn lines(&self, level: log::Level) -> Vec<String> {
        CAPTURED.with(|captured| {
            captured
                .borrow()
                .iter()
                .flatten()
                .filter(|(l, _)| *l <= level)
                .map(|(l, message)| format!("{}: {}", l, message))
                .collect()
        })
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        CAPTURED.with(|captured| *captured.borrow_mut() = None);
    }
}
