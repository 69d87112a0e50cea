//! Database session, TLS support, notice logging, and the `Database` seam
//! used by the run engine and the run state store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_postgres::{AsyncMessage, Client, Connection};

use crate::config::{ConnectionConfig, SslMode};
use crate::error::{DbError, Result, SqlWatchError};
use crate::tunnel::Tunnel;

/// How long the connection driver may drain after the client is dropped.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Quote a SQL identifier to prevent SQL injection.
///
/// Doubles any embedded double-quotes and wraps in double-quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Validate that a SQL identifier contains only safe characters.
///
/// Returns an error for names with characters outside `[a-zA-Z0-9_]`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SqlWatchError::ConfigError(
            "Identifier cannot be empty".to_string(),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SqlWatchError::ConfigError(format!(
            "Identifier '{}' contains invalid characters. Only [a-zA-Z0-9_] are allowed.",
            name
        )));
    }
    Ok(())
}

/// The database operations sql-watch needs.
///
/// `PgSession` is the PostgreSQL implementation. Every schema argument has
/// already passed [`validate_identifier`].
#[allow(async_fn_in_trait)]
pub trait Database {
    /// Execute a whole script as one simple-query batch.
    ///
    /// On failure the returned error carries the script text as its query.
    async fn execute_script(&self, sql: &str) -> std::result::Result<(), DbError>;

    /// All values of `<schema>.environment`.
    async fn select_environment(&self, schema: &str) -> std::result::Result<Vec<String>, DbError>;

    /// `ran_at` from the `<schema>.last_run` view, `None` when no run was recorded.
    async fn select_last_run(
        &self,
        schema: &str,
    ) -> std::result::Result<Option<DateTime<Utc>>, DbError>;

    /// Append a row to `<schema>.run`.
    async fn insert_run(
        &self,
        schema: &str,
        ran_at: DateTime<Utc>,
        meta_data: &serde_json::Value,
    ) -> std::result::Result<(), DbError>;

    /// Overwrite the environment row.
    async fn update_environment(
        &self,
        schema: &str,
        environment: &str,
    ) -> std::result::Result<(), DbError>;

    /// Close the session. Calling it more than once is a no-op.
    async fn close(&mut self);
}

/// A live PostgreSQL session, optionally routed through an SSH tunnel.
pub struct PgSession {
    client: Option<Client>,
    driver: Option<JoinHandle<()>>,
    tunnel: Option<Tunnel>,
}

impl PgSession {
    /// Open the tunnel (if configured) and connect, retrying with backoff.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let tunnel = match config.tunnel {
            Some(ref tunnel_config) => {
                Some(Tunnel::open(tunnel_config, &config.host, config.port).await?)
            }
            None => None,
        };

        let mut pg_config = tokio_postgres::Config::new();
        match tunnel {
            Some(ref t) => {
                pg_config.host("127.0.0.1").port(t.local_port());
            }
            None => {
                pg_config.host(&config.host).port(config.port);
            }
        }
        pg_config
            .user(&config.user)
            .password(&config.password)
            .dbname(&config.database)
            .application_name("sql-watch");
        if let Some(ref schema) = config.schema {
            pg_config.options(&format!("-c search_path={}", schema));
        }
        if config.keepalive_secs > 0 {
            pg_config
                .keepalives(true)
                .keepalives_idle(Duration::from_secs(config.keepalive_secs as u64));
        }

        log::debug!("Connecting to {}", config.redacted_uri());

        match connect_with_retries(
            &pg_config,
            &config.ssl_mode,
            config.connect_retries,
            config.connect_timeout_secs,
        )
        .await
        {
            Ok((client, driver)) => Ok(Self {
                client: Some(client),
                driver: Some(driver),
                tunnel,
            }),
            Err(e) => {
                if let Some(mut t) = tunnel {
                    t.close().await;
                }
                Err(e)
            }
        }
    }

    fn client(&self) -> std::result::Result<&Client, DbError> {
        self.client.as_ref().ok_or_else(DbError::closed)
    }
}

impl Database for PgSession {
    async fn execute_script(&self, sql: &str) -> std::result::Result<(), DbError> {
        self.client()?
            .batch_execute(sql)
            .await
            .map_err(|e| DbError::from_pg(&e).with_query(sql))
    }

    async fn select_environment(&self, schema: &str) -> std::result::Result<Vec<String>, DbError> {
        let sql = format!("SELECT environment FROM {}.environment", quote_ident(schema));
        let rows = self.client()?.query(&sql, &[]).await?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    async fn select_last_run(
        &self,
        schema: &str,
    ) -> std::result::Result<Option<DateTime<Utc>>, DbError> {
        let sql = format!("SELECT ran_at FROM {}.last_run", quote_ident(schema));
        let row = self.client()?.query_opt(&sql, &[]).await?;
        Ok(row.map(|r| r.get::<_, DateTime<Utc>>(0)))
    }

    async fn insert_run(
        &self,
        schema: &str,
        ran_at: DateTime<Utc>,
        meta_data: &serde_json::Value,
    ) -> std::result::Result<(), DbError> {
        let sql = format!(
            "INSERT INTO {}.run (ran_at, meta_data) VALUES ($1, $2)",
            quote_ident(schema)
        );
        self.client()?.execute(&sql, &[&ran_at, meta_data]).await?;
        Ok(())
    }

    async fn update_environment(
        &self,
        schema: &str,
        environment: &str,
    ) -> std::result::Result<(), DbError> {
        let sql = format!(
            "UPDATE {}.environment SET environment = $1",
            quote_ident(schema)
        );
        self.client()?.execute(&sql, &[&environment]).await?;
        Ok(())
    }

    async fn close(&mut self) {
        // Dropping the client sends Terminate; the driver then finishes.
        if self.client.take().is_some() {
            log::debug!("Closing database connection");
        }
        if let Some(driver) = self.driver.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, driver).await.is_err() {
                log::warn!(
                    "Database connection did not close within {}s",
                    DRAIN_TIMEOUT.as_secs()
                );
            }
        }
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.close().await;
        }
    }
}

/// Build a rustls ClientConfig using the Mozilla CA bundle and ring crypto provider.
fn make_rustls_config() -> Result<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(std::sync::Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| SqlWatchError::ConfigError(format!("Failed to configure TLS: {}", e)))?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(config)
}

/// Check if a postgres error is a permanent authentication failure that should not be retried.
fn is_permanent_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_err) = e.as_db_error() {
        let code = db_err.code().code();
        // 28P01 = invalid_password, 28000 = invalid_authorization_specification
        return code == "28P01" || code == "28000";
    }
    false
}

/// Render a server notice as log lines, or `None` when it should be dropped.
///
/// Notices about objects that already exist or do not exist are noise from
/// idempotent scripts (`CREATE ... IF NOT EXISTS`), as are INFO messages.
pub(crate) fn format_notice(
    severity: &str,
    message: &str,
    detail: Option<&str>,
) -> Option<Vec<String>> {
    if message.contains("already exists") || message.contains("does not exist") {
        return None;
    }
    if severity == "INFO" {
        return None;
    }

    let mut lines = Vec::new();
    if severity == "NOTICE" {
        lines.push(message.to_string());
    } else {
        lines.push(format!("{}: {}", severity, message));
    }
    if let Some(detail) = detail {
        lines.extend(detail.lines().map(|l| format!("  {}", l)));
    }
    Some(lines)
}

/// Spawn the background connection driver task.
///
/// The driver is polled message by message so server notices (`RAISE NOTICE`
/// in scripts) reach the log.
fn spawn_connection_task<S, T>(mut connection: Connection<S, T>) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let messages = futures_util::stream::poll_fn(move |cx| connection.poll_message(cx));
        futures_util::pin_mut!(messages);
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notice(notice)) => {
                    let lines = format_notice(
                        notice.severity(),
                        notice.message(),
                        notice.detail(),
                    );
                    for line in lines.into_iter().flatten() {
                        log::info!("{}", line);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("Database connection error: {}", e);
                    break;
                }
            }
        }
    })
}

/// Connect once with the given TLS mode, returning the client and its driver task.
async fn connect_tls(
    pg_config: &tokio_postgres::Config,
    ssl_mode: &SslMode,
    tls_config: Option<rustls::ClientConfig>,
) -> std::result::Result<(Client, JoinHandle<()>), tokio_postgres::Error> {
    match (ssl_mode, tls_config) {
        (SslMode::Require, Some(tls_config)) => {
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
            let (client, connection) = pg_config.connect(tls).await?;
            Ok((client, spawn_connection_task(connection)))
        }
        (SslMode::Prefer, Some(tls_config)) => {
            // Try TLS first, fall back to plaintext
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
            match pg_config.connect(tls).await {
                Ok((client, connection)) => Ok((client, spawn_connection_task(connection))),
                Err(_) => {
                    log::debug!("TLS connection failed, falling back to plaintext");
                    let (client, connection) = pg_config.connect(tokio_postgres::NoTls).await?;
                    Ok((client, spawn_connection_task(connection)))
                }
            }
        }
        _ => {
            let (client, connection) = pg_config.connect(tokio_postgres::NoTls).await?;
            Ok((client, spawn_connection_task(connection)))
        }
    }
}

/// Connect once, bounded by `connect_timeout_secs` (0 means no timeout).
async fn connect_once(
    pg_config: &tokio_postgres::Config,
    ssl_mode: &SslMode,
    connect_timeout_secs: u32,
) -> Result<std::result::Result<(Client, JoinHandle<()>), tokio_postgres::Error>> {
    let tls_config = match ssl_mode {
        SslMode::Disable => None,
        SslMode::Prefer | SslMode::Require => Some(make_rustls_config()?),
    };
    let connect_fut = connect_tls(pg_config, ssl_mode, tls_config);

    if connect_timeout_secs > 0 {
        match tokio::time::timeout(
            Duration::from_secs(connect_timeout_secs as u64),
            connect_fut,
        )
        .await
        {
            Ok(result) => Ok(result),
            Err(_) => Ok(Err(tokio_postgres::Error::__private_api_timeout())),
        }
    } else {
        Ok(connect_fut.await)
    }
}

/// Connect, retrying up to `retries` times with exponential backoff + jitter.
///
/// Each retry waits `min(2^attempt, 30) + rand(0..1000ms)` before the next attempt.
/// Permanent errors (authentication failures) are not retried.
async fn connect_with_retries(
    pg_config: &tokio_postgres::Config,
    ssl_mode: &SslMode,
    retries: u32,
    connect_timeout_secs: u32,
) -> Result<(Client, JoinHandle<()>)> {
    let mut last_err = None;

    for attempt in 0..=retries {
        if attempt > 0 {
            let base_delay = std::cmp::min(1u64 << attempt, 30);
            let jitter_ms = fastrand::u64(0..1000);
            let delay = Duration::from_secs(base_delay) + Duration::from_millis(jitter_ms);
            log::info!(
                "Connection attempt failed, retrying; attempt={}, max_attempts={}, delay_ms={}",
                attempt + 1,
                retries + 1,
                delay.as_millis() as u64
            );
            tokio::time::sleep(delay).await;
        }

        match connect_once(pg_config, ssl_mode, connect_timeout_secs).await? {
            Ok(connected) => {
                if attempt > 0 {
                    log::info!(
                        "Connected successfully after retry; attempt={}, max_attempts={}",
                        attempt + 1,
                        retries + 1
                    );
                }
                return Ok(connected);
            }
            Err(e) => {
                if is_permanent_error(&e) {
                    log::error!("Permanent connection error, not retrying: {}", e);
                    return Err(SqlWatchError::Database(DbError::from_pg(&e)));
                }
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) => Err(SqlWatchError::Database(DbError::from_pg(&e))),
        None => Err(SqlWatchError::Database(DbError::closed())),
    }
}
