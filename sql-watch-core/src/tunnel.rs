//! SSH local port forwarding through the system `ssh` client.

use std::process::Stdio;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};

use crate::config::TunnelConfig;
use crate::error::{Result, SqlWatchError};

/// How long to wait for the forwarded port to accept connections.
const READY_TIMEOUT: Duration = Duration::from_secs(10);
const READY_POLL: Duration = Duration::from_millis(100);

/// A running `ssh -L` process forwarding a local port to the database host.
pub struct Tunnel {
    child: Option<Child>,
    local_port: u16,
}

impl Tunnel {
    /// Start forwarding `127.0.0.1:<free port>` to `remote_host:remote_port`
    /// via the configured SSH host, and wait until the local port is open.
    pub async fn open(config: &TunnelConfig, remote_host: &str, remote_port: u16) -> Result<Self> {
        let local_port = free_local_port().await?;
        let args = ssh_args(config, local_port, remote_host, remote_port);

        log::debug!(
            "Opening ssh tunnel; ssh_host={}, ssh_port={}, local_port={}, remote={}:{}",
            config.host,
            config.port,
            local_port,
            remote_host,
            remote_port
        );

        let child = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SqlWatchError::TunnelError(format!("Failed to start ssh: {}", e)))?;

        let mut tunnel = Tunnel {
            child: Some(child),
            local_port,
        };
        if let Err(e) = tunnel.wait_until_ready().await {
            tunnel.close().await;
            return Err(e);
        }
        Ok(tunnel)
    }

    /// The local port the database connection should use.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    async fn wait_until_ready(&mut self) -> Result<()> {
        let started = tokio::time::Instant::now();
        while started.elapsed() <= READY_TIMEOUT {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(SqlWatchError::TunnelError(format!(
                        "ssh exited before the tunnel was ready ({})",
                        status
                    )));
                }
            }
            if TcpStream::connect(("127.0.0.1", self.local_port)).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(READY_POLL).await;
        }
        Err(SqlWatchError::TunnelError(format!(
            "ssh tunnel was not ready on port {} within {:?}",
            self.local_port, READY_TIMEOUT
        )))
    }

    /// Stop the ssh process. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            log::debug!("Closing ssh tunnel; local_port={}", self.local_port);
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

/// Ask the OS for an unused local port.
async fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}

/// Arguments for `ssh` that forward `local_port` and do nothing else.
fn ssh_args(
    config: &TunnelConfig,
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
) -> Vec<String> {
    vec![
        "-N".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-i".to_string(),
        config.private_key_path.display().to_string(),
        "-p".to_string(),
        config.port.to_string(),
        "-L".to_string(),
        format!("127.0.0.1:{}:{}:{}", local_port, remote_host, remote_port),
        format!("{}@{}", config.user, config.host),
    ]
}
