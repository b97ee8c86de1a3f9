//! OpenSSH tunnel to the legacy store
//!
//! A control master (`ssh -M -N -S <socket>`) holds the authenticated session to
//! the bastion. A local listener on `127.0.0.1:0` accepts pool connections and
//! pipes each one through `ssh -S <socket> -W host:port`, which multiplexes a
//! new channel over the master without re-authenticating.

use super::TunnelConnector;
use crate::config::{LegacyStoreConfig, TunnelConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An open control master plus its forwarding listener
pub struct SshTunnel {
    control_path: PathBuf,
    destination: String,
    local_addr: SocketAddr,
    master: Mutex<Option<Child>>,
    listener_task: JoinHandle<()>,
}

impl SshTunnel {
    /// Address the pool connects to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        // The master is kill_on_drop; the listener task is not tied to us
        self.listener_task.abort();
    }
}

/// [`TunnelConnector`] reaching MySQL through an SSH bastion
pub struct SshTunnelConnector {
    tunnel: TunnelConfig,
    database_url: String,
    max_connections: u32,
    connect_timeout: Duration,
}

impl SshTunnelConnector {
    pub fn new(legacy: &LegacyStoreConfig, tunnel: TunnelConfig) -> Self {
        Self {
            tunnel,
            database_url: legacy.database_url.clone(),
            max_connections: legacy.max_connections,
            connect_timeout: Duration::from_millis(legacy.connect_timeout_ms),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.tunnel.ssh_user, self.tunnel.ssh_host)
    }

    fn remote(&self) -> String {
        format!("{}:{}", self.tunnel.remote_host, self.tunnel.remote_port)
    }

    fn master_command(&self, control_path: &Path) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-M")
            .arg("-N")
            .arg("-S")
            .arg(control_path)
            .args(["-o", "ExitOnForwardFailure=yes", "-o", "BatchMode=yes"])
            .arg("-p")
            .arg(self.tunnel.ssh_port.to_string());
        if let Some(identity) = &self.tunnel.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl TunnelConnector for SshTunnelConnector {
    type Tunnel = SshTunnel;
    type Connection = MySqlPool;

    async fn open_tunnel(&self) -> Result<SshTunnel> {
        let control_path = self
            .tunnel
            .control_dir
            .join(format!("onair-sync-{}.sock", Uuid::new_v4().simple()));
        let destination = self.destination();

        info!("Opening SSH tunnel to {} (port {})", destination, self.tunnel.ssh_port);
        let mut master = self
            .master_command(&control_path)
            .spawn()
            .map_err(|e| Error::ConnectionUnavailable(format!("failed to start ssh: {}", e)))?;

        let timeout = Duration::from_millis(self.tunnel.establish_timeout_ms);
        if let Err(e) = wait_for_control_socket(&control_path, &mut master, timeout).await {
            let _ = master.kill().await;
            return Err(e);
        }

        let listener = match TcpListener::bind(("127.0.0.1", 0)).await {
            Ok(listener) => listener,
            Err(e) => {
                stop_master(&control_path, &destination, Some(master)).await;
                return Err(Error::ConnectionUnavailable(format!(
                    "failed to bind forwarding listener: {}",
                    e
                )));
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::ConnectionUnavailable(e.to_string()))?;

        let listener_task = tokio::spawn(forward_connections(
            listener,
            control_path.clone(),
            destination.clone(),
            self.remote(),
        ));

        info!("SSH tunnel up, forwarding {} to {}", local_addr, self.remote());
        Ok(SshTunnel {
            control_path,
            destination,
            local_addr,
            master: Mutex::new(Some(master)),
            listener_task,
        })
    }

    async fn open_pool(&self, tunnel: &SshTunnel) -> Result<MySqlPool> {
        let options = MySqlConnectOptions::from_str(&self.database_url)
            .map_err(|e| Error::Config(format!("invalid legacy database URL: {}", e)))?
            .host("127.0.0.1")
            .port(tunnel.local_addr.port());

        MySqlPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| Error::ConnectionUnavailable(format!("legacy pool: {}", e)))
    }

    async fn close_pool(&self, connection: &MySqlPool) {
        connection.close().await;
    }

    async fn close_tunnel(&self, tunnel: &SshTunnel) {
        let master = tunnel.master.lock().take();
        stop_master(&tunnel.control_path, &tunnel.destination, master).await;
        tunnel.listener_task.abort();
        debug!("Forwarding listener on {} stopped", tunnel.local_addr);
    }
}

async fn wait_for_control_socket(path: &Path, master: &mut Child, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }
        if let Some(status) = master.try_wait()? {
            return Err(Error::ConnectionUnavailable(format!(
                "ssh exited ({}) before the control socket appeared",
                status
            )));
        }
        if Instant::now() >= deadline {
            return Err(Error::ConnectionUnavailable(format!(
                "ssh control socket did not appear within {:?}",
                timeout
            )));
        }
        tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
    }
}

/// Ask the master to exit, then make sure it is gone
async fn stop_master(control_path: &Path, destination: &str, master: Option<Child>) {
    let exit = Command::new("ssh")
        .arg("-S")
        .arg(control_path)
        .args(["-O", "exit"])
        .arg(destination)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = exit {
        warn!("ssh -O exit failed: {}", e);
    }

    if let Some(mut master) = master {
        if let Err(e) = master.kill().await {
            debug!("SSH master already gone: {}", e);
        }
    }

    match tokio::fs::remove_file(control_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", control_path.display(), e),
    }
}

async fn forward_connections(
    listener: TcpListener,
    control_path: PathBuf,
    destination: String,
    remote: String,
) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!("Forwarding connection from {}", peer);
                let control_path = control_path.clone();
                let destination = destination.clone();
                let remote = remote.clone();
                tokio::spawn(async move {
                    if let Err(e) = pipe_through_ssh(socket, &control_path, &destination, &remote).await {
                        warn!("Forwarded connection from {} failed: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                warn!("Forwarding listener accept failed: {}", e);
                tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
            }
        }
    }
}

async fn pipe_through_ssh(
    socket: TcpStream,
    control_path: &Path,
    destination: &str,
    remote: &str,
) -> std::io::Result<()> {
    let mut child = Command::new("ssh")
        .arg("-S")
        .arg(control_path)
        .arg("-W")
        .arg(remote)
        .arg(destination)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let missing = || std::io::Error::new(std::io::ErrorKind::Other, "ssh stdio not captured");
    let mut stdin = child.stdin.take().ok_or_else(missing)?;
    let mut stdout = child.stdout.take().ok_or_else(missing)?;
    let (mut reader, mut writer) = socket.into_split();

    let upstream = async move {
        let copied = tokio::io::copy(&mut reader, &mut stdin).await;
        let _ = stdin.shutdown().await;
        copied
    };
    let downstream = async move {
        let copied = tokio::io::copy(&mut stdout, &mut writer).await;
        let _ = writer.shutdown().await;
        copied
    };

    let (up, down) = tokio::join!(upstream, downstream);
    let _ = child.kill().await;
    debug!(
        "Forwarded connection closed ({} bytes up, {} bytes down)",
        up.as_ref().copied().unwrap_or(0),
        down.as_ref().copied().unwrap_or(0)
    );
    up.and(down).map(|_| ())
}
