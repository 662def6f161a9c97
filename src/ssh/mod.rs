//! SSH Layer: authenticated transport to devices with pooling, retry,
//! host-key policy and command execution.

pub mod hostkey;
mod pool;

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
pub use crate::config::{HostKeyVerification, SshConfig};
pub use hostkey::{HostKeyPolicy, Insecure, Tofu};
pub use pool::PoolStats;

#[derive(Debug, Clone)]
pub enum AuthMethod {
    Password(String),
    PublicKey(Vec<u8>),
    KeyboardInteractive(String),
}

#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

fn validate_connect_info(info: &ConnectInfo) -> Result<()> {
    if info.host.is_empty() {
        return Err(Error::validation("host", "must not be empty"));
    }
    if info.port == 0 {
        return Err(Error::validation("port", "must be in [1, 65535]"));
    }
    if info.username.is_empty() {
        return Err(Error::validation("username", "must not be empty"));
    }
    match &info.auth {
        AuthMethod::Password(p) if p.is_empty() => {
            Err(Error::validation("password", "must not be empty for password auth"))
        }
        AuthMethod::PublicKey(k) if k.is_empty() => {
            Err(Error::validation("privateKeyBytes", "must not be empty for public key auth"))
        }
        _ => Ok(()),
    }
}

/// A live transport session to one device, either freshly dialed or
/// reused from the host's pool.
pub struct Connection {
    id: Uuid,
    host: String,
    port: u16,
    session: Arc<StdMutex<ssh2::Session>>,
    created_at: Instant,
    last_used: Arc<StdMutex<Instant>>,
}

impl Connection {
    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn host_id(&self) -> String {
        pool::host_id(&self.host, self.port)
    }

    fn touch(&self) {
        *self.last_used.lock().expect("connection mutex poisoned") = Instant::now();
    }
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
}

pub type SshLayerConfig = SshConfig;

pub struct SshLayer {
    config: SshLayerConfig,
    registry: pool::Registry,
    policy: Arc<dyn HostKeyPolicy>,
}

impl Default for SshLayerConfig {
    fn default() -> Self {
        SshConfig::default()
    }
}

impl SshLayer {
    pub fn new(config: SshLayerConfig) -> Self {
        let policy: Arc<dyn HostKeyPolicy> = match config.host_key_verification {
            HostKeyVerification::Tofu => Arc::new(Tofu::new()),
            HostKeyVerification::Insecure => Arc::new(Insecure),
        };
        SshLayer {
            config,
            registry: pool::Registry::new(),
            policy,
        }
    }

    /// Dials the device, reusing a pooled idle connection when one is
    /// available and still within its TTL, otherwise creating a fresh
    /// connection via the retry loop.
    pub async fn connect(&self, info: &ConnectInfo) -> Result<Connection> {
        self.connect_with_cancellation(info, &CancellationToken::new()).await
    }

    pub async fn connect_with_cancellation(
        &self,
        info: &ConnectInfo,
        cancel: &CancellationToken,
    ) -> Result<Connection> {
        validate_connect_info(info)?;
        let host_id = pool::host_id(&info.host, info.port);
        let ttl = Duration::from_secs(self.config.connection_ttl_secs);

        if let Some(conn) = self.registry.take_idle(&host_id, self.config.max_connections, ttl) {
            return Ok(conn);
        }

        self.wait_for_capacity(&host_id, cancel).await?;
        self.dial_with_retry(info, cancel).await
    }

    /// Blocks until the host's pool has room for another live
    /// connection (bounded by `maxConnections`), or until
    /// `connectTimeout` elapses, or the context is cancelled.
    async fn wait_for_capacity(&self, host_id: &str, cancel: &CancellationToken) -> Result<()> {
        const POLL_INTERVAL: Duration = Duration::from_millis(50);
        let deadline = Instant::now() + Duration::from_secs(self.config.connect_timeout_secs.max(1));

        while self.registry.is_at_capacity(host_id, self.config.max_connections) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(Error::Connectivity(format!(
                    "connection pool for {host_id} is at capacity ({} connections)",
                    self.config.max_connections
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
        Ok(())
    }

    async fn dial_with_retry(
        &self,
        info: &ConnectInfo,
        cancel: &CancellationToken,
    ) -> Result<Connection> {
        let host_id = pool::host_id(&info.host, info.port);
        let attempts = self.config.max_retries + 1;
        let mut last_err = Error::Connectivity("no attempt made".into());

        for k in 1..=attempts {
            if k > 1 {
                let delay = Duration::from_secs(self.config.retry_delay_secs * (k - 1) as u64);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                }
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match self.dial_once(info).await {
                Ok(conn) => {
                    self.registry.register_new(&host_id, self.config.max_connections, &conn);
                    return Ok(conn);
                }
                Err(e) => {
                    self.registry.record_failure(&host_id, self.config.max_connections);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn dial_once(&self, info: &ConnectInfo) -> Result<Connection> {
        let host = info.host.clone();
        let port = info.port;
        let username = info.username.clone();
        let auth = info.auth.clone();
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let keep_alive_interval_secs = self.config.keep_alive_interval_secs;
        let policy = self.policy.clone();

        tokio::task::spawn_blocking(move || -> Result<Connection> {
            let addr = format!("{host}:{port}");
            let socket_addr = addr
                .parse()
                .or_else(|_| {
                    use std::net::ToSocketAddrs;
                    addr.to_socket_addrs()
                        .ok()
                        .and_then(|mut it| it.next())
                        .ok_or(())
                })
                .map_err(|_| Error::SshConnection(format!("cannot resolve {addr}")))?;
            let tcp = std::net::TcpStream::connect_timeout(&socket_addr, connect_timeout)
                .map_err(|e| Error::SshConnection(format!("TCP connect to {addr} failed: {e}")))?;
            tcp.set_read_timeout(Some(connect_timeout))
                .map_err(|e| Error::SshConnection(e.to_string()))?;

            let mut session = ssh2::Session::new().map_err(Error::from)?;
            session.set_tcp_stream(tcp);
            session.handshake().map_err(|e| Error::SshConnection(e.to_string()))?;
            session.set_keepalive(true, keep_alive_interval_secs.max(1) as u32);

            let host_key = session
                .host_key()
                .map(|(key, _kind)| key.to_vec())
                .ok_or_else(|| Error::SshConnection("no host key presented".into()))?;
            policy.verify(&pool::host_id(&host, port), &host_key)?;

            match &auth {
                AuthMethod::Password(password) => session
                    .userauth_password(&username, password)
                    .map_err(|e| Error::SshAuth(e.to_string()))?,
                AuthMethod::PublicKey(key_bytes) => {
                    let tmp = tempfile::NamedTempFile::new().map_err(Error::from)?;
                    std::fs::write(tmp.path(), key_bytes).map_err(Error::from)?;
                    session
                        .userauth_pubkey_file(&username, None, tmp.path(), None)
                        .map_err(|e| Error::SshAuth(e.to_string()))?;
                }
                AuthMethod::KeyboardInteractive(password) => session
                    .userauth_keyboard_interactive(&username, &mut KeyboardPrompter {
                        response: password.clone(),
                    })
                    .map_err(|e| Error::SshAuth(e.to_string()))?,
            }

            if !session.authenticated() {
                return Err(Error::SshAuth("authentication did not succeed".into()));
            }

            let now = Instant::now();
            Ok(Connection {
                id: Uuid::new_v4(),
                host,
                port,
                session: Arc::new(StdMutex::new(session)),
                created_at: now,
                last_used: Arc::new(StdMutex::new(now)),
            })
        })
        .await
        .map_err(|e| Error::SshConnection(e.to_string()))?
    }

    /// Runs `cmd` on `conn`, racing success, remote exit error and a
    /// `commandTimeout` deadline. The connection's in-use window is
    /// bounded to this call; after it returns the connection can be
    /// disconnected or reused.
    pub async fn execute_command(&self, conn: &Connection, cmd: &str) -> CommandResult {
        let started_at = Utc::now();
        let start = Instant::now();
        conn.touch();

        let session = conn.session.clone();
        let command = cmd.to_string();
        let command_timeout = Duration::from_secs(self.config.command_timeout_secs);

        let outcome = tokio::time::timeout(
            command_timeout,
            tokio::task::spawn_blocking(move || run_command(&session, &command, command_timeout)),
        )
        .await;

        self.registry
            .record_command(&conn.host_id(), self.config.max_connections);

        match outcome {
            Ok(Ok(Ok((stdout, stderr, exit_status)))) => CommandResult {
                command: cmd.to_string(),
                stdout,
                stderr,
                exit_status,
                duration: start.elapsed(),
                started_at,
                error: if exit_status == 0 {
                    None
                } else {
                    Some(format!("command exited with status {exit_status}"))
                },
            },
            Ok(Ok(Err(e))) => CommandResult {
                command: cmd.to_string(),
                stdout: String::new(),
                stderr: String::new(),
                exit_status: -1,
                duration: start.elapsed(),
                started_at,
                error: Some(e.to_string()),
            },
            Ok(Err(join_err)) => CommandResult {
                command: cmd.to_string(),
                stdout: String::new(),
                stderr: String::new(),
                exit_status: -1,
                duration: start.elapsed(),
                started_at,
                error: Some(join_err.to_string()),
            },
            Err(_elapsed) => CommandResult {
                command: cmd.to_string(),
                stdout: String::new(),
                stderr: String::new(),
                exit_status: -1,
                duration: start.elapsed(),
                started_at,
                error: Some(format!("command timeout after {command_timeout:?}")),
            },
        }
    }

    /// Runs every command sequentially on the same connection. A
    /// failing command does not stop the sequence.
    pub async fn execute_commands(&self, conn: &Connection, cmds: &[String]) -> Vec<CommandResult> {
        let mut results = Vec::with_capacity(cmds.len());
        for cmd in cmds {
            results.push(self.execute_command(conn, cmd).await);
        }
        results
    }

    /// Closes the connection if it has outlived its TTL, otherwise
    /// returns it to the pool's idle queue.
    pub async fn disconnect(&self, conn: Connection) {
        let host_id = conn.host_id();
        if conn.age() > Duration::from_secs(self.config.connection_ttl_secs) {
            self.registry.forget_active(&host_id, &conn.id);
            close_session(conn.session.clone()).await;
        } else {
            self.registry.release(&host_id, self.config.max_connections, conn);
        }
    }

    /// Closes every connection across every pool and empties the
    /// registry.
    pub async fn close(&self) {
        for conn in self.registry.drain_all() {
            close_session(conn.session.clone()).await;
        }
    }

    pub fn get_connection_stats(&self) -> HashMap<String, PoolStats> {
        self.registry.stats()
    }
}

async fn close_session(session: Arc<StdMutex<ssh2::Session>>) {
    let _ = tokio::task::spawn_blocking(move || {
        let session = session.lock().expect("session mutex poisoned");
        let _ = session.disconnect(None, "closing", None);
    })
    .await;
}

fn run_command(
    session: &Arc<StdMutex<ssh2::Session>>,
    command: &str,
    timeout: Duration,
) -> Result<(String, String, i32)> {
    let session = session.lock().expect("session mutex poisoned");
    session.set_timeout(timeout.as_millis() as u32);
    let mut channel = session.channel_session().map_err(|e| Error::CommandExecution(e.to_string()))?;
    channel
        .exec(command)
        .map_err(|e| map_command_error(e, "timeout"))?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|e| map_command_error(e, "timeout"))?;
    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|e| map_command_error(e, "timeout"))?;

    channel.wait_close().map_err(|e| Error::CommandExecution(e.to_string()))?;
    let exit_status = channel.exit_status().map_err(|e| Error::CommandExecution(e.to_string()))?;
    session.set_timeout(0);
    Ok((stdout, stderr, exit_status))
}

fn map_command_error(e: ssh2::Error, timeout_marker: &str) -> Error {
    if e.code() == ssh2::ErrorCode::Session(-1) || e.message().to_lowercase().contains("timed out")
    {
        Error::CommandExecution(format!("{timeout_marker}: {e}"))
    } else {
        Error::CommandExecution(e.to_string())
    }
}

struct KeyboardPrompter {
    response: String,
}

impl ssh2::KeyboardInteractivePrompt for KeyboardPrompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.response.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_empty_host() {
        let info = ConnectInfo {
            host: String::new(),
            port: 22,
            username: "admin".into(),
            auth: AuthMethod::Password("x".into()),
        };
        let err = validate_connect_info(&info).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn validation_rejects_empty_password() {
        let info = ConnectInfo {
            host: "10.0.0.1".into(),
            port: 22,
            username: "admin".into(),
            auth: AuthMethod::Password(String::new()),
        };
        assert!(validate_connect_info(&info).is_err());
    }

    #[tokio::test]
    async fn connect_to_unreachable_host_fails_after_retries() {
        let layer = SshLayer::new(SshLayerConfig {
            max_retries: 1,
            retry_delay_secs: 0,
            connect_timeout_secs: 1,
            host_key_verification: HostKeyVerification::Insecure,
            ..Default::default()
        });
        let info = ConnectInfo {
            host: "192.0.2.1".into(),
            port: 22,
            username: "admin".into(),
            auth: AuthMethod::Password("x".into()),
        };
        let err = layer.connect(&info).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connectivity);
    }

    /// A pool already at `maxConnections` must not grow further; a
    /// caller asking for another connection waits and then fails with
    /// a connectivity error once `connectTimeout` elapses rather than
    /// dialing past the configured capacity.
    #[tokio::test]
    async fn dialing_past_capacity_waits_then_fails() {
        let layer = SshLayer::new(SshLayerConfig {
            max_connections: 1,
            connect_timeout_secs: 1,
            host_key_verification: HostKeyVerification::Insecure,
            ..Default::default()
        });
        let host_id = pool::host_id("10.0.0.1", 22);

        let now = Instant::now();
        let occupying = Connection {
            id: Uuid::new_v4(),
            host: "10.0.0.1".into(),
            port: 22,
            session: Arc::new(StdMutex::new(ssh2::Session::new().unwrap())),
            created_at: now,
            last_used: Arc::new(StdMutex::new(now)),
        };
        layer
            .registry
            .register_new(&host_id, layer.config.max_connections, &occupying);
        assert!(layer.registry.is_at_capacity(&host_id, layer.config.max_connections));

        let err = layer
            .wait_for_capacity(&host_id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connectivity);
    }
}
