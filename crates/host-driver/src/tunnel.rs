//! SSH session and Docker socket forwarding
//!
//! One multiplexed SSH session per host. A local UNIX socket in a private
//! temporary directory accepts Docker API connections; each accepted
//! connection is bridged to the remote Docker socket over a
//! `direct-streamlocal@openssh.com` channel.

use crate::docker_trait::RemoteShell;
use crate::error::HostError;
use crate::models::ExecOutput;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Accepts any host key; hosts are identified by the cluster file
#[derive(Debug)]
pub(crate) struct ClientHandler;

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &key::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Authenticated SSH session to a host
#[derive(Clone)]
pub struct SshSession {
    host: String,
    handle: Arc<Handle<ClientHandler>>,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession").field("host", &self.host).finish_non_exhaustive()
    }
}

impl SshSession {
    /// Dial `address:port` and authenticate `user` with a PEM/OpenSSH private key
    ///
    /// # Errors
    ///
    /// Returns `HostError::Unreachable` when the TCP dial, handshake, key
    /// decoding or authentication fails.
    pub async fn connect(
        address: &str,
        port: u16,
        user: &str,
        private_key: &str,
        passphrase: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, HostError> {
        let unreachable = |reason: String| HostError::Unreachable {
            host: address.to_string(),
            reason,
        };

        let key_pair = russh_keys::decode_secret_key(private_key, passphrase)
            .map_err(|e| unreachable(format!("failed to decode private key: {e}")))?;

        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        let mut handle = tokio::time::timeout(timeout, client::connect(config, (address, port), ClientHandler))
            .await
            .map_err(|e| unreachable(format!("{e} after {}s", timeout.as_secs())))?
            .map_err(|e| unreachable(format!("ssh dial failed: {e}")))?;

        let authenticated = handle
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|e| unreachable(format!("ssh authentication failed: {e}")))?;
        if !authenticated {
            return Err(unreachable(format!("ssh public key authentication rejected for user {user}")));
        }

        debug!("SSH session established to {}:{} as {}", address, port, user);
        Ok(Self {
            host: address.to_string(),
            handle: Arc::new(handle),
        })
    }

    /// Start forwarding a local socket to `remote_socket` on the host
    ///
    /// # Errors
    ///
    /// Returns `HostError::Io` if the local socket cannot be bound.
    pub fn forward_docker_socket(&self, remote_socket: &str) -> Result<SshTunnel, HostError> {
        let dir = tempfile::Builder::new().prefix("rke-docker-").tempdir()?;
        let local_path = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&local_path)?;

        let handle = Arc::clone(&self.handle);
        let remote = remote_socket.to_string();
        let host = self.host.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let mut local = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("Docker socket forwarder for {} stopped: {}", host, e);
                        break;
                    }
                };
                let handle = Arc::clone(&handle);
                let remote = remote.clone();
                let host = host.clone();
                tokio::spawn(async move {
                    match handle.channel_open_direct_streamlocal(remote).await {
                        Ok(channel) => {
                            let mut stream = channel.into_stream();
                            if let Err(e) = tokio::io::copy_bidirectional(&mut local, &mut stream).await {
                                debug!("Docker stream to {} closed: {}", host, e);
                            }
                        }
                        Err(e) => warn!("Failed to open Docker socket channel on {}: {}", host, e),
                    }
                });
            }
        });

        Ok(SshTunnel {
            session: self.clone(),
            local_path,
            _dir: dir,
            forwarder,
        })
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, HostError> {
        let unreachable = |e: russh::Error| HostError::Unreachable {
            host: self.host.clone(),
            reason: format!("ssh exec failed: {e}"),
        };
        let mut channel = self.handle.channel_open_session().await.map_err(unreachable)?;
        channel.exec(true, command).await.map_err(unreachable)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(i64::from(exit_status)),
                _ => {}
            }
        }

        Ok(ExecOutput {
            exit_code: exit_code.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

#[async_trait::async_trait]
impl RemoteShell for SshSession {
    async fn run(&self, command: &str) -> Result<ExecOutput, HostError> {
        debug!("[{}] running: {}", self.host, command);
        self.exec(command).await
    }
}

/// Forwarded Docker socket; dropping the temp dir removes the socket file
#[derive(Debug)]
pub struct SshTunnel {
    session: SshSession,
    local_path: PathBuf,
    _dir: tempfile::TempDir,
    forwarder: JoinHandle<()>,
}

impl SshTunnel {
    /// Local socket path to hand to the Docker client
    #[must_use]
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Stop forwarding and disconnect the SSH session
    pub async fn close(self) {
        self.forwarder.abort();
        if let Err(e) = self
            .session
            .handle
            .disconnect(Disconnect::ByApplication, "run finished", "en")
            .await
        {
            debug!("SSH disconnect from {} failed: {}", self.session.host, e);
        }
    }
}
