//! SSH server implementation using russh.
//!
//! Handles:
//! - Public key authentication through the identity resolver
//! - Session channels: shell requests as a health check, exec of the git
//!   pack-protocol commands

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::fingerprint::compute_fingerprint_from_pubkey;
use crate::git::{self, ChannelOutput, CommandError, GIT_PROTOCOL_ENV, GitCommand};
use crate::resolver::IdentityResolver;

/// Shared state for the SSH server.
pub struct ServerState {
    pub config: Arc<GatewayConfig>,
    pub resolver: Arc<dyn IdentityResolver>,
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    server: Arc<ServerState>,

    /// Client's socket address.
    peer_addr: SocketAddr,

    /// Authenticated user id (set after auth).
    user_id: Option<String>,

    /// Offered keys that resolved to a user, by fingerprint.
    offered: HashMap<String, String>,

    /// `GIT_PROTOCOL` values sent via env requests, per channel.
    git_protocols: HashMap<ChannelId, String>,

    /// Running git commands.
    sessions: HashMap<ChannelId, GitSession>,
}

struct GitSession {
    /// Dropped on channel EOF to close the child's stdin.
    stdin_tx: Option<mpsc::Sender<Vec<u8>>>,
    task: JoinHandle<()>,
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

impl ConnectionHandler {
    fn new(server: Arc<ServerState>, peer_addr: SocketAddr) -> Self {
        Self {
            server,
            peer_addr,
            user_id: None,
            offered: HashMap::new(),
            git_protocols: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Session channels are only opened for an authenticated user.
    fn session_allowed(&self) -> bool {
        self.user_id.is_some()
    }

    /// Resolve a key to its owner. Unknown keys and resolver errors both
    /// yield `None` so the client can try its next key.
    async fn resolve_key(&mut self, public_key: &PublicKey) -> Option<String> {
        let fingerprint = compute_fingerprint_from_pubkey(public_key);
        if let Some(user_id) = self.offered.get(&fingerprint) {
            return Some(user_id.clone());
        }

        match self.server.resolver.resolve(&fingerprint).await {
            Ok(Some(user_id)) => {
                debug!(fingerprint = %fingerprint, user_id = %user_id, "Key resolved");
                self.offered.insert(fingerprint, user_id.clone());
                Some(user_id)
            }
            Ok(None) => {
                debug!(fingerprint = %fingerprint, peer = %self.peer_addr, "Key not registered");
                None
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    fingerprint = %fingerprint,
                    peer = %self.peer_addr,
                    "Rejecting key, lookup failed: {}",
                    e
                );
                None
            }
            Err(e) => {
                debug!(fingerprint = %fingerprint, "Rejecting key: {}", e);
                None
            }
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.task.abort();
        }
    }
}

/// Output half of an SSH session channel.
struct ChannelSink {
    handle: Handle,
    channel_id: ChannelId,
}

#[async_trait]
impl ChannelOutput for ChannelSink {
    async fn stdout(&self, data: &[u8]) -> bool {
        self.handle
            .data(self.channel_id, CryptoVec::from_slice(data))
            .await
            .is_ok()
    }

    async fn stderr(&self, data: &[u8]) -> bool {
        self.handle
            .extended_data(
                self.channel_id,
                1, // SSH_EXTENDED_DATA_STDERR
                CryptoVec::from_slice(data),
            )
            .await
            .is_ok()
    }

    async fn finish(&self, exit_status: u32) {
        let _ = self
            .handle
            .exit_status_request(self.channel_id, exit_status)
            .await;
        let _ = self.handle.eof(self.channel_id).await;
        let _ = self.handle.close(self.channel_id).await;
    }
}

/// Reply to a health check: `OK\n` and exit status 0.
async fn answer_health_check(output: &impl ChannelOutput) {
    output.stdout(b"OK\n").await;
    output.finish(0).await;
}

/// Serve one exec request on a channel and return the exit status reported
/// to the client. An empty command is answered like a shell request.
async fn serve_exec(
    command_line: &str,
    user_id: &str,
    git_binary: &str,
    git_protocol: Option<&str>,
    stdin_rx: mpsc::Receiver<Vec<u8>>,
    output: &impl ChannelOutput,
) -> u32 {
    let command = match GitCommand::parse(command_line) {
        Ok(command) => command,
        Err(CommandError::Empty) => {
            answer_health_check(output).await;
            return 0;
        }
        Err(e) => {
            info!(user_id = %user_id, "Refusing command '{}': {}", command_line, e);
            output.stderr(format!("{}\n", e).as_bytes()).await;
            output.finish(1).await;
            return 1;
        }
    };

    let child = match command.command(git_binary, user_id, git_protocol).spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(
                user_id = %user_id,
                service = %command.service,
                "Failed to start {}: {}",
                git_binary,
                e
            );
            output
                .stderr(format!("failed to start {}: {}\n", command.service, e).as_bytes())
                .await;
            output.finish(1).await;
            return 1;
        }
    };

    info!(
        user_id = %user_id,
        service = %command.service,
        repository = %command.repository,
        "Running git command"
    );

    let status = git::pump(child, stdin_rx, output).await;
    debug!(service = %command.service, exit_status = status, "git command finished");
    status
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Session channel opened: {:?}", channel.id());
        Ok(self.session_allowed())
    }

    /// Called for each key the client offers, before it proves possession.
    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("Public key offered by '{}' from {}", user, self.peer_addr);

        match self.resolve_key(public_key).await {
            Some(_) => Ok(Auth::Accept),
            None => Ok(reject()),
        }
    }

    /// Called once the client has signed with the offered key.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        match self.resolve_key(public_key).await {
            Some(user_id) => {
                info!(
                    user_id = %user_id,
                    ssh_user = user,
                    peer = %self.peer_addr,
                    "Authenticated"
                );
                self.user_id = Some(user_id);
                Ok(Auth::Accept)
            }
            None => Ok(reject()),
        }
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == GIT_PROTOCOL_ENV {
            debug!("GIT_PROTOCOL={} on channel {:?}", variable_value, channel_id);
            self.git_protocols
                .insert(channel_id, variable_value.to_string());
            session.channel_success(channel_id)?;
        } else {
            session.channel_failure(channel_id)?;
        }
        Ok(())
    }

    /// A shell request with no command answers as a health check.
    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Shell request on channel {:?}", channel_id);
        session.channel_success(channel_id)?;

        let sink = ChannelSink {
            handle: session.handle(),
            channel_id,
        };
        tokio::spawn(async move {
            answer_health_check(&sink).await;
        });
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let user_id = self
            .user_id
            .clone()
            .ok_or_else(|| anyhow!("Not authenticated"))?;
        let command_line = String::from_utf8_lossy(data).to_string();

        // Confirm the exec request was accepted (OpenSSH sets want-reply=true).
        session.channel_success(channel_id)?;
        let sink = ChannelSink {
            handle: session.handle(),
            channel_id,
        };

        let git_binary = self.server.config.git_binary.clone();
        let git_protocol = self.git_protocols.get(&channel_id).cloned();
        let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(32);
        let task = tokio::spawn(async move {
            serve_exec(
                &command_line,
                &user_id,
                &git_binary,
                git_protocol.as_deref(),
                stdin_rx,
                &sink,
            )
            .await;
        });

        self.sessions.insert(
            channel_id,
            GitSession {
                stdin_tx: Some(stdin_tx),
                task,
            },
        );
        Ok(())
    }

    /// Handle data from client.
    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(tx) = self
            .sessions
            .get(&channel_id)
            .and_then(|s| s.stdin_tx.as_ref())
        {
            let _ = tx.send(data.to_vec()).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel EOF: {:?}", channel_id);
        if let Some(session) = self.sessions.get_mut(&channel_id) {
            session.stdin_tx = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {:?}", channel_id);
        if let Some(session) = self.sessions.remove(&channel_id) {
            session.task.abort();
        }
        self.git_protocols.remove(&channel_id);
        Ok(())
    }
}

/// Run the SSH server until `shutdown` resolves.
pub async fn run_server(
    config: Arc<GatewayConfig>,
    resolver: Arc<dyn IdentityResolver>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let key = load_or_generate_host_key(&config.host_key_path).await?;

    let russh_config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        methods: MethodSet::from(&[MethodKind::PublicKey][..]),
        keys: vec![key],
        ..Default::default()
    });

    let server_state = Arc::new(ServerState {
        config: config.clone(),
        resolver,
    });

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind SSH listener on {}", addr))?;
    info!("SSH server listening on {}", listener.local_addr()?);

    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept SSH connection: {}", e);
                    continue;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            _ = &mut shutdown => break,
        };

        let server_state = server_state.clone();
        let russh_config = russh_config.clone();

        connections.spawn(async move {
            let handler = ConnectionHandler::new(server_state, peer_addr);
            match russh::server::run_stream(russh_config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        warn!("SSH session error from {}: {}", peer_addr, e);
                    }
                }
                Err(e) => {
                    warn!("SSH connection error from {}: {}", peer_addr, e);
                }
            }
        });
    }

    info!(
        "SSH server shutting down, closing {} connection(s)",
        connections.len()
    );
    connections.abort_all();
    while connections.join_next().await.is_some() {}
    Ok(())
}

/// Load host key from file or generate a new one.
async fn load_or_generate_host_key(path: &std::path::Path) -> Result<russh::keys::PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if path.exists() {
        info!("Loading host key from {}", path.display());
        return russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {}", path.display()));
    }

    info!("Generating new Ed25519 host key");
    let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .context("Failed to generate host key")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let encoded = key
        .to_openssh(LineEnding::LF)
        .context("Failed to encode host key")?;
    tokio::fs::write(path, encoded.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    info!("Saved host key to {}", path.display());
    Ok(key)
}
