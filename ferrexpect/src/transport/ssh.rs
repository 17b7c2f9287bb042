//! SSH transport implementation using russh.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use log::{debug, trace, warn};
use russh::client::{self, Handle, Msg};
#[cfg(unix)]
use russh::keys::agent::client::AgentClient;
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use russh::{Channel, ChannelMsg, ChannelStream};
use russh_sftp::client::SftpSession;
use secrecy::ExposeSecret;
use tokio::sync::mpsc;

use super::config::{AuthMethod, HostKeyVerification, SshConfig};
use super::queued::{ChannelPeer, QueuedChannel};
use super::sftp::SftpFs;
use super::traits::{ForwardedConnection, RemoteListener, Transport};
use crate::error::{Result, TransportError};

/// Chunks buffered per direction between the shell pump and the session.
const SHELL_QUEUE_DEPTH: usize = 64;

/// Unanswered keepalives before the connection is considered dead.
const KEEPALIVE_MAX: usize = 3;

/// Forwarded connections buffered per remote listener.
const FORWARD_QUEUE_DEPTH: usize = 16;

type ForwardSender = mpsc::Sender<ForwardedConnection<ChannelStream<Msg>>>;

/// Remote listeners by bound port.
type ForwardMap = Arc<Mutex<HashMap<u32, ForwardSender>>>;

/// SSH transport wrapping a russh client handle.
pub struct SshTransport {
    /// The russh session handle.
    session: Handle<SshHandler>,

    /// Configuration used for this connection.
    config: SshConfig,

    forwards: ForwardMap,
}

impl SshTransport {
    /// Authenticate with the server.
    async fn authenticate(session: &mut Handle<SshHandler>, config: &SshConfig) -> Result<()> {
        let success = match &config.auth {
            AuthMethod::None => session
                .authenticate_none(&config.username)
                .await
                .map_err(TransportError::Ssh)?
                .success(),
            AuthMethod::Password(password) => session
                .authenticate_password(&config.username, password.expose_secret())
                .await
                .map_err(TransportError::Ssh)?
                .success(),
            AuthMethod::PrivateKey { path, passphrase } => {
                let passphrase = passphrase.as_ref().map(|p| p.expose_secret());
                let key = load_secret_key(path, passphrase)
                    .map_err(|e| TransportError::Key(e.to_string()))?;

                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(TransportError::Ssh)?
                    .flatten();

                session
                    .authenticate_publickey(
                        &config.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(TransportError::Ssh)?
                    .success()
            }
            AuthMethod::Agent => Self::authenticate_agent(session, &config.username).await?,
        };

        if !success {
            return Err(TransportError::AuthenticationFailed {
                user: config.username.clone(),
            }
            .into());
        }

        Ok(())
    }

    /// Offer each agent identity in turn until the server accepts one.
    #[cfg(unix)]
    async fn authenticate_agent(session: &mut Handle<SshHandler>, username: &str) -> Result<bool> {
        let mut agent = AgentClient::connect_env()
            .await
            .map_err(|e| TransportError::Agent(e.to_string()))?;
        let identities = agent
            .request_identities()
            .await
            .map_err(|e| TransportError::Agent(e.to_string()))?;
        if identities.is_empty() {
            return Err(TransportError::Agent("agent holds no identities".to_string()).into());
        }

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .map_err(TransportError::Ssh)?
            .flatten();

        for identity in identities {
            match session
                .authenticate_publickey_with(username, identity, hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => trace!("agent identity rejected for {}", username),
                Err(e) => debug!("agent signing failed: {}", e),
            }
        }
        Ok(false)
    }

    #[cfg(not(unix))]
    async fn authenticate_agent(_session: &mut Handle<SshHandler>, _username: &str) -> Result<bool> {
        Err(TransportError::Agent("agent authentication needs a unix socket".to_string()).into())
    }

    /// Configuration this transport was connected with.
    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

impl Transport for SshTransport {
    type Config = SshConfig;
    type Shell = QueuedChannel;
    type Stream = ChannelStream<Msg>;
    type Fs = SftpFs;

    async fn connect(config: &SshConfig) -> Result<Self> {
        // idle sessions and tunnels are normal; keepalives detect a dead peer
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: config.keepalive_interval,
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });

        let host_key_error: Arc<Mutex<Option<TransportError>>> = Arc::new(Mutex::new(None));
        let forwards: ForwardMap = Arc::new(Mutex::new(HashMap::new()));

        let handler = SshHandler {
            host: config.host.clone(),
            port: config.port,
            host_key_verification: config.host_key_verification.clone(),
            known_hosts_path: config.known_hosts_path.clone(),
            host_key_error: host_key_error.clone(),
            forwards: forwards.clone(),
        };

        debug!("connecting to {}", config.socket_addr());
        let mut session = tokio::time::timeout(
            config.timeout,
            client::connect(ssh_config, (config.host.as_str(), config.port), handler),
        )
        .await
        .map_err(|_| TransportError::Timeout(config.timeout))?
        .map_err(|e| {
            // Prefer the detailed host-key error over russh's generic UnknownKey
            let stored = host_key_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            stored.unwrap_or(TransportError::Ssh(e))
        })?;

        Self::authenticate(&mut session, config).await?;
        debug!("authenticated as {}", config.username);

        Ok(Self {
            session,
            config: config.clone(),
            forwards,
        })
    }

    async fn open_shell(&self, terminal: &str) -> Result<QueuedChannel> {
        let channel = self
            .session
            .channel_open_session()
            .await
            .map_err(TransportError::Ssh)?;

        channel
            .request_pty(
                true,
                terminal,
                self.config.terminal_width,
                self.config.terminal_height,
                0,
                0,
                &[],
            )
            .await
            .map_err(TransportError::Ssh)?;

        channel
            .request_shell(true)
            .await
            .map_err(TransportError::Ssh)?;

        let (shell, peer) = QueuedChannel::pair(SHELL_QUEUE_DEPTH);
        tokio::spawn(pump(channel, peer));
        Ok(shell)
    }

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<ChannelStream<Msg>> {
        trace!("direct-tcpip to {}:{} for {}", host, port, originator);
        let channel = self
            .session
            .channel_open_direct_tcpip(
                host,
                u32::from(port),
                originator.ip().to_string(),
                u32::from(originator.port()),
            )
            .await
            .map_err(TransportError::Ssh)?;
        Ok(channel.into_stream())
    }

    async fn request_remote_forward(
        &self,
        bind_addr: &str,
        port: u16,
    ) -> Result<RemoteListener<ChannelStream<Msg>>> {
        let assigned = self
            .session
            .tcpip_forward(bind_addr, u32::from(port))
            .await
            .map_err(TransportError::Ssh)?;
        let bound = if assigned == 0 { u32::from(port) } else { assigned };
        let bound_port = u16::try_from(bound).map_err(|_| TransportError::ForwardRefused {
            address: bind_addr.to_string(),
            port,
        })?;

        let (tx, rx) = mpsc::channel(FORWARD_QUEUE_DEPTH);
        self.forwards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bound, tx);
        debug!("remote forward listening on {}:{}", bind_addr, bound_port);

        Ok(RemoteListener::new(bound_port, rx))
    }

    async fn cancel_remote_forward(&self, bind_addr: &str, port: u16) -> Result<()> {
        self.forwards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&u32::from(port));
        self.session
            .cancel_tcpip_forward(bind_addr, u32::from(port))
            .await
            .map_err(TransportError::Ssh)?;
        Ok(())
    }

    async fn open_fs(&self) -> Result<SftpFs> {
        let channel = self
            .session
            .channel_open_session()
            .await
            .map_err(TransportError::Ssh)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(TransportError::Ssh)?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| TransportError::Sftp(e.to_string()))?;
        debug!("sftp subsystem started");
        Ok(SftpFs::new(sftp))
    }

    async fn disconnect(&self) -> Result<()> {
        self.session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(TransportError::Ssh)?;
        Ok(())
    }
}

/// Move bytes between a russh channel and the queues behind a [`QueuedChannel`].
async fn pump(mut channel: Channel<Msg>, peer: ChannelPeer) {
    let ChannelPeer { tx, mut rx } = peer;

    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if tx.send(Bytes::copy_from_slice(&data)).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("remote shell exited with status {}", exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    debug!("shell channel closed by remote");
                    break;
                }
                Some(other) => trace!("ignoring channel message {:?}", other),
            },
            outgoing = rx.recv() => match outgoing {
                Some(data) => {
                    if let Err(e) = channel.data(&data[..]).await {
                        warn!("shell channel write failed: {}", e);
                        break;
                    }
                }
                None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },
        }
    }
}

/// SSH client handler for russh.
struct SshHandler {
    host: String,
    port: u16,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    /// Detailed host-key error for connect() to surface.
    host_key_error: Arc<Mutex<Option<TransportError>>>,
    forwards: ForwardMap,
}

impl SshHandler {
    /// `Ok(true)` if matched, `Ok(false)` if the host is unknown.
    fn check_known_hosts(&self, pubkey: &PublicKey) -> std::result::Result<bool, TransportError> {
        let result = match &self.known_hosts_path {
            Some(path) => russh::keys::check_known_hosts_path(&self.host, self.port, pubkey, path),
            None => russh::keys::check_known_hosts(&self.host, self.port, pubkey),
        };

        match result {
            Ok(matched) => Ok(matched),
            Err(russh::keys::Error::KeyChanged { line }) => Err(TransportError::HostKeyChanged {
                host: self.host.clone(),
                port: self.port,
                line,
            }),
            Err(e) => Err(TransportError::KnownHosts(e.to_string())),
        }
    }

    fn learn_host_key(&self, pubkey: &PublicKey) -> std::result::Result<(), TransportError> {
        let result = match &self.known_hosts_path {
            Some(path) => {
                russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, pubkey, path)
            }
            None => russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, pubkey),
        };

        result.map_err(|e| TransportError::KnownHosts(e.to_string()))
    }

    fn reject(&self, error: TransportError) -> bool {
        *self
            .host_key_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
        false
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let accepted = match self.host_key_verification {
            HostKeyVerification::Disabled => true,
            HostKeyVerification::AcceptNew => match self.check_known_hosts(server_public_key) {
                Ok(true) => true,
                Ok(false) => {
                    if let Err(e) = self.learn_host_key(server_public_key) {
                        warn!("Failed to save host key: {}", e);
                    }
                    true
                }
                Err(e) => self.reject(e),
            },
            HostKeyVerification::Strict => match self.check_known_hosts(server_public_key) {
                Ok(true) => true,
                Ok(false) => self.reject(TransportError::HostKeyUnknown {
                    host: self.host.clone(),
                    port: self.port,
                }),
                Err(e) => self.reject(e),
            },
        };
        Ok(accepted)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        let sender = self
            .forwards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&connected_port)
            .cloned();

        let Some(sender) = sender else {
            warn!(
                "no tunnel registered for forwarded connection to {}:{}",
                connected_address, connected_port
            );
            let _ = channel.close().await;
            return Ok(());
        };

        let connection = ForwardedConnection {
            stream: channel.into_stream(),
            originator: originator_address.to_string(),
            originator_port: u16::try_from(originator_port).unwrap_or_default(),
        };
        if sender.send(connection).await.is_err() {
            debug!(
                "remote forward on port {} closed before the connection was delivered",
                connected_port
            );
        }
        Ok(())
    }
}
