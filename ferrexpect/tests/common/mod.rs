//! In-process stand-ins for an SSH server: a transport whose shell is a small
//! scripted shell, and whose forwarding uses plain local TCP.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use ferrexpect::error::{Result, TransportError};
use ferrexpect::transport::{
    ChannelPeer, ForwardedConnection, NonBlocking, OpenFlags, QueuedChannel, RemoteFile,
    RemoteFs, RemoteListener, Transport,
};
use ferrexpect::{Session, SessionConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const MOTD: &str = "Welcome to the ferrexpect test shell";

#[derive(Debug, Clone)]
pub struct FakeConfig {
    pub user: String,
    pub password: String,
    pub prompt_name: String,
    /// sudo grants root without asking for a password.
    pub nopasswd: bool,
    /// Local directory standing in for the remote filesystem root.
    pub fs_root: Option<PathBuf>,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            user: "lowly_pleb".to_string(),
            password: "bar".to_string(),
            prompt_name: "Command".to_string(),
            nopasswd: false,
            fs_root: None,
        }
    }
}

pub struct FakeTransport {
    config: FakeConfig,
    forwards: Mutex<HashMap<u16, CancellationToken>>,
}

impl Transport for FakeTransport {
    type Config = FakeConfig;
    type Shell = QueuedChannel;
    type Stream = TcpStream;
    type Fs = LocalFs;

    fn connect(config: &FakeConfig) -> impl Future<Output = Result<Self>> + Send {
        let config = config.clone();
        async move {
            Ok(Self {
                config,
                forwards: Mutex::new(HashMap::new()),
            })
        }
    }

    fn open_shell(&self, _terminal: &str) -> impl Future<Output = Result<QueuedChannel>> + Send {
        let config = self.config.clone();
        async move {
            let (channel, peer) = QueuedChannel::pair(64);
            tokio::spawn(run_shell(peer, config));
            Ok(channel)
        }
    }

    fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        _originator: SocketAddr,
    ) -> impl Future<Output = Result<TcpStream>> + Send {
        let host = host.to_string();
        async move {
            let stream = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(TransportError::Io)?;
            Ok(stream)
        }
    }

    fn request_remote_forward(
        &self,
        bind_addr: &str,
        port: u16,
    ) -> impl Future<Output = Result<RemoteListener<TcpStream>>> + Send {
        let bind_addr = bind_addr.to_string();
        async move {
            let listener = TcpListener::bind((bind_addr.as_str(), port))
                .await
                .map_err(TransportError::Io)?;
            let bound_port = listener.local_addr().map_err(TransportError::Io)?.port();

            let (tx, rx) = mpsc::channel(8);
            let cancel = CancellationToken::new();
            self.forwards
                .lock()
                .unwrap()
                .insert(bound_port, cancel.clone());

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => {
                            let Ok((stream, peer)) = accepted else { break };
                            let connection = ForwardedConnection {
                                stream,
                                originator: peer.ip().to_string(),
                                originator_port: peer.port(),
                            };
                            if tx.send(connection).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            Ok(RemoteListener::new(bound_port, rx))
        }
    }

    fn cancel_remote_forward(&self, _bind_addr: &str, port: u16) -> impl Future<Output = Result<()>> + Send {
        if let Some(cancel) = self.forwards.lock().unwrap().remove(&port) {
            cancel.cancel();
        }
        async { Ok(()) }
    }

    fn open_fs(&self) -> impl Future<Output = Result<LocalFs>> + Send {
        let root = self.config.fs_root.clone();
        async move {
            let root = root.ok_or_else(|| TransportError::Sftp("subsystem request failed".into()))?;
            Ok(LocalFs { root })
        }
    }

    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send {
        for (_, cancel) in self.forwards.lock().unwrap().drain() {
            cancel.cancel();
        }
        async { Ok(()) }
    }
}

/// Remote filesystem backed by a local directory; never blocks.
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl NonBlocking for LocalFs {
    fn block_directions(&self) -> Option<Interest> {
        None
    }

    fn ready(&mut self, _interest: Interest) -> impl Future<Output = io::Result<()>> + Send {
        async { Ok(()) }
    }
}

impl RemoteFs for LocalFs {
    type File = LocalFile;

    fn try_open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> io::Result<LocalFile> {
        let mut options = std::fs::OpenOptions::new();
        options
            .read(flags.read)
            .write(flags.write)
            .create(flags.create)
            .truncate(flags.truncate);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        Ok(LocalFile {
            file: options.open(self.resolve(path))?,
        })
    }

    fn try_mkdir(&mut self, path: &str, mode: u32) -> io::Result<()> {
        let dir = self.resolve(path);
        std::fs::create_dir(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    fn try_read_dir(&mut self, path: &str) -> io::Result<Vec<String>> {
        std::fs::read_dir(self.resolve(path))?
            .map(|entry| -> io::Result<String> {
                Ok(entry?.file_name().to_string_lossy().into_owned())
            })
            .collect()
    }
}

pub struct LocalFile {
    file: std::fs::File,
}

impl NonBlocking for LocalFile {
    fn block_directions(&self) -> Option<Interest> {
        None
    }

    fn ready(&mut self, _interest: Interest) -> impl Future<Output = io::Result<()>> + Send {
        async { Ok(()) }
    }
}

impl RemoteFile for LocalFile {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file.write(data)
    }

    fn try_fsync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn try_close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FakeShell {
    config: FakeConfig,
    root: bool,
    awaiting_password: bool,
    line: String,
}

impl FakeShell {
    fn prompt(&self) -> String {
        let sigil = if self.root { '#' } else { '$' };
        format!("{}{} ", self.config.prompt_name, sigil)
    }

    /// Output for one completed line, and whether the shell should end.
    fn run_line(&mut self, line: &str) -> (String, bool) {
        if self.awaiting_password {
            self.awaiting_password = false;
            let mut out = String::from("\r\n");
            if line == self.config.password {
                self.root = true;
            } else {
                out.push_str("Sorry, try again.\r\n");
            }
            out.push_str(&self.prompt());
            return (out, false);
        }

        let mut out = String::new();
        match line {
            "" => {}
            "reply" => out.push_str("PONG!\r\n"),
            "whoami" => {
                let user = if self.root { "root" } else { self.config.user.as_str() };
                out.push_str(user);
                out.push_str("\r\n");
            }
            "color" => out.push_str("\x1b[31mred\x1b[0m \x1b[1mbold\x1b[0m\r\n"),
            "exit" if self.root => {
                self.root = false;
                out.push_str("logout\r\n");
            }
            "exit" => return ("logout\r\n".to_string(), true),
            cmd if cmd.starts_with("sudo") => {
                if self.config.nopasswd {
                    self.root = true;
                } else {
                    self.awaiting_password = true;
                    return (format!("[sudo] password for {}: ", self.config.user), false);
                }
            }
            cmd if cmd.starts_with("prompt ") => {
                self.config.prompt_name = cmd["prompt ".len()..].to_string();
            }
            cmd => out.push_str(&format!("sh: {cmd}: command not found\r\n")),
        }
        out.push_str(&self.prompt());
        (out, false)
    }

    /// Feed typed bytes; returns what the terminal shows and whether the shell ended.
    fn feed(&mut self, input: &[u8]) -> (String, bool) {
        let mut out = String::new();
        for &byte in input {
            match byte {
                b'\r' | b'\n' => {
                    if !self.awaiting_password {
                        out.push_str("\r\n");
                    }
                    let line = std::mem::take(&mut self.line);
                    let (reply, done) = self.run_line(&line);
                    out.push_str(&reply);
                    if done {
                        return (out, true);
                    }
                }
                0x03 => {
                    self.line.clear();
                    self.awaiting_password = false;
                    out.push_str("^C\r\n");
                    out.push_str(&self.prompt());
                }
                _ => {
                    self.line.push(byte as char);
                    if !self.awaiting_password {
                        out.push(byte as char);
                    }
                }
            }
        }
        (out, false)
    }
}

async fn run_shell(mut peer: ChannelPeer, config: FakeConfig) {
    let mut shell = FakeShell {
        config,
        root: false,
        awaiting_password: false,
        line: String::new(),
    };

    let banner = format!("{MOTD}\r\n{}", shell.prompt());
    if peer.tx.send(Bytes::from(banner)).await.is_err() {
        return;
    }

    while let Some(chunk) = peer.rx.recv().await {
        let (out, done) = shell.feed(&chunk);
        if !out.is_empty() && peer.tx.send(Bytes::from(out)).await.is_err() {
            return;
        }
        if done {
            return;
        }
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        expect_timeout: Duration::from_secs(5),
        ..SessionConfig::default()
    }
}

pub fn session() -> Session<FakeTransport> {
    session_with(FakeConfig::default(), test_config())
}

pub fn session_with(fake: FakeConfig, config: SessionConfig) -> Session<FakeTransport> {
    init_logging();
    Session::new(fake, config)
}

/// TCP server that echoes everything back; returns its address.
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// A local port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Send `payload` and read the same number of bytes back.
pub async fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}
