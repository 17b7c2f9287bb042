//! Error types for ferrexpect.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Main error type for ferrexpect operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SSH transport-level errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel and expect errors
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Session-level errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Port forwarding errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Remote file transfer errors
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),
}

impl Error {
    /// Whether this error is an expect call running past its deadline.
    pub fn is_expect_timeout(&self) -> bool {
        matches!(self, Error::Channel(ChannelError::ExpectTimeout { .. }))
    }

    /// Whether this error is a rejected escalation password.
    pub fn is_bad_sudo_password(&self) -> bool {
        matches!(self, Error::Session(SessionError::BadSudoPassword))
    }
}

/// Transport layer errors (SSH connection, authentication, forwarding requests).
#[derive(Error, Debug)]
pub enum TransportError {
    /// SSH handshake or protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Authentication failed
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// SSH key error
    #[error("SSH key error: {0}")]
    Key(String),

    /// Host is not present in known_hosts and verification is strict
    #[error("Host key for {host}:{port} is unknown")]
    HostKeyUnknown { host: String, port: u16 },

    /// Host key does not match the known_hosts entry
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// known_hosts could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// The server refused a port forwarding request
    #[error("Remote forward on {address}:{port} refused")]
    ForwardRefused { address: String, port: u16 },

    /// ssh-agent could not be reached or refused to sign
    #[error("ssh-agent error: {0}")]
    Agent(String),

    /// The SFTP subsystem could not be started
    #[error("SFTP error: {0}")]
    Sftp(String),

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Channel layer errors (shell I/O, pattern matching).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// No pattern matched before the deadline
    #[error("Timed out after {timeout:?} waiting for {patterns:?}")]
    ExpectTimeout {
        patterns: Vec<String>,
        timeout: Duration,
    },

    /// Channel closed unexpectedly
    #[error("Channel closed")]
    Closed,

    /// Unknown text encoding label
    #[error("Unknown encoding '{0}'")]
    UnknownEncoding(String),

    /// Invalid regex pattern
    #[error("Invalid regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// I/O error on the channel
    #[error("Channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Session layer errors (lifecycle, escalation, configuration).
#[derive(Error, Debug)]
pub enum SessionError {
    /// Session not connected
    #[error("Session not connected - call login() first")]
    NotConnected,

    /// Session already closed by exit()
    #[error("Session already closed")]
    Closed,

    /// The escalation password was rejected
    #[error("Bad sudo password provided, could not gain root")]
    BadSudoPassword,

    /// Invalid configuration in the session builder
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

/// Port forwarding errors.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Could not bind the local listener
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// SOCKS client sent something we cannot serve
    #[error("SOCKS handshake failed: {0}")]
    Socks(String),

    /// Worker did not stop within the join timeout and was aborted
    #[error("Tunnel worker did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    /// Worker task panicked or was cancelled
    #[error("Tunnel worker failed: {0}")]
    Worker(String),

    /// I/O error while bridging
    #[error("Tunnel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Remote file transfer errors.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Local filesystem failure
    #[error("Local file '{path}': {source}")]
    Local {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Remote filesystem failure
    #[error("Remote file '{path}': {source}")]
    Remote {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Result type alias using ferrexpect's Error.
pub type Result<T> = std::result::Result<T, Error>;
