//! SSH transport layer.
//!
//! The session engine talks to the SSH connection only through the traits in
//! this module. [`SshTransport`] implements them with russh.

pub mod config;
mod queued;
mod sftp;
mod ssh;
mod traits;

pub use config::{AuthMethod, HostKeyVerification, SshConfig};
pub use queued::{ChannelPeer, QueuedChannel};
pub use sftp::{SftpFile, SftpFs};
pub use ssh::SshTransport;
pub use traits::{
    ForwardedConnection, NonBlocking, OpenFlags, RemoteFile, RemoteFs, RemoteListener,
    ShellChannel, Transport,
};
