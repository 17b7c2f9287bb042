//! Capabilities the session engine needs from an SSH implementation.
//!
//! The non-blocking traits follow the std/tokio convention: an operation that
//! cannot make progress returns [`io::ErrorKind::WouldBlock`], the caller asks
//! [`NonBlocking::block_directions`] what it is waiting on and awaits
//! [`NonBlocking::ready`] before retrying. [`Blocking`](crate::channel::Blocking)
//! hides that loop from the rest of the crate.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, Interest};
use tokio::sync::mpsc;

use crate::error::Result;

/// Readiness half of a non-blocking handle.
pub trait NonBlocking: Send {
    /// Which directions the last operation would have blocked on, if any.
    fn block_directions(&self) -> Option<Interest>;

    /// Wait until one of the requested directions can make progress.
    fn ready(&mut self, interest: Interest) -> impl Future<Output = io::Result<()>> + Send;
}

/// An interactive shell channel with a PTY attached.
pub trait ShellChannel: NonBlocking {
    /// Read available bytes. `Ok(0)` means the remote side closed the channel.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Queue bytes for sending. May accept fewer than `data.len()` bytes.
    fn try_write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Send EOF and close the channel.
    fn try_close(&mut self) -> io::Result<()>;
}

/// Flags for [`RemoteFs::try_open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    /// Open an existing file for reading.
    pub const READ: Self = Self {
        read: true,
        write: false,
        create: false,
        truncate: false,
    };

    /// Create or truncate a file for writing.
    pub const WRITE: Self = Self {
        read: false,
        write: true,
        create: true,
        truncate: true,
    };
}

/// A remote filesystem reachable over the session (typically SFTP).
pub trait RemoteFs: NonBlocking {
    type File: RemoteFile;

    /// Open `path` with the given flags. `mode` applies when the file is created.
    fn try_open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> io::Result<Self::File>;

    /// Create a directory.
    fn try_mkdir(&mut self, path: &str, mode: u32) -> io::Result<()>;

    /// List entry names in a directory.
    fn try_read_dir(&mut self, path: &str) -> io::Result<Vec<String>>;
}

/// An open remote file.
pub trait RemoteFile: NonBlocking {
    /// Read into `buf`; `Ok(0)` at end of file.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `data`, possibly partially.
    fn try_write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Flush remote buffers to stable storage.
    fn try_fsync(&mut self) -> io::Result<()>;

    /// Release the remote handle.
    fn try_close(&mut self) -> io::Result<()>;
}

/// A connection the server forwarded to us from a remote listener.
pub struct ForwardedConnection<S> {
    /// Byte stream of the forwarded channel.
    pub stream: S,
    /// Address of the peer that connected on the remote side.
    pub originator: String,
    /// Port of the peer that connected on the remote side.
    pub originator_port: u16,
}

/// A remote listener set up by [`Transport::request_remote_forward`].
pub struct RemoteListener<S> {
    bound_port: u16,
    incoming: mpsc::Receiver<ForwardedConnection<S>>,
}

impl<S> RemoteListener<S> {
    pub fn new(bound_port: u16, incoming: mpsc::Receiver<ForwardedConnection<S>>) -> Self {
        Self {
            bound_port,
            incoming,
        }
    }

    /// Port the server actually listens on (differs from the request when it was 0).
    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    /// Next forwarded connection, or `None` once the transport stops forwarding.
    pub async fn accept(&mut self) -> Option<ForwardedConnection<S>> {
        self.incoming.recv().await
    }
}

/// An authenticated SSH connection.
///
/// Methods take `&self` and are called concurrently from tunnel workers, so
/// implementations share it behind an `Arc`.
pub trait Transport: Send + Sync + Sized + 'static {
    /// Connection parameters.
    type Config: Clone + Send + Sync + 'static;

    /// Shell channel type.
    type Shell: ShellChannel + 'static;

    /// Byte stream type for tunnelled TCP connections.
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    /// Remote filesystem type.
    type Fs: RemoteFs + 'static;

    /// Connect and authenticate.
    fn connect(config: &Self::Config) -> impl Future<Output = Result<Self>> + Send;

    /// Open a channel, request a PTY with the given terminal type and start a shell.
    fn open_shell(&self, terminal: &str) -> impl Future<Output = Result<Self::Shell>> + Send;

    /// Ask the server to connect to `host:port` on our behalf.
    fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Ask the server to listen on `bind_addr:port` and forward connections back.
    fn request_remote_forward(
        &self,
        bind_addr: &str,
        port: u16,
    ) -> impl Future<Output = Result<RemoteListener<Self::Stream>>> + Send;

    /// Stop a listener created by [`request_remote_forward`](Self::request_remote_forward).
    fn cancel_remote_forward(
        &self,
        bind_addr: &str,
        port: u16,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Start a remote filesystem session on this connection.
    fn open_fs(&self) -> impl Future<Output = Result<Self::Fs>> + Send;

    /// Disconnect from the server.
    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;
}
