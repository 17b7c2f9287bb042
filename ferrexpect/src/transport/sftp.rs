//! SFTP filesystem for [`SshTransport`](super::SshTransport).
//!
//! russh-sftp is async while the [`RemoteFs`] primitives are not. The first
//! call of a primitive starts its request as a task and reports `WouldBlock`;
//! [`NonBlocking::ready`] waits for the reply, and the retried call returns it.

use std::future::Future;
use std::io;
use std::sync::Arc;

use log::{debug, trace};
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::fs::File;
use russh_sftp::protocol::{FileAttributes, OpenFlags as SftpFlags, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::sync::{Mutex, oneshot};

use super::traits::{NonBlocking, OpenFlags, RemoteFile, RemoteFs};

fn io_error(err: SftpError) -> io::Error {
    let kind = match &err {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => io::ErrorKind::NotFound,
            StatusCode::PermissionDenied => io::ErrorKind::PermissionDenied,
            StatusCode::OpUnsupported => io::ErrorKind::Unsupported,
            StatusCode::NoConnection | StatusCode::ConnectionLost => {
                io::ErrorKind::ConnectionAborted
            }
            _ => io::ErrorKind::Other,
        },
        SftpError::Timeout => io::ErrorKind::TimedOut,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err.to_string())
}

fn dropped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "sftp request ended without a reply")
}

fn sftp_flags(flags: OpenFlags) -> SftpFlags {
    let mut out = SftpFlags::empty();
    if flags.read {
        out |= SftpFlags::READ;
    }
    if flags.write {
        out |= SftpFlags::WRITE;
    }
    if flags.create {
        out |= SftpFlags::CREATE;
    }
    if flags.truncate {
        out |= SftpFlags::TRUNCATE;
    }
    out
}

fn mode_attributes(mode: u32) -> FileAttributes {
    FileAttributes {
        permissions: Some(mode),
        ..FileAttributes::empty()
    }
}

/// One request in flight, and its reply once [`wait`](Self::wait) has collected it.
struct Pending<T> {
    reply: Option<oneshot::Receiver<io::Result<T>>>,
    done: Option<io::Result<T>>,
}

impl<T: Send + 'static> Pending<T> {
    fn new() -> Self {
        Self {
            reply: None,
            done: None,
        }
    }

    fn in_flight(&self) -> bool {
        self.reply.is_some()
    }

    /// Reply to the request `start` creates, starting it if none is in flight.
    fn poll<F, Fut>(&mut self, start: F) -> io::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = io::Result<T>> + Send + 'static,
    {
        if let Some(result) = self.done.take() {
            return result;
        }

        let reply = self.reply.get_or_insert_with(|| {
            let (tx, rx) = oneshot::channel();
            let request = start();
            tokio::spawn(async move {
                let _ = tx.send(request.await);
            });
            rx
        });

        match reply.try_recv() {
            Ok(result) => {
                self.reply = None;
                result
            }
            Err(oneshot::error::TryRecvError::Empty) => Err(io::ErrorKind::WouldBlock.into()),
            Err(oneshot::error::TryRecvError::Closed) => {
                self.reply = None;
                Err(dropped())
            }
        }
    }

    async fn wait(&mut self) {
        if let Some(reply) = self.reply.as_mut() {
            let result = reply.await.unwrap_or_else(|_| Err(dropped()));
            self.reply = None;
            self.done = Some(result);
        }
    }
}

/// [`RemoteFs`] over an SFTP session.
pub struct SftpFs {
    session: Arc<SftpSession>,
    open: Pending<File>,
    mkdir: Pending<()>,
    read_dir: Pending<Vec<String>>,
}

impl SftpFs {
    pub fn new(session: SftpSession) -> Self {
        Self {
            session: Arc::new(session),
            open: Pending::new(),
            mkdir: Pending::new(),
            read_dir: Pending::new(),
        }
    }
}

impl NonBlocking for SftpFs {
    fn block_directions(&self) -> Option<Interest> {
        let waiting = self.open.in_flight() || self.mkdir.in_flight() || self.read_dir.in_flight();
        waiting.then_some(Interest::READABLE)
    }

    fn ready(&mut self, _interest: Interest) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            self.open.wait().await;
            self.mkdir.wait().await;
            self.read_dir.wait().await;
            Ok(())
        }
    }
}

impl RemoteFs for SftpFs {
    type File = SftpFile;

    fn try_open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> io::Result<SftpFile> {
        let session = self.session.clone();
        let target = path.to_string();
        let file = self.open.poll(move || async move {
            session
                .open_with_flags_and_attributes(target, sftp_flags(flags), mode_attributes(mode))
                .await
                .map_err(io_error)
        })?;
        trace!("sftp open {}", path);
        Ok(SftpFile::new(file))
    }

    fn try_mkdir(&mut self, path: &str, mode: u32) -> io::Result<()> {
        let session = self.session.clone();
        let target = path.to_string();
        self.mkdir.poll(move || async move {
            if let Err(e) = session.create_dir(target.clone()).await {
                // servers report an existing directory as a generic failure
                if session.try_exists(target).await.unwrap_or(false) {
                    return Err(io::ErrorKind::AlreadyExists.into());
                }
                return Err(io_error(e));
            }
            session
                .set_metadata(target, mode_attributes(mode))
                .await
                .map_err(io_error)
        })
    }

    fn try_read_dir(&mut self, path: &str) -> io::Result<Vec<String>> {
        let session = self.session.clone();
        let target = path.to_string();
        self.read_dir.poll(move || async move {
            let entries = session.read_dir(target).await.map_err(io_error)?;
            Ok(entries
                .map(|entry| entry.file_name())
                .filter(|name| name != "." && name != "..")
                .collect())
        })
    }
}

/// An open SFTP file handle.
pub struct SftpFile {
    file: Arc<Mutex<File>>,
    read: Pending<Vec<u8>>,
    write: Pending<usize>,
    fsync: Pending<()>,
    close: Pending<()>,
}

impl SftpFile {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
            read: Pending::new(),
            write: Pending::new(),
            fsync: Pending::new(),
            close: Pending::new(),
        }
    }
}

impl NonBlocking for SftpFile {
    fn block_directions(&self) -> Option<Interest> {
        let read = self.read.in_flight();
        let write = self.write.in_flight() || self.fsync.in_flight() || self.close.in_flight();
        match (read, write) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn ready(&mut self, _interest: Interest) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            self.read.wait().await;
            self.write.wait().await;
            self.fsync.wait().await;
            self.close.wait().await;
            Ok(())
        }
    }
}

impl RemoteFile for SftpFile {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file.clone();
        let len = buf.len();
        let data = self.read.poll(move || async move {
            let mut data = vec![0u8; len];
            let n = file.lock().await.read(&mut data).await?;
            data.truncate(n);
            Ok(data)
        })?;

        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        let file = self.file.clone();
        let chunk = data.to_vec();
        self.write
            .poll(move || async move { file.lock().await.write(&chunk).await })
    }

    fn try_fsync(&mut self) -> io::Result<()> {
        let file = self.file.clone();
        self.fsync.poll(move || async move {
            let mut file = file.lock().await;
            file.flush().await?;
            // fsync@openssh.com is an optional extension; flushed data is already on the server
            if let Err(e) = file.sync_all().await {
                debug!("sftp fsync unavailable: {}", e);
            }
            Ok(())
        })
    }

    fn try_close(&mut self) -> io::Result<()> {
        let file = self.file.clone();
        self.close
            .poll(move || async move { file.lock().await.shutdown().await })
    }
}
