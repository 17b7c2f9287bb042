//! Shell channel backed by a pair of bounded byte queues.
//!
//! The russh transport runs a pump task that moves channel messages in and
//! out of these queues; the session side sees a plain non-blocking channel.

use std::future::Future;
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use log::trace;
use tokio::io::Interest;
use tokio::sync::mpsc::error::{SendError, TryRecvError, TrySendError};
use tokio::sync::mpsc::{self, OwnedPermit, Sender};

use super::traits::{NonBlocking, ShellChannel};

/// The far end of a [`QueuedChannel`]: whatever produces shell output and
/// consumes shell input.
pub struct ChannelPeer {
    /// Bytes sent here show up in [`QueuedChannel::try_read`].
    pub tx: mpsc::Sender<Bytes>,
    /// Bytes written with [`QueuedChannel::try_write`] arrive here.
    /// Yields `None` once the channel is closed.
    pub rx: mpsc::Receiver<Bytes>,
}

/// Non-blocking shell channel over two bounded queues.
pub struct QueuedChannel {
    inbound: mpsc::Receiver<Bytes>,
    outbound: Option<Sender<Bytes>>,
    permit: Option<OwnedPermit<Bytes>>,
    pending: BytesMut,
    eof: bool,
}

impl QueuedChannel {
    /// Wrap existing queues.
    pub fn new(inbound: mpsc::Receiver<Bytes>, outbound: Sender<Bytes>) -> Self {
        Self {
            inbound,
            outbound: Some(outbound),
            permit: None,
            pending: BytesMut::new(),
            eof: false,
        }
    }

    /// Create a channel and its peer with `capacity` chunks of buffering per direction.
    pub fn pair(capacity: usize) -> (Self, ChannelPeer) {
        let (to_channel, inbound) = mpsc::channel(capacity);
        let (outbound, from_channel) = mpsc::channel(capacity);
        (
            Self::new(inbound, outbound),
            ChannelPeer {
                tx: to_channel,
                rx: from_channel,
            },
        )
    }

    /// Move already-queued chunks into the pending buffer without waiting.
    fn fill_pending(&mut self) {
        while self.pending.is_empty() && !self.eof {
            match self.inbound.try_recv() {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.eof = true,
            }
        }
    }
}

async fn reserve(sender: Option<Sender<Bytes>>) -> Result<OwnedPermit<Bytes>, SendError<()>> {
    match sender {
        Some(tx) => tx.reserve_owned().await,
        None => std::future::pending().await,
    }
}

impl NonBlocking for QueuedChannel {
    fn block_directions(&self) -> Option<Interest> {
        let read_blocked = self.pending.is_empty() && !self.eof && self.inbound.is_empty();
        let write_blocked = self.permit.is_none()
            && self.outbound.as_ref().is_some_and(|tx| tx.capacity() == 0);

        match (read_blocked, write_blocked) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn ready(&mut self, interest: Interest) -> impl Future<Output = io::Result<()>> + Send {
        async move {
            let want_read = interest.is_readable() && self.pending.is_empty() && !self.eof;
            let sender = match &self.outbound {
                Some(tx) if interest.is_writable() && self.permit.is_none() => Some(tx.clone()),
                _ => None,
            };
            let want_write = sender.is_some();

            tokio::select! {
                chunk = self.inbound.recv(), if want_read => {
                    match chunk {
                        Some(chunk) => self.pending.extend_from_slice(&chunk),
                        None => self.eof = true,
                    }
                    Ok(())
                }
                permit = reserve(sender), if want_write => {
                    let permit = permit.map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
                    self.permit = Some(permit);
                    Ok(())
                }
                else => Ok(()),
            }
        }
    }
}

impl ShellChannel for QueuedChannel {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fill_pending();

        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            trace!("channel read {} bytes", n);
            return Ok(n);
        }

        if self.eof {
            return Ok(0);
        }

        Err(io::ErrorKind::WouldBlock.into())
    }

    fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        let Some(tx) = &self.outbound else {
            return Err(io::ErrorKind::BrokenPipe.into());
        };
        if data.is_empty() {
            return Ok(0);
        }

        let chunk = Bytes::copy_from_slice(data);
        if let Some(permit) = self.permit.take() {
            permit.send(chunk);
            return Ok(data.len());
        }

        match tx.try_send(chunk) {
            Ok(()) => Ok(data.len()),
            Err(TrySendError::Full(_)) => Err(io::ErrorKind::WouldBlock.into()),
            Err(TrySendError::Closed(_)) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn try_close(&mut self) -> io::Result<()> {
        self.permit = None;
        self.outbound = None;
        Ok(())
    }
}
