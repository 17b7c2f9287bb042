//! Awaitable wrapper around non-blocking channel and file primitives.
//!
//! Every primitive either makes progress or reports
//! [`io::ErrorKind::WouldBlock`]. [`Blocking`] retries until it stops
//! reporting that, waiting on whatever direction the handle says it is
//! blocked on in between.

use std::io;
use std::time::Duration;

use log::trace;

use crate::transport::{NonBlocking, ShellChannel};

/// Outcome of [`Blocking::read_available`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were read into the buffer.
    Data(usize),
    /// Nothing arrived within the poll interval.
    Idle,
    /// The remote side closed the stream.
    Eof,
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Retry-until-ready adapter for a [`NonBlocking`] handle.
#[derive(Debug)]
pub struct Blocking<C> {
    inner: C,
}

impl<C: NonBlocking> Blocking<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    /// Wait until the handle can make progress in the direction it is blocked on.
    ///
    /// A `timeout` bounds the wait; running out is not an error, the caller
    /// simply retries.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let Some(interest) = self.inner.block_directions() else {
            // Nothing reported as blocked; let other tasks run before the retry.
            tokio::task::yield_now().await;
            return Ok(());
        };

        let ready = self.inner.ready(interest);
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, ready).await {
                Ok(result) => result,
                Err(_) => Ok(()),
            },
            None => ready.await,
        }
    }

    /// Run `op` until it returns something other than `WouldBlock`.
    pub async fn retry<T, F>(&mut self, mut op: F) -> io::Result<T>
    where
        F: FnMut(&mut C) -> io::Result<T> + Send,
    {
        loop {
            match op(&mut self.inner) {
                Err(e) if would_block(&e) => self.wait(None).await?,
                other => return other,
            }
        }
    }

    /// Submit all of `data` through `op`, resubmitting the remainder after
    /// partial writes.
    ///
    /// `Ok(0)` and `WouldBlock` both mean nothing was accepted yet.
    pub async fn write_all_with<F>(&mut self, data: &[u8], mut op: F) -> io::Result<()>
    where
        F: FnMut(&mut C, &[u8]) -> io::Result<usize> + Send,
    {
        let mut written = 0;
        while written < data.len() {
            match op(&mut self.inner, &data[written..]) {
                Ok(0) => self.wait(None).await?,
                Ok(n) => written += n,
                Err(e) if would_block(&e) => self.wait(None).await?,
                Err(e) => return Err(e),
            }
        }
        trace!("wrote {} bytes", written);
        Ok(())
    }

    /// Read once, waiting at most `poll` for data if nothing is available.
    pub async fn read_available_with<F>(
        &mut self,
        buf: &mut [u8],
        poll: Duration,
        mut op: F,
    ) -> io::Result<ReadOutcome>
    where
        F: FnMut(&mut C, &mut [u8]) -> io::Result<usize> + Send,
    {
        for attempt in 0..2 {
            match op(&mut self.inner, buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(e) if would_block(&e) => {
                    if attempt == 0 {
                        self.wait(Some(poll)).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ReadOutcome::Idle)
    }
}

impl<C: ShellChannel> Blocking<C> {
    /// Write all bytes to the shell channel.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all_with(data, |c, d| c.try_write(d)).await
    }

    /// Read whatever the shell channel has, waiting at most `poll`.
    pub async fn read_available(&mut self, buf: &mut [u8], poll: Duration) -> io::Result<ReadOutcome> {
        self.read_available_with(buf, poll, |c, b| c.try_read(b)).await
    }

    /// Close the shell channel.
    pub async fn close(&mut self) -> io::Result<()> {
        self.retry(|c| c.try_close()).await
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use tokio::io::Interest;

    use super::*;

    /// Accepts at most `max_write` bytes per call and reports WouldBlock on
    /// every other attempt.
    struct Stingy {
        max_write: usize,
        calls: usize,
        written: Vec<u8>,
        readable: Vec<u8>,
        eof: bool,
        ready_calls: usize,
    }

    impl Stingy {
        fn new(max_write: usize) -> Self {
            Self {
                max_write,
                calls: 0,
                written: Vec::new(),
                readable: Vec::new(),
                eof: false,
                ready_calls: 0,
            }
        }
    }

    impl NonBlocking for Stingy {
        fn block_directions(&self) -> Option<Interest> {
            Some(Interest::READABLE.add(Interest::WRITABLE))
        }

        fn ready(&mut self, _interest: Interest) -> impl Future<Output = io::Result<()>> + Send {
            self.ready_calls += 1;
            async { Ok(()) }
        }
    }

    impl ShellChannel for Stingy {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.readable.is_empty() {
                return if self.eof {
                    Ok(0)
                } else {
                    Err(io::ErrorKind::WouldBlock.into())
                };
            }
            let n = buf.len().min(self.readable.len());
            buf[..n].copy_from_slice(&self.readable[..n]);
            self.readable.drain(..n);
            Ok(n)
        }

        fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            if self.calls % 3 == 0 {
                return Ok(0);
            }
            let n = data.len().min(self.max_write);
            self.written.extend_from_slice(&data[..n]);
            Ok(n)
        }

        fn try_close(&mut self) -> io::Result<()> {
            if self.calls == 0 {
                self.calls += 1;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_write_all_survives_partial_and_blocked_writes() {
        let mut channel = Blocking::new(Stingy::new(3));
        channel.write_all(b"hello world").await.unwrap();
        assert_eq!(channel.get_ref().written, b"hello world");
        assert!(channel.get_ref().ready_calls > 0);
    }

    #[tokio::test]
    async fn test_read_available_idle_then_data_then_eof() {
        let mut channel = Blocking::new(Stingy::new(8));
        let mut buf = [0u8; 8];
        let poll = Duration::from_millis(10);

        assert_eq!(
            channel.read_available(&mut buf, poll).await.unwrap(),
            ReadOutcome::Idle
        );

        channel.get_mut().readable.extend_from_slice(b"abc");
        assert_eq!(
            channel.read_available(&mut buf, poll).await.unwrap(),
            ReadOutcome::Data(3)
        );
        assert_eq!(&buf[..3], b"abc");

        channel.get_mut().eof = true;
        assert_eq!(
            channel.read_available(&mut buf, poll).await.unwrap(),
            ReadOutcome::Eof
        );
    }

    #[tokio::test]
    async fn test_close_retries_would_block() {
        let mut channel = Blocking::new(Stingy::new(1));
        channel.close().await.unwrap();
        assert_eq!(channel.get_ref().ready_calls, 1);
    }

    #[tokio::test]
    async fn test_retry_propagates_real_errors() {
        let mut channel = Blocking::new(Stingy::new(1));
        let err = channel
            .retry(|_| -> io::Result<()> { Err(io::ErrorKind::ConnectionReset.into()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
