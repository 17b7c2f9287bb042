//! PTY channel with expect-style reads.

use std::time::Duration;

use log::{debug, trace};
use tokio::time::Instant;

use super::blocking::{Blocking, ReadOutcome};
use super::buffer::OutputBuffer;
use super::patterns::{MatchSet, compile_pattern};
use crate::error::{ChannelError, Result};
use crate::transport::ShellChannel;

/// Configuration for PTY channel behavior.
#[derive(Debug, Clone)]
pub struct PtyConfig {
    /// Encoding label for decoding output and encoding input.
    pub encoding: String,

    /// Line terminator appended by `sendline`.
    pub newline: String,

    /// Default expect timeout; zero disables it.
    pub timeout: Duration,

    /// How long one read waits for data before patterns are re-checked.
    pub poll_interval: Duration,

    /// Size of a single channel read.
    pub read_chunk_size: usize,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            encoding: "utf-8".to_string(),
            newline: "\r".to_string(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            read_chunk_size: 8192,
        }
    }
}

/// Per-call expect settings.
#[derive(Debug, Clone)]
pub struct ExpectOptions {
    /// Prepended to every pattern before matching (e.g. `^`).
    pub prefix: String,

    /// Strip terminal control sequences before matching.
    pub strip_ansi: bool,

    /// `None` uses the channel default; `Some(Duration::ZERO)` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for ExpectOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            strip_ansi: true,
            timeout: None,
        }
    }
}

impl ExpectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn strip_ansi(mut self, strip: bool) -> Self {
        self.strip_ansi = strip;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of an expect call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectResult {
    /// Index of the winning pattern in the match set.
    Matched(usize),
    /// The channel reached end-of-stream first.
    Eof,
}

impl ExpectResult {
    pub fn index(&self) -> Option<usize> {
        match self {
            ExpectResult::Matched(index) => Some(*index),
            ExpectResult::Eof => None,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, ExpectResult::Eof)
    }
}

/// Interactive shell channel that can wait for output patterns.
///
/// Each [`expect`](Self::expect) starts from an empty buffer, reads until a
/// pattern of the set occurs anywhere in the accumulated output, and then
/// keeps two views of what it saw: the raw text and a clean copy with the
/// echoed command and the matched pattern removed.
pub struct PtyChannel<C> {
    channel: Blocking<C>,
    config: PtyConfig,
    output: OutputBuffer,
    clean: String,
    last_match: Option<String>,
    pending_echo: Option<String>,
    read_buf: Vec<u8>,
    is_open: bool,
}

impl<C: ShellChannel> PtyChannel<C> {
    pub fn new(channel: C, config: PtyConfig) -> Result<Self> {
        let output = OutputBuffer::for_label(&config.encoding)?;
        Ok(Self {
            channel: Blocking::new(channel),
            read_buf: vec![0; config.read_chunk_size.max(1)],
            config,
            output,
            clean: String::new(),
            last_match: None,
            pending_echo: None,
            is_open: true,
        })
    }

    /// Write text exactly as given.
    pub async fn send_raw(&mut self, text: &str) -> Result<()> {
        trace!("send_raw {:?}", text);
        self.write_encoded(text).await
    }

    /// Write `text` followed by the newline (or `newline` if given), and
    /// remember `text` so the next expect removes its echo.
    pub async fn sendline(&mut self, text: &str, newline: Option<&str>) -> Result<()> {
        debug!("sendline {:?}", text);
        self.pending_echo = Some(text.to_string());
        self.write_line(text, newline).await
    }

    /// Like [`sendline`](Self::sendline) but never logs or keeps the text.
    ///
    /// Password prompts do not echo, so there is nothing to remove afterwards.
    pub async fn sendline_hidden(&mut self, text: &str) -> Result<()> {
        debug!("sendline <hidden>");
        self.pending_echo = None;
        self.write_line(text, None).await
    }

    async fn write_line(&mut self, text: &str, newline: Option<&str>) -> Result<()> {
        let newline = newline.unwrap_or(&self.config.newline);
        let line = format!("{text}{newline}");
        self.write_encoded(&line).await
    }

    async fn write_encoded(&mut self, text: &str) -> Result<()> {
        let bytes = self.output.encode(text).into_owned();
        self.channel
            .write_all(&bytes)
            .await
            .map_err(ChannelError::Io)?;
        Ok(())
    }

    /// Read until one of `set` matches, the channel ends, or the deadline passes.
    ///
    /// With an empty set only end-of-stream completes the call, and only an
    /// explicit per-call timeout bounds it.
    pub async fn expect(&mut self, set: &MatchSet, options: &ExpectOptions) -> Result<ExpectResult> {
        let compiled = set.compile(&options.prefix).map_err(ChannelError::from)?;
        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let bounded = !timeout.is_zero() && !(set.is_empty() && options.timeout.is_none());
        let deadline = bounded.then(|| Instant::now() + timeout);

        self.output.clear();
        trace!("expect {:?}", set);

        let result = loop {
            if let Some(index) = compiled.first_match(self.output.as_str()) {
                break ExpectResult::Matched(index);
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    self.pending_echo = None;
                    self.clean = self.output.as_str().to_string();
                    debug!("expect timed out after {:?}", timeout);
                    return Err(ChannelError::ExpectTimeout {
                        patterns: set.to_vec(),
                        timeout,
                    }
                    .into());
                }
            }

            let outcome = self
                .channel
                .read_available(&mut self.read_buf, self.config.poll_interval)
                .await
                .map_err(ChannelError::Io)?;
            match outcome {
                ReadOutcome::Data(n) => self.output.extend(&self.read_buf[..n], options.strip_ansi),
                ReadOutcome::Idle => {}
                ReadOutcome::Eof => {
                    debug!("channel reached end of stream");
                    self.is_open = false;
                    break ExpectResult::Eof;
                }
            }
        };

        self.finish(set, result)
    }

    fn finish(&mut self, set: &MatchSet, result: ExpectResult) -> Result<ExpectResult> {
        let mut clean = self.output.as_str().to_string();

        if let Some(echo) = self.pending_echo.take() {
            if !echo.is_empty() {
                clean = clean.replace(&format!("{echo}\n"), "");
            }
        }

        if let ExpectResult::Matched(index) = result {
            if let Some(pattern) = set.get(index) {
                let re = compile_pattern(pattern).map_err(ChannelError::from)?;
                clean = re.replace_all(&clean, "").into_owned();
                self.last_match = Some(pattern.to_string());
            }
        }

        self.clean = clean;
        Ok(result)
    }

    /// Raw text captured by the last expect.
    pub fn current_output(&self) -> &str {
        self.output.as_str()
    }

    /// Captured text minus the echoed command and the matched pattern.
    pub fn current_output_clean(&self) -> &str {
        &self.clean
    }

    /// Pattern that completed the last successful expect.
    pub fn last_match(&self) -> Option<&str> {
        self.last_match.as_deref()
    }

    /// Text of the last `sendline` not yet consumed by an expect.
    pub fn pending_echo(&self) -> Option<&str> {
        self.pending_echo.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    pub fn config(&self) -> &PtyConfig {
        &self.config
    }

    /// Whether end-of-stream has not been observed yet.
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Close the underlying channel.
    pub async fn close(&mut self) -> Result<()> {
        self.is_open = false;
        self.channel.close().await.map_err(ChannelError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::transport::{ChannelPeer, QueuedChannel};

    fn channel_with(timeout: Duration) -> (PtyChannel<QueuedChannel>, ChannelPeer) {
        let (channel, peer) = QueuedChannel::pair(16);
        let config = PtyConfig {
            timeout,
            ..PtyConfig::default()
        };
        (PtyChannel::new(channel, config).unwrap(), peer)
    }

    async fn feed(peer: &ChannelPeer, data: &'static [u8]) {
        peer.tx.send(Bytes::from_static(data)).await.unwrap();
    }

    #[tokio::test]
    async fn test_expect_matches_across_chunks() {
        let (mut pty, peer) = channel_with(Duration::from_secs(5));
        feed(&peer, b"MOTD\r\nComm").await;
        feed(&peer, b"and$ ").await;

        let result = pty
            .expect(&MatchSet::single(r".+?[#$]\s+"), &ExpectOptions::default())
            .await
            .unwrap();
        assert_eq!(result, ExpectResult::Matched(0));
        assert_eq!(pty.current_output(), "MOTD\nCommand$ ");
        assert_eq!(pty.last_match(), Some(r".+?[#$]\s+"));
    }

    #[tokio::test]
    async fn test_lowest_index_wins_when_both_present() {
        let (mut pty, peer) = channel_with(Duration::from_secs(5));
        feed(&peer, b"alpha beta").await;

        let set: MatchSet = vec!["beta", "alpha"].into();
        let result = pty.expect(&set, &ExpectOptions::default()).await.unwrap();
        assert_eq!(result, ExpectResult::Matched(0));
    }

    #[tokio::test]
    async fn test_clean_output_drops_echo_and_prompt() {
        let (mut pty, mut peer) = channel_with(Duration::from_secs(5));
        pty.sendline("whoami", None).await.unwrap();
        assert_eq!(peer.rx.recv().await.unwrap(), Bytes::from_static(b"whoami\r"));

        feed(&peer, b"whoami\r\nlowly_pleb\r\nCommand$ ").await;
        pty.expect(&MatchSet::single(regex::escape("Command$ ")), &ExpectOptions::default())
            .await
            .unwrap();

        assert_eq!(pty.current_output(), "whoami\nlowly_pleb\nCommand$ ");
        assert_eq!(pty.current_output_clean(), "lowly_pleb\n");
        assert!(!pty.current_output_clean().contains("whoami\n"));
        assert_eq!(pty.pending_echo(), None);
    }

    #[tokio::test]
    async fn test_hidden_line_is_not_kept() {
        let (mut pty, mut peer) = channel_with(Duration::from_secs(5));
        pty.sendline("sudo su -", None).await.unwrap();
        assert_eq!(pty.pending_echo(), Some("sudo su -"));

        pty.sendline_hidden("hunter2").await.unwrap();
        assert_eq!(pty.pending_echo(), None);
        assert_eq!(peer.rx.recv().await.unwrap(), Bytes::from_static(b"sudo su -\r"));
        assert_eq!(peer.rx.recv().await.unwrap(), Bytes::from_static(b"hunter2\r"));

        feed(&peer, b"\r\nCommand# ").await;
        pty.expect(&MatchSet::single(regex::escape("Command# ")), &ExpectOptions::default())
            .await
            .unwrap();
        assert!(!pty.current_output_clean().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_empty_set_waits_for_eof() {
        let (mut pty, peer) = channel_with(Duration::from_millis(20));
        feed(&peer, b"logout\r\n").await;
        let tx = peer.tx.clone();
        drop(peer);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(tx);
        });

        let result = pty.expect(&MatchSet::new(), &ExpectOptions::default()).await.unwrap();
        assert_eq!(result, ExpectResult::Eof);
        assert_eq!(pty.current_output(), "logout\n");
        assert!(!pty.is_open());
    }

    #[tokio::test]
    async fn test_timeout_reports_patterns() {
        let (mut pty, _peer) = channel_with(Duration::from_millis(50));
        let started = Instant::now();

        let err = pty
            .expect(&MatchSet::single("nevermatches"), &ExpectOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_expect_timeout());
        assert!(err.to_string().contains("nevermatches"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_per_call_timeout_overrides_default() {
        let (mut pty, _peer) = channel_with(Duration::from_secs(60));
        let options = ExpectOptions::new().timeout(Duration::from_millis(30));
        let err = pty.expect(&MatchSet::single("x"), &options).await.unwrap_err();
        assert!(err.is_expect_timeout());
    }

    #[tokio::test]
    async fn test_prefix_and_raw_mode() {
        let (mut pty, peer) = channel_with(Duration::from_secs(5));
        feed(&peer, b"\x1b[32mok\x1b[0m done").await;

        let options = ExpectOptions::new().prefix("^").strip_ansi(false);
        let result = pty
            .expect(&MatchSet::single(r"\x1b\[32mok"), &options)
            .await
            .unwrap();
        assert_eq!(result, ExpectResult::Matched(0));
        assert_eq!(pty.current_output_clean(), "\x1b[0m done");
    }
}
