//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::escalation::EscalationConfig;
use crate::channel::PtyConfig;
use crate::tunnel::TunnelConfig;

/// Prompt assumed right after login: anything up to a `#` or `$` followed by whitespace.
pub const DEFAULT_PROMPT: &str = r".+?[#$]\s+";

/// Settings for a [`Session`](super::Session).
///
/// Every field has a default, so partial configs deserialize cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Basic prompt pattern used until a unique prompt is derived.
    pub prompt: String,

    /// Encoding label for shell I/O.
    pub encoding: String,

    /// Line terminator appended by `sendline`.
    pub newline: String,

    /// Terminal type requested for the PTY.
    pub terminal: String,

    /// Default expect timeout; zero disables it.
    pub expect_timeout: Duration,

    /// How often expect re-checks patterns while no data arrives.
    pub poll_interval: Duration,

    /// Bytes requested per channel read.
    pub read_chunk_size: usize,

    /// Derive a unique prompt right after login.
    pub auto_unique_prompt: bool,

    /// Command that sets a known prompt, run by `set_unique_prompt(_, true)`.
    pub prompt_set_command: Option<String>,

    /// Privilege escalation patterns.
    pub escalation: EscalationConfig,

    /// Port forwarding settings.
    pub tunnels: TunnelConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            encoding: "utf-8".to_string(),
            newline: "\r".to_string(),
            terminal: "vt100".to_string(),
            expect_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            read_chunk_size: 8192,
            auto_unique_prompt: true,
            prompt_set_command: None,
            escalation: EscalationConfig::default(),
            tunnels: TunnelConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Channel settings derived from this config.
    pub fn pty_config(&self) -> PtyConfig {
        PtyConfig {
            encoding: self.encoding.clone(),
            newline: self.newline.clone(),
            timeout: self.expect_timeout,
            poll_interval: self.poll_interval,
            read_chunk_size: self.read_chunk_size,
        }
    }
}
