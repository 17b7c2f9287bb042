//! Interactive privilege escalation (`sudo` / `su`).
//!
//! After the password is sent the session waits for an outcome set laid out
//! as `[password prompt, failure patterns..., basic prompt]`. Failures sort
//! before the prompt so that a failure message followed by a fresh prompt
//! still counts as a failure; success is the prompt's index only.

use serde::{Deserialize, Serialize};

use crate::channel::{ExpectResult, MatchSet};

/// Patterns recognised while escalating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Password request from sudo or su.
    pub password_prompt: String,

    /// Messages meaning the password was rejected.
    pub failure_patterns: Vec<String>,

    /// Sent to abandon a repeated password request.
    pub interrupt: String,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            password_prompt: r".+?asswor.+?:\s+".to_string(),
            failure_patterns: vec![
                r"Sorry.+?\.".to_string(),
                r".+?Authentication failure".to_string(),
            ],
            interrupt: "\x03".to_string(),
        }
    }
}

/// Command line that starts the escalation.
pub fn escalation_command(use_sudo: bool, su_cmd: &str) -> String {
    if use_sudo {
        format!("sudo {su_cmd}")
    } else {
        su_cmd.to_string()
    }
}

/// What the remote side answered to the password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// A prompt came back with no failure message before it.
    Granted,
    /// The password was asked for again.
    Reprompted,
    /// A failure message was printed.
    Rejected,
    /// The channel closed.
    ChannelClosed,
}

/// The ordered set awaited after sending the password.
#[derive(Debug, Clone)]
pub struct OutcomeSet {
    set: MatchSet,
    success_index: usize,
}

impl OutcomeSet {
    pub fn new(config: &EscalationConfig, prompt: &str) -> Self {
        let mut set = MatchSet::single(config.password_prompt.clone());
        for failure in &config.failure_patterns {
            set.push(failure.clone());
        }
        let success_index = set.push(prompt);
        Self { set, success_index }
    }

    pub fn match_set(&self) -> &MatchSet {
        &self.set
    }

    /// Index of the pattern that means success.
    pub fn success_index(&self) -> usize {
        self.success_index
    }

    pub fn classify(&self, result: ExpectResult) -> EscalationOutcome {
        match result {
            ExpectResult::Matched(index) if index == self.success_index => {
                EscalationOutcome::Granted
            }
            ExpectResult::Matched(0) => EscalationOutcome::Reprompted,
            ExpectResult::Matched(_) => EscalationOutcome::Rejected,
            ExpectResult::Eof => EscalationOutcome::ChannelClosed,
        }
    }
}
