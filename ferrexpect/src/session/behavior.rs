//! Device-specific hooks for the login sequence.

use async_trait::async_trait;
use log::debug;

use super::{CommandOptions, Session};
use crate::error::Result;
use crate::transport::Transport;

/// Hooks a session calls while synchronising with the remote shell.
///
/// Install a custom implementation with [`Session::with_behavior`] when a
/// device needs setup before the first prompt, or prints prompts that the
/// default unique-prompt capture gets wrong.
#[async_trait]
pub trait DeviceBehavior<T: Transport>: Send + Sync {
    /// Runs after the shell opens, before the first prompt is awaited.
    async fn device_init(&self, _session: &mut Session<T>) -> Result<()> {
        Ok(())
    }

    /// Returns an escaped pattern matching exactly the current prompt, or
    /// `None` to keep the current pattern.
    async fn unique_prompt(&self, session: &mut Session<T>) -> Result<Option<String>> {
        default_unique_prompt(session).await
    }
}

/// Behavior used when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBehavior;

#[async_trait]
impl<T: Transport> DeviceBehavior<T> for DefaultBehavior {}

/// Send an empty command and take the raw output, minus its first character
/// (the echoed line break), as the literal prompt.
pub async fn default_unique_prompt<T: Transport>(session: &mut Session<T>) -> Result<Option<String>> {
    let raw = session.command_with("", &CommandOptions::raw()).await?;
    let prompt = prompt_from_capture(&raw);
    debug!("captured prompt {:?}", prompt);
    Ok(prompt.map(regex::escape))
}

fn prompt_from_capture(raw: &str) -> Option<&str> {
    let mut chars = raw.chars();
    chars.next()?;
    let rest = chars.as_str();
    (!rest.is_empty()).then_some(rest)
}
