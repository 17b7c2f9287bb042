//! Interactive shell sessions.
//!
//! A [`Session`] drives one shell channel through login, prompt
//! synchronisation, commands and privilege escalation, and owns the tunnels
//! opened over the same connection.

mod behavior;
mod builder;
pub mod config;
pub mod escalation;
mod state;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use secrecy::{ExposeSecret, SecretString};

pub use behavior::{DefaultBehavior, DeviceBehavior, default_unique_prompt};
pub use builder::SessionBuilder;
pub use config::{DEFAULT_PROMPT, SessionConfig};
pub use escalation::{EscalationConfig, EscalationOutcome};
pub use state::{PromptKind, SessionState};

use escalation::{OutcomeSet, escalation_command};

/// Leaves the shell started by `sudo` / `su`.
const ESCALATION_EXIT: &str = "exit";

use crate::channel::{ExpectOptions, ExpectResult, MatchSet, PtyChannel, compile_pattern};
use crate::error::{ChannelError, Error, Result, SessionError};
use crate::transfer::Transfer;
use crate::transport::Transport;
use crate::tunnel::{TeardownReport, TunnelHandle, TunnelManager};

/// Options for [`Session::command_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOptions {
    /// Return the cleaned output instead of the raw capture.
    pub clean: bool,
    /// Drop one trailing `\n` from the result.
    pub remove_trailing_newline: bool,
    /// Override the expect timeout for this command.
    pub timeout: Option<Duration>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            clean: true,
            remove_trailing_newline: false,
            timeout: None,
        }
    }
}

impl CommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw capture including the echo and the prompt.
    pub fn raw() -> Self {
        Self {
            clean: false,
            ..Self::default()
        }
    }

    pub fn clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    pub fn remove_trailing_newline(mut self, remove: bool) -> Self {
        self.remove_trailing_newline = remove;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// An interactive shell session over a [`Transport`].
///
/// Created disconnected. [`login`](Self::login) connects, opens the shell and
/// synchronises with the prompt; [`exit`](Self::exit) releases everything.
///
/// # Example
///
/// ```rust,no_run
/// use ferrexpect::SessionBuilder;
///
/// # async fn example() -> Result<(), ferrexpect::Error> {
/// let mut session = SessionBuilder::new("192.168.1.1")
///     .username("admin")
///     .password("secret")
///     .build()?;
///
/// session.login().await?;
/// let user = session.command("whoami").await?;
/// println!("logged in as {}", user.trim());
/// session.exit().await?;
/// # Ok(())
/// # }
/// ```
pub struct Session<T: Transport> {
    transport_config: T::Config,
    config: SessionConfig,
    behavior: Arc<dyn DeviceBehavior<T>>,
    transport: Option<Arc<T>>,
    channel: Option<PtyChannel<T::Shell>>,
    basic_prompt: String,
    prompt: String,
    prompt_kind: PromptKind,
    state: SessionState,
    tunnels: TunnelManager,
}

impl<T: Transport> Session<T> {
    pub fn new(transport_config: T::Config, config: SessionConfig) -> Self {
        let tunnels = TunnelManager::new(config.tunnels.clone());
        Self {
            transport_config,
            basic_prompt: config.prompt.clone(),
            prompt: config.prompt.clone(),
            config,
            behavior: Arc::new(DefaultBehavior),
            transport: None,
            channel: None,
            prompt_kind: PromptKind::Basic,
            state: SessionState::Disconnected,
            tunnels,
        }
    }

    /// Replace the device behavior.
    pub fn with_behavior(mut self, behavior: Arc<dyn DeviceBehavior<T>>) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Prompt pattern from configuration.
    pub fn basic_prompt(&self) -> &str {
        &self.basic_prompt
    }

    /// Prompt pattern currently waited for.
    pub fn prompt_pattern(&self) -> &str {
        &self.prompt
    }

    pub fn prompt_kind(&self) -> PromptKind {
        self.prompt_kind
    }

    /// Set the prompt pattern directly.
    pub fn set_prompt_pattern(&mut self, pattern: impl Into<String>, kind: PromptKind) {
        self.prompt = pattern.into();
        self.prompt_kind = kind;
    }

    /// Change the default expect timeout. Zero disables it.
    pub fn set_expect_timeout(&mut self, timeout: Duration) {
        self.config.expect_timeout = timeout;
        if let Some(channel) = self.channel.as_mut() {
            channel.set_timeout(timeout);
        }
    }

    pub fn transport(&self) -> Option<&Arc<T>> {
        self.transport.as_ref()
    }

    /// Connection parameters the transport is (or will be) connected with.
    pub fn transport_config(&self) -> &T::Config {
        &self.transport_config
    }

    /// Raw text captured by the last expect.
    pub fn current_output(&self) -> &str {
        self.channel.as_ref().map_or("", |c| c.current_output())
    }

    /// Text captured by the last expect without the echoed command and the matched pattern.
    pub fn current_output_clean(&self) -> &str {
        self.channel.as_ref().map_or("", |c| c.current_output_clean())
    }

    /// Pattern that completed the last expect.
    pub fn last_match(&self) -> Option<&str> {
        self.channel.as_ref().and_then(|c| c.last_match())
    }

    /// Whether the shell channel is open and has not reached end of stream.
    pub fn is_open(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    fn channel_mut(&mut self) -> Result<&mut PtyChannel<T::Shell>> {
        self.channel
            .as_mut()
            .ok_or_else(|| SessionError::NotConnected.into())
    }

    /// Connect the transport and open a shell, without waiting for a prompt.
    pub async fn connect(&mut self) -> Result<()> {
        match self.state {
            SessionState::Closed => return Err(SessionError::Closed.into()),
            SessionState::Disconnected => {}
            _ => return Ok(()),
        }

        let transport = Arc::new(T::connect(&self.transport_config).await?);
        self.transport = Some(transport.clone());
        self.state = SessionState::Connected;

        let shell = transport.open_shell(&self.config.terminal).await?;
        self.channel = Some(PtyChannel::new(shell, self.config.pty_config())?);
        self.state = SessionState::ShellOpen;
        debug!("shell open with terminal {:?}", self.config.terminal);
        Ok(())
    }

    /// Connect, wait for the first prompt and derive a unique prompt.
    ///
    /// Does nothing once logged in.
    pub async fn login(&mut self) -> Result<()> {
        if self.state.is_logged_in() {
            return Ok(());
        }

        self.connect().await?;

        let behavior = self.behavior.clone();
        behavior.device_init(self).await?;

        if self.prompt().await?.is_eof() {
            return Err(ChannelError::Closed.into());
        }
        self.state = SessionState::PromptSynced(self.prompt_kind);

        if self.config.auto_unique_prompt {
            self.set_unique_prompt(true, false).await?;
        }

        self.state = SessionState::CommandLoop;
        info!("logged in, prompt {:?}", self.prompt);
        Ok(())
    }

    /// Wait for the current prompt.
    pub async fn prompt(&mut self) -> Result<ExpectResult> {
        self.prompt_with(MatchSet::new()).await
    }

    /// Wait for the current prompt or any of `extra`, which take indices from 1.
    pub async fn prompt_with(&mut self, extra: impl Into<MatchSet>) -> Result<ExpectResult> {
        let mut set = MatchSet::single(self.prompt.clone());
        for pattern in extra.into().iter() {
            set.push(pattern);
        }
        self.expect(set, &ExpectOptions::new()).await
    }

    /// Write text exactly as given.
    pub async fn sendline_raw(&mut self, text: &str) -> Result<()> {
        self.channel_mut()?.send_raw(text).await
    }

    /// Write `text` and the configured newline.
    pub async fn sendline(&mut self, text: &str) -> Result<()> {
        self.channel_mut()?.sendline(text, None).await
    }

    /// Write `text` followed by `newline` instead of the configured one.
    pub async fn sendline_with(&mut self, text: &str, newline: &str) -> Result<()> {
        self.channel_mut()?.sendline(text, Some(newline)).await
    }

    /// Wait for one of `patterns`; the lowest matching index wins.
    ///
    /// An empty set waits for the channel to close.
    pub async fn expect(
        &mut self,
        patterns: impl Into<MatchSet>,
        options: &ExpectOptions,
    ) -> Result<ExpectResult> {
        let set = patterns.into();
        self.channel_mut()?.expect(&set, options).await
    }

    /// Run a command and return its cleaned output.
    pub async fn command(&mut self, cmd: &str) -> Result<String> {
        self.command_with(cmd, &CommandOptions::default()).await
    }

    /// Run a command and wait for the prompt.
    ///
    /// If the channel closes instead, whatever was captured is returned.
    pub async fn command_with(&mut self, cmd: &str, options: &CommandOptions) -> Result<String> {
        self.sendline(cmd).await?;

        let mut expect_options = ExpectOptions::new();
        if let Some(timeout) = options.timeout {
            expect_options = expect_options.timeout(timeout);
        }
        let set = MatchSet::single(self.prompt.clone());
        if self.expect(set, &expect_options).await?.is_eof() {
            debug!("channel closed while running {:?}", cmd);
        }

        if matches!(self.state, SessionState::PromptSynced(_)) {
            self.state = SessionState::CommandLoop;
        }

        let mut out = if options.clean {
            self.current_output_clean().to_string()
        } else {
            self.current_output().to_string()
        };
        if options.remove_trailing_newline && out.ends_with('\n') {
            out.pop();
        }
        Ok(out)
    }

    /// Replace the prompt pattern with one that matches only the remote's
    /// literal prompt.
    ///
    /// With `use_basic_prompt` the basic pattern is restored first. With
    /// `set_prompt` the configured `prompt_set_command` runs first.
    pub async fn set_unique_prompt(&mut self, use_basic_prompt: bool, set_prompt: bool) -> Result<()> {
        if use_basic_prompt {
            self.prompt = self.basic_prompt.clone();
            self.prompt_kind = PromptKind::Basic;
        }

        if set_prompt {
            match self.config.prompt_set_command.clone() {
                Some(cmd) => {
                    self.command(&cmd).await?;
                }
                None => warn!("set_prompt requested but no prompt_set_command is configured"),
            }
        }

        let behavior = self.behavior.clone();
        match behavior.unique_prompt(self).await? {
            Some(prompt) => {
                debug!("unique prompt {:?}", prompt);
                self.prompt = prompt;
                self.prompt_kind = PromptKind::Unique;
                if matches!(self.state, SessionState::PromptSynced(_)) {
                    self.state = SessionState::PromptSynced(PromptKind::Unique);
                }
            }
            None => warn!("empty prompt capture, keeping {:?}", self.prompt),
        }
        Ok(())
    }

    /// Escalate privileges with `sudo <su_cmd>` (or `su_cmd` alone when
    /// `use_sudo` is false), answering the password prompt.
    ///
    /// On success the session is [`Escalated`](SessionState::Escalated) and a
    /// new unique prompt is derived. Any other outcome returns
    /// [`SessionError::BadSudoPassword`] after trying to get back to a prompt.
    pub async fn sudo(&mut self, password: &SecretString, use_sudo: bool, su_cmd: &str) -> Result<()> {
        let escalation = self.config.escalation.clone();
        let command = escalation_command(use_sudo, su_cmd);
        self.sendline(&command).await?;

        let first = MatchSet::single(escalation.password_prompt.clone()).with(self.basic_prompt.clone());
        match self.expect(first, &ExpectOptions::new()).await? {
            ExpectResult::Matched(0) => {}
            ExpectResult::Matched(_) => {
                debug!("{:?} did not ask for a password", command);
                return self.escalated().await;
            }
            ExpectResult::Eof => return Err(SessionError::BadSudoPassword.into()),
        }

        self.channel_mut()?.sendline_hidden(password.expose_secret()).await?;

        let outcomes = OutcomeSet::new(&escalation, &self.basic_prompt);
        let result = self
            .expect(outcomes.match_set().clone(), &ExpectOptions::new())
            .await?;

        match outcomes.classify(result) {
            EscalationOutcome::Granted => self.escalated().await,
            outcome => {
                warn!("privilege escalation failed: {:?}", outcome);
                if let Err(e) = self.recover_prompt(outcome, &escalation).await {
                    warn!("could not get back to a prompt: {}", e);
                }
                Err(SessionError::BadSudoPassword.into())
            }
        }
    }

    async fn escalated(&mut self) -> Result<()> {
        self.state = SessionState::Escalated;
        info!("privileges escalated");
        self.set_unique_prompt(true, false).await
    }

    /// Leave the escalated shell and return to the login user's prompt.
    ///
    /// Sends `exit` and derives a new unique prompt. Does nothing unless the
    /// session is [`Escalated`](SessionState::Escalated).
    pub async fn unescalate(&mut self) -> Result<()> {
        if self.state != SessionState::Escalated {
            return Ok(());
        }

        self.sendline(ESCALATION_EXIT).await?;
        let basic = MatchSet::single(self.basic_prompt.clone());
        if self.expect(basic, &ExpectOptions::new()).await?.is_eof() {
            return Err(ChannelError::Closed.into());
        }

        self.state = SessionState::CommandLoop;
        info!("privileges dropped");
        self.set_unique_prompt(true, false).await
    }

    async fn recover_prompt(&mut self, outcome: EscalationOutcome, escalation: &EscalationConfig) -> Result<()> {
        match outcome {
            EscalationOutcome::Reprompted => {
                self.sendline_raw(&escalation.interrupt).await?;
                self.prompt().await?;
            }
            EscalationOutcome::Rejected => {
                let prompt = compile_pattern(&self.prompt).map_err(ChannelError::from)?;
                if prompt.is_match(self.current_output()) {
                    return Ok(());
                }
                let set = MatchSet::single(self.prompt.clone()).with(escalation.password_prompt.clone());
                if self.expect(set, &ExpectOptions::new()).await? == ExpectResult::Matched(1) {
                    self.sendline_raw(&escalation.interrupt).await?;
                    self.prompt().await?;
                }
            }
            EscalationOutcome::Granted | EscalationOutcome::ChannelClosed => {}
        }
        Ok(())
    }

    fn connected_transport(&self) -> Result<Arc<T>> {
        self.transport
            .clone()
            .ok_or_else(|| SessionError::NotConnected.into())
    }

    /// Forward `local_port` on this machine to `remote_host:remote_port` as seen
    /// from the server.
    ///
    /// Binds to the configured tunnel address unless `bind_addr` is given.
    pub async fn forward_local(
        &mut self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        bind_addr: Option<IpAddr>,
    ) -> Result<TunnelHandle> {
        let transport = self.connected_transport()?;
        let ip = bind_addr.unwrap_or(self.tunnels.config().bind_addr);
        self.tunnels
            .forward_local(&transport, SocketAddr::new(ip, local_port), remote_host, remote_port)
            .await
    }

    /// Forward `remote_port` on the server to `local_host:local_port` as seen
    /// from this machine.
    pub async fn forward_remote(
        &mut self,
        remote_port: u16,
        local_host: &str,
        local_port: u16,
        bind_addr: Option<&str>,
    ) -> Result<TunnelHandle> {
        let transport = self.connected_transport()?;
        let bind_addr = bind_addr
            .map(str::to_string)
            .unwrap_or_else(|| self.tunnels.config().remote_bind_addr.clone());
        self.tunnels
            .forward_remote(&transport, &bind_addr, remote_port, local_host, local_port)
            .await
    }

    /// Run a SOCKS proxy on `local_port` of the configured tunnel address.
    pub async fn forward_dynamic(&mut self, local_port: u16) -> Result<TunnelHandle> {
        let ip = self.tunnels.config().bind_addr;
        self.forward_dynamic_on(ip, local_port).await
    }

    /// Run a SOCKS proxy on `bind_addr:local_port`.
    pub async fn forward_dynamic_on(&mut self, bind_addr: IpAddr, local_port: u16) -> Result<TunnelHandle> {
        let transport = self.connected_transport()?;
        self.tunnels
            .forward_dynamic(&transport, SocketAddr::new(bind_addr, local_port))
            .await
    }

    /// Open the remote filesystem (SFTP over [`SshTransport`](crate::SshTransport)).
    ///
    /// Each call starts a new file session on the live connection. Files are
    /// accessed as the user the connection authenticated as.
    pub async fn transfer(&self) -> Result<Transfer<T::Fs>> {
        let transport = self.connected_transport()?;
        let fs = transport.open_fs().await?;
        debug!("remote filesystem open");
        Ok(Transfer::new(fs))
    }

    /// Stop one tunnel.
    pub async fn close_tunnel(&mut self, handle: &TunnelHandle) -> Result<()> {
        self.tunnels.close(handle).await
    }

    /// Stop every tunnel. Failures are logged and reported, never returned as errors.
    pub async fn close_tunnels(&mut self) -> TeardownReport {
        self.tunnels.close_all().await
    }

    /// Handles of the open tunnels, in creation order.
    pub fn tunnels(&self) -> Vec<TunnelHandle> {
        self.tunnels.handles()
    }

    /// Close tunnels, the shell channel and the connection.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned. Calling it again does nothing.
    pub async fn exit(&mut self) -> Result<()> {
        if self.transport.is_none() {
            if self.state != SessionState::Disconnected {
                self.state = SessionState::Closed;
            }
            return Ok(());
        }

        let mut first_error: Option<Error> = None;

        let report = self.tunnels.close_all().await;
        if !report.is_clean() {
            warn!("{} tunnel(s) did not close cleanly", report.failures.len());
        }

        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                warn!("closing shell channel failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.disconnect().await {
                warn!("disconnect failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        self.state = SessionState::Closed;
        info!("session closed");
        first_error.map_or(Ok(()), Err)
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if self.transport.is_some() {
            warn!("session dropped while connected; call exit() to close it cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_options() {
        let options = CommandOptions::default();
        assert!(options.clean);
        assert!(!options.remove_trailing_newline);
        assert_eq!(options.timeout, None);

        let options = CommandOptions::raw()
            .remove_trailing_newline(true)
            .timeout(Duration::from_secs(2));
        assert!(!options.clean);
        assert!(options.remove_trailing_newline);
        assert_eq!(options.timeout, Some(Duration::from_secs(2)));
    }
}
