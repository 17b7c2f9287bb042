//! Builder for sessions over [`SshTransport`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use super::{DeviceBehavior, Session, SessionConfig};
use crate::channel::{compile_pattern, lookup_encoding};
use crate::error::{Result, SessionError};
use crate::transport::config::{
    AuthMethod, DEFAULT_KEEPALIVE_INTERVAL, HostKeyVerification, SshConfig,
};
use crate::transport::SshTransport;

/// Builder for SSH shell sessions.
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
///     .expect_timeout(std::time::Duration::from_secs(10))
///     .build()?;
/// session.login().await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    host: String,
    port: u16,
    username: Option<String>,
    auth: AuthMethod,
    timeout: Duration,
    keepalive_interval: Option<Duration>,
    terminal_width: u32,
    terminal_height: u32,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    config: SessionConfig,
    behavior: Option<Arc<dyn DeviceBehavior<SshTransport>>>,
}

impl SessionBuilder {
    /// Create a new session builder for the specified host.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: None,
            auth: AuthMethod::None,
            timeout: Duration::from_secs(30),
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            terminal_width: 511,
            terminal_height: 24,
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
            config: SessionConfig::default(),
            behavior: None,
        }
    }

    /// Set the SSH port (default: 22).
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the username for authentication.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set password authentication.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.auth = AuthMethod::Password(SecretString::from(password.into()));
        self
    }

    /// Set private key authentication.
    pub fn private_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.auth = AuthMethod::PrivateKey {
            path: key_path.into(),
            passphrase: None,
        };
        self
    }

    /// Set private key authentication with passphrase.
    pub fn private_key_with_passphrase(
        mut self,
        key_path: impl Into<PathBuf>,
        passphrase: impl Into<String>,
    ) -> Self {
        self.auth = AuthMethod::PrivateKey {
            path: key_path.into(),
            passphrase: Some(SecretString::from(passphrase.into())),
        };
        self
    }

    /// Authenticate with the identities held by the running ssh-agent.
    pub fn agent(mut self) -> Self {
        self.auth = AuthMethod::Agent;
        self
    }

    /// Set the connection timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Interval between SSH keepalives; `None` turns them off.
    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set terminal dimensions.
    pub fn terminal_size(mut self, width: u32, height: u32) -> Self {
        self.terminal_width = width;
        self.terminal_height = height;
        self
    }

    pub fn host_key_verification(mut self, verification: HostKeyVerification) -> Self {
        self.host_key_verification = verification;
        self
    }

    /// Use a known_hosts file other than `~/.ssh/known_hosts`.
    pub fn known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    /// Replace the whole session configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Basic prompt pattern.
    pub fn prompt(mut self, pattern: impl Into<String>) -> Self {
        self.config.prompt = pattern.into();
        self
    }

    /// Encoding label, e.g. `"utf-8"` or `"latin1"`.
    pub fn encoding(mut self, label: impl Into<String>) -> Self {
        self.config.encoding = label.into();
        self
    }

    pub fn newline(mut self, newline: impl Into<String>) -> Self {
        self.config.newline = newline.into();
        self
    }

    /// Terminal type requested for the PTY (default: `vt100`).
    pub fn terminal(mut self, terminal: impl Into<String>) -> Self {
        self.config.terminal = terminal.into();
        self
    }

    pub fn expect_timeout(mut self, timeout: Duration) -> Self {
        self.config.expect_timeout = timeout;
        self
    }

    pub fn auto_unique_prompt(mut self, enabled: bool) -> Self {
        self.config.auto_unique_prompt = enabled;
        self
    }

    pub fn prompt_set_command(mut self, command: impl Into<String>) -> Self {
        self.config.prompt_set_command = Some(command.into());
        self
    }

    /// Device hooks for login and prompt capture.
    pub fn behavior(mut self, behavior: Arc<dyn DeviceBehavior<SshTransport>>) -> Self {
        self.behavior = Some(behavior);
        self
    }

    /// Build the session.
    ///
    /// This validates the configuration but does not connect. Call
    /// `login()` on the returned session to establish the connection.
    pub fn build(self) -> Result<Session<SshTransport>> {
        let username = self.username.ok_or_else(|| SessionError::InvalidConfig {
            message: "Username is required".to_string(),
        })?;
        validate(&self.config)?;

        let ssh_config = SshConfig {
            host: self.host,
            port: self.port,
            username,
            auth: self.auth,
            timeout: self.timeout,
            keepalive_interval: self.keepalive_interval,
            terminal_width: self.terminal_width,
            terminal_height: self.terminal_height,
            host_key_verification: self.host_key_verification,
            known_hosts_path: self.known_hosts_path,
        };

        let session = Session::new(ssh_config, self.config);
        Ok(match self.behavior {
            Some(behavior) => session.with_behavior(behavior),
            None => session,
        })
    }
}

fn validate(config: &SessionConfig) -> Result<()> {
    lookup_encoding(&config.encoding).map_err(|e| SessionError::InvalidConfig {
        message: e.to_string(),
    })?;
    compile_pattern(&config.prompt).map_err(|e| SessionError::InvalidConfig {
        message: format!("Invalid prompt pattern: {e}"),
    })?;
    Ok(())
}
