//! # Ferrexpect
//!
//! Async expect-style automation of interactive shell sessions over SSH.
//!
//! Ferrexpect drives a remote shell the way a person at a terminal would:
//! it waits for the prompt, sends commands, waits for recognizable output,
//! and hands back the output with the echoed command and the prompt removed.
//!
//! ## Features
//!
//! - Async SSH connections via russh, with password, key or ssh-agent authentication
//! - Ordered pattern sets where the first listed match wins
//! - Unique prompt capture so command output never ends early
//! - Interactive `sudo` / `su` escalation and a way back
//! - Local, remote and dynamic (SOCKS) port forwarding over the same connection
//! - SFTP file transfer on the live connection
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ferrexpect::SessionBuilder;
//! use secrecy::SecretString;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ferrexpect::Error> {
//!     let mut session = SessionBuilder::new("192.168.1.1")
//!         .username("admin")
//!         .password("secret")
//!         .build()?;
//!
//!     session.login().await?;
//!     println!("{}", session.command("uname -a").await?);
//!
//!     session.sudo(&SecretString::from("secret"), true, "su -").await?;
//!     println!("{}", session.command("whoami").await?);
//!
//!     session.exit().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod error;
pub mod session;
pub mod transfer;
pub mod transport;
pub mod tunnel;

// Re-export main types for convenience
pub use channel::{ExpectOptions, ExpectResult, MatchSet};
pub use error::Error;
pub use session::{
    CommandOptions, DefaultBehavior, DeviceBehavior, PromptKind, Session, SessionBuilder,
    SessionConfig, SessionState,
};
pub use transfer::Transfer;
pub use transport::{AuthMethod, HostKeyVerification, SshConfig, SshTransport, Transport};
pub use tunnel::{TeardownReport, TunnelHandle, TunnelKey};
