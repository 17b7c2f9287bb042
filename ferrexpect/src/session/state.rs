//! Session lifecycle states.

/// Which prompt pattern the session currently waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// The loose pattern from configuration.
    Basic,
    /// A literal prompt captured from the remote shell.
    Unique,
}

/// Where a [`Session`](super::Session) is in its lifecycle.
///
/// ```text
/// Disconnected -> Connected -> ShellOpen -> PromptSynced(Basic)
///     -> PromptSynced(Unique) -> CommandLoop <-> Escalated -> Closed
/// ```
///
/// `sudo` moves to `Escalated`, `unescalate` moves back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    ShellOpen,
    PromptSynced(PromptKind),
    CommandLoop,
    Escalated,
    Closed,
}

impl SessionState {
    /// Login finished: the shell prompt has been seen at least once.
    pub fn is_logged_in(&self) -> bool {
        matches!(
            self,
            SessionState::PromptSynced(_) | SessionState::CommandLoop | SessionState::Escalated
        )
    }

    /// A transport connection exists.
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Disconnected | SessionState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(!SessionState::Disconnected.is_active());
        assert!(SessionState::ShellOpen.is_active());
        assert!(!SessionState::ShellOpen.is_logged_in());
        assert!(SessionState::PromptSynced(PromptKind::Basic).is_logged_in());
        assert!(SessionState::Escalated.is_logged_in());
        assert!(!SessionState::Closed.is_active());
    }
}
