//! Session metadata: lifecycle states, identifier derivation, and the
//! spawn-failure records kept for diagnostics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Lifecycle state of a session. Transitions are monotonic:
/// `Starting -> Running -> Terminating -> Gone`, never backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Starting,
    Running,
    Terminating,
    Gone,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::Starting => 0,
            SessionState::Running => 1,
            SessionState::Terminating => 2,
            SessionState::Gone => 3,
        }
    }

    /// Whether moving to `next` respects the monotonic ordering.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        next.rank() > self.rank()
    }

    /// A session still accepting writes and resizes.
    pub fn is_running(self) -> bool {
        matches!(self, SessionState::Running)
    }

    /// A session that exists from the client's point of view.
    pub fn is_live(self) -> bool {
        !matches!(self, SessionState::Gone)
    }
}

/// Derives the deterministic session id for a reusable (terminal-bound)
/// session. Two concurrent attach calls for the same terminal compute the
/// same id; the per-terminal generation counter keeps ids from being reused
/// once a prior session with this terminal has died.
pub fn derive_session_id(worktree_path: &str, terminal_id: &str, generation: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(worktree_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(terminal_id.as_bytes());
    hasher.update(generation.to_le_bytes());
    let digest = hasher.finalize();
    format!("s-{}", &hex::encode(digest)[..16])
}

/// A fresh, unique session id for `force_new` (or terminal-less) sessions.
pub fn random_session_id() -> String {
    format!("s-{}", uuid::Uuid::new_v4().simple())
}

/// A recorded PTY/shell spawn failure, ring-buffered for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnError {
    pub timestamp: DateTime<Utc>,
    pub worktree_path: String,
    /// The failure message with the underlying OS string preserved verbatim.
    pub message: String,
    /// errno name (`EMFILE`, `EAGAIN`, ...) when the OS reported one.
    pub os_code: Option<String>,
}

/// Point-in-time description of one live session, as reported by
/// [`crate::core::ShellSupervisor::stats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub worktree_path: String,
    pub terminal_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub subscribers: usize,
    pub shell_pid: u32,
    pub cols: u16,
    pub rows: u16,
}

/// Registry snapshot returned by `stats()`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStats {
    pub active_count: usize,
    pub sessions: Vec<SessionInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_order_is_monotonic() {
        use SessionState::*;
        assert!(Starting.can_advance_to(Running));
        assert!(Running.can_advance_to(Terminating));
        assert!(Terminating.can_advance_to(Gone));
        assert!(Starting.can_advance_to(Gone));
        assert!(!Gone.can_advance_to(Running));
        assert!(!Terminating.can_advance_to(Running));
        assert!(!Running.can_advance_to(Running));
    }

    #[test]
    fn derived_ids_are_stable_per_generation() {
        let a = derive_session_id("/w/a", "term-1", 0);
        let b = derive_session_id("/w/a", "term-1", 0);
        assert_eq!(a, b);
        assert!(a.starts_with("s-"));
        assert_eq!(a.len(), 18);
    }

    #[test]
    fn generation_bump_changes_the_id() {
        let a = derive_session_id("/w/a", "term-1", 0);
        let b = derive_session_id("/w/a", "term-1", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn distinct_inputs_distinct_ids() {
        let a = derive_session_id("/w/a", "term-1", 0);
        let b = derive_session_id("/w/b", "term-1", 0);
        let c = derive_session_id("/w/a", "term-2", 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn random_ids_do_not_collide() {
        let a = random_session_id();
        let b = random_session_id();
        assert_ne!(a, b);
    }
}
