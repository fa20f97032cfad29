// ============================================================================
// Nested Transaction State
// ============================================================================
//
// State transitions:
//
//   Pending ──first query──> Active ──commit──> Committed
//     │                        └──rollback──> RolledBack
//     ├──commit (no-op)──> Committed
//     └──rollback (no-op)──> RolledBack
//
// ============================================================================

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedState {
    /// `begin_transaction` was called; no SAVEPOINT has been issued yet.
    Pending,

    /// The savepoint exists on the real connection.
    Active,

    Committed,

    RolledBack,
}

impl NestedState {
    pub fn is_pending(&self) -> bool {
        matches!(self, NestedState::Pending)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, NestedState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NestedState::Committed | NestedState::RolledBack)
    }
}

impl fmt::Display for NestedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NestedState::Pending => write!(f, "PENDING"),
            NestedState::Active => write!(f, "ACTIVE"),
            NestedState::Committed => write!(f, "COMMITTED"),
            NestedState::RolledBack => write!(f, "ROLLEDBACK"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!NestedState::Pending.is_terminal());
        assert!(!NestedState::Active.is_terminal());
        assert!(NestedState::Committed.is_terminal());
        assert!(NestedState::RolledBack.is_terminal());
        assert_eq!(NestedState::RolledBack.to_string(), "ROLLEDBACK");
    }
}
