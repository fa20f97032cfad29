// ============================================================================
// Savepoint Allocation
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of the savepoint backing one nested transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SavepointId(pub u64);

impl SavepointId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Savepoint name as used in SQL.
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SavepointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sp_{}", self.0)
    }
}

/// Monotonic id generator, one per session.
///
/// Ids start at 1 and are never reused, so any number of concurrently open
/// nested transactions get distinct savepoint names.
#[derive(Debug)]
pub struct SavepointAllocator {
    next: AtomicU64,
}

impl Default for SavepointAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SavepointAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> SavepointId {
        SavepointId(self.next.fetch_add(1, Ordering::SeqCst))
    }

    /// Number of ids handed out so far.
    pub fn allocated(&self) -> u64 {
        self.next.load(Ordering::SeqCst) - 1
    }
}

/// The three savepoint statements used to emulate nested transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavepointCommand {
    Create,
    Release,
    RollbackTo,
}

impl SavepointCommand {
    pub fn sql(&self, id: SavepointId) -> String {
        match self {
            SavepointCommand::Create => format!("SAVEPOINT {}", id),
            SavepointCommand::Release => format!("RELEASE SAVEPOINT {}", id),
            SavepointCommand::RollbackTo => format!("ROLLBACK TO SAVEPOINT {}", id),
        }
    }
}
