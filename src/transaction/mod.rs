// ============================================================================
// Transaction Virtualization Module
// ============================================================================
//
// One real transaction per test (Session), any number of application-level
// transactions on top of it (NestedTransaction), each backed by a savepoint
// with a session-unique name.
//
// ============================================================================

pub mod isolation;
pub mod nested;
pub mod savepoint;
pub mod session;
pub mod state;

pub use isolation::IsolationLevel;
pub use nested::NestedTransaction;
pub use savepoint::{SavepointAllocator, SavepointCommand, SavepointId};
pub use session::{Session, SessionManager};
pub use state::NestedState;
