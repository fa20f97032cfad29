// ============================================================================
// Nested transactions emulated with savepoints
// ============================================================================
//
// `begin` only allocates a savepoint id. The SAVEPOINT statement is sent
// right before the first real query (lazy start), so an empty transaction
// costs no round trip. COMMIT becomes RELEASE SAVEPOINT, ROLLBACK becomes
// ROLLBACK TO SAVEPOINT; the session's real transaction stays open either way.
//
// ============================================================================

use std::sync::Arc;
use tracing::debug;

use super::savepoint::{SavepointCommand, SavepointId};
use super::session::Session;
use super::state::NestedState;
use crate::core::{DbError, Result};
use crate::result::QueryResult;
use crate::sql::{Query, StatementKind};

#[derive(Debug)]
pub struct NestedTransaction {
    session: Arc<Session>,
    savepoint: SavepointId,
    state: NestedState,
}

impl NestedTransaction {
    /// Allocate a savepoint without touching the database.
    pub fn begin(session: Arc<Session>) -> Self {
        let savepoint = session.allocate_savepoint();
        debug!(session = %session.id(), %savepoint, "nested transaction begun");
        Self {
            session,
            savepoint,
            state: NestedState::Pending,
        }
    }

    pub fn savepoint(&self) -> SavepointId {
        self.savepoint
    }

    pub fn state(&self) -> NestedState {
        self.state
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The SAVEPOINT statement still waiting to be sent, while pending.
    pub fn deferred_statement(&self) -> Option<String> {
        self.state
            .is_pending()
            .then(|| SavepointCommand::Create.sql(self.savepoint))
    }

    /// Run a statement inside this transaction.
    ///
    /// COMMIT and bare ROLLBACK end the transaction instead of reaching the
    /// real connection. BEGIN is rejected while the transaction is open.
    pub async fn query(&mut self, query: Query) -> Result<QueryResult> {
        if self.state.is_terminal() {
            return Err(DbError::NoActiveTransaction);
        }

        match query.kind() {
            StatementKind::Commit => {
                self.commit().await?;
                Ok(QueryResult::empty())
            }
            StatementKind::Rollback => {
                self.rollback().await?;
                Ok(QueryResult::empty())
            }
            StatementKind::Begin => Err(DbError::TransactionAlreadyActive(self.savepoint)),
            StatementKind::IsolationLevel => {
                debug!(savepoint = %self.savepoint, "isolation level statement acknowledged");
                Ok(QueryResult::empty())
            }
            StatementKind::RollbackToSavepoint | StatementKind::Other => {
                self.ensure_started().await?;
                self.session.execute(query).await
            }
        }
    }

    /// Send the deferred SAVEPOINT. Stays pending if it fails.
    async fn ensure_started(&mut self) -> Result<()> {
        if self.state.is_pending() {
            self.send(SavepointCommand::Create).await?;
            self.state = NestedState::Active;
        }
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<()> {
        match self.state {
            NestedState::Pending => {
                debug!(savepoint = %self.savepoint, "empty nested transaction committed");
            }
            NestedState::Active => {
                self.send(SavepointCommand::Release).await?;
                debug!(savepoint = %self.savepoint, "nested transaction committed");
            }
            NestedState::Committed | NestedState::RolledBack => {
                return Err(DbError::NoActiveTransaction);
            }
        }
        self.state = NestedState::Committed;
        Ok(())
    }

    /// Undo this transaction's work; the outer transaction stays open.
    pub async fn rollback(&mut self) -> Result<()> {
        match self.state {
            NestedState::Pending => {
                debug!(savepoint = %self.savepoint, "empty nested transaction rolled back");
            }
            NestedState::Active => {
                self.send(SavepointCommand::RollbackTo).await?;
                debug!(savepoint = %self.savepoint, "nested transaction rolled back");
            }
            NestedState::Committed | NestedState::RolledBack => {
                return Err(DbError::NoActiveTransaction);
            }
        }
        self.state = NestedState::RolledBack;
        Ok(())
    }

    async fn send(&self, command: SavepointCommand) -> Result<QueryResult> {
        self.session
            .execute(Query::virtualized(command.sql(self.savepoint)))
            .await
    }
}
