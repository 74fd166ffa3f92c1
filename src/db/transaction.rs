use crate::error::{DbError, Result};
use crate::pager::wal::TxnId;

/// Lifecycle of a transaction as the log observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Begun, not yet terminated.
    Active,
    /// Terminated by a durable commit marker.
    Committed,
    /// Terminated by a rollback marker.
    RolledBack,
}

/// The single transaction slot of a connection.
///
/// One writer at a time; nesting is rejected. The executor supplies the
/// transaction id, usually from
/// [`Database::next_txn_id`](super::Database::next_txn_id).
#[derive(Debug, Default)]
pub(crate) struct TxnSlot {
    current: Option<TxnId>,
    outcome: Option<TxState>,
}

impl TxnSlot {
    pub(crate) fn begin(&mut self, txn_id: TxnId) -> Result<()> {
        if self.current.is_some() {
            return Err(DbError::InvalidArgument("a transaction is already active"));
        }
        self.current = Some(txn_id);
        self.outcome = Some(TxState::Active);
        Ok(())
    }

    pub(crate) fn current(&self) -> Option<TxnId> {
        self.current
    }

    pub(crate) fn state(&self) -> Option<TxState> {
        self.outcome
    }

    pub(crate) fn require_active(&self) -> Result<TxnId> {
        self.current
            .ok_or(DbError::InvalidArgument("no active transaction"))
    }

    pub(crate) fn finish(&mut self, outcome: TxState) {
        self.current = None;
        self.outcome = Some(outcome);
    }
}
