//! Thread-bound transactions.
//!
//! A transaction belongs to the thread that began it. Lower layers (the recorder, the
//! in-memory persistence, the scheduler) look up the current thread's transaction and
//! enlist into it instead of opening their own.

mod service;

pub use service::TransactionService;
use strum::AsRefStr;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Active,
    Committing,
    Committed,
    RolledBack,
}

/// Callback registered with the active transaction.
pub trait Synchronization: Send {
    /// Runs inside the transaction right before the commit decision. An error rolls back.
    fn before_completion(&mut self) -> Result<()> {
        Ok(())
    }

    /// Runs after the transaction left the thread.
    fn after_completion(
        &mut self,
        committed: bool,
    );
}

/// Storage that takes part in the two-phase completion of a transaction.
pub trait TransactionResource: Send + Sync {
    fn prepare(
        &self,
        _tx_id: u64,
    ) -> Result<()> {
        Ok(())
    }

    fn commit(
        &self,
        tx_id: u64,
    ) -> Result<()>;

    fn rollback(
        &self,
        tx_id: u64,
    );
}

/// Runs a closure once the transaction committed; does nothing on rollback.
pub(crate) struct AfterCommit<F: FnOnce() + Send> {
    action: Option<F>,
}

impl<F: FnOnce() + Send> AfterCommit<F> {
    pub fn new(action: F) -> Self {
        Self {
            action: Some(action),
        }
    }
}

impl<F: FnOnce() + Send> Synchronization for AfterCommit<F> {
    fn after_completion(
        &mut self,
        committed: bool,
    ) {
        if let Some(action) = self.action.take() {
            if committed {
                action();
            }
        }
    }
}
