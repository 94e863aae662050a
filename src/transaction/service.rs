use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::{AfterCommit, Synchronization, TransactionResource, TransactionState};
use crate::{ProcflowError, Result};

type BeforeCommit = Box<dyn FnOnce() -> Result<()> + Send>;

struct TransactionContext {
    id: u64,
    state: TransactionState,
    rollback_only: bool,
    before_commit: Vec<BeforeCommit>,
    synchronizations: Vec<Box<dyn Synchronization>>,
    resources: Vec<Arc<dyn TransactionResource>>,
}

/// Coordinates the transactions of every thread of the engine.
pub struct TransactionService {
    active: Mutex<HashMap<ThreadId, TransactionContext>>,
    drained: Condvar,
    next_id: AtomicU64,
}

impl Default for TransactionService {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionService {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            drained: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Opens a transaction on the calling thread.
    pub fn begin(&self) -> Result<u64> {
        let me = thread::current().id();
        let mut active = self.active.lock();
        if let Some(ctx) = active.get(&me) {
            return Err(ProcflowError::Transaction(format!("transaction {} is already active on this thread", ctx.id)));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        active.insert(
            me,
            TransactionContext {
                id,
                state: TransactionState::Active,
                rollback_only: false,
                before_commit: Vec::new(),
                synchronizations: Vec::new(),
                resources: Vec::new(),
            },
        );
        debug!(tx_id = id, "transaction started");
        Ok(id)
    }

    /// Commits the calling thread's transaction, or rolls it back when it is marked
    /// rollback-only.
    pub fn complete(&self) -> Result<()> {
        if self.is_rollback_only()? {
            self.rollback()?;
            return Ok(());
        }

        // callables may register further callables
        loop {
            let callables = self.with_current(|ctx| std::mem::take(&mut ctx.before_commit))?;
            if callables.is_empty() {
                break;
            }
            for callable in callables {
                if let Err(e) = callable() {
                    self.rollback()?;
                    return Err(e);
                }
            }
        }

        let mut synchronizations = Vec::new();
        loop {
            let mut registered = self.with_current(|ctx| std::mem::take(&mut ctx.synchronizations))?;
            if registered.is_empty() {
                break;
            }
            for sync in registered.iter_mut() {
                if let Err(e) = sync.before_completion() {
                    synchronizations.append(&mut registered);
                    self.restore_synchronizations(synchronizations)?;
                    self.rollback()?;
                    return Err(e);
                }
            }
            synchronizations.append(&mut registered);
        }

        let (tx_id, rollback_only, resources) = self.with_current(|ctx| {
            ctx.state = TransactionState::Committing;
            (ctx.id, ctx.rollback_only, std::mem::take(&mut ctx.resources))
        })?;
        if rollback_only {
            for resource in resources.iter() {
                resource.rollback(tx_id);
            }
            self.finish(TransactionState::RolledBack, synchronizations);
            return Ok(());
        }

        for resource in resources.iter() {
            if let Err(e) = resource.prepare(tx_id) {
                warn!(tx_id, error = %e, "transaction prepare failed, rolling back");
                for resource in resources.iter() {
                    resource.rollback(tx_id);
                }
                self.finish(TransactionState::RolledBack, synchronizations);
                return Err(e);
            }
        }

        for (index, resource) in resources.iter().enumerate() {
            if let Err(e) = resource.commit(tx_id) {
                for resource in resources.iter().skip(index) {
                    resource.rollback(tx_id);
                }
                self.finish(TransactionState::RolledBack, synchronizations);
                if index == 0 {
                    warn!(tx_id, error = %e, "transaction commit failed, nothing applied");
                    return Err(e);
                }
                warn!(tx_id, error = %e, "transaction commit failed after partial apply");
                return Err(ProcflowError::Commit(e.to_string()));
            }
        }

        self.finish(TransactionState::Committed, synchronizations);
        debug!(tx_id, "transaction committed");
        Ok(())
    }

    /// Rolls back the calling thread's transaction.
    pub fn rollback(&self) -> Result<()> {
        let (tx_id, resources, synchronizations) = self.with_current(|ctx| {
            ctx.before_commit.clear();
            (ctx.id, std::mem::take(&mut ctx.resources), std::mem::take(&mut ctx.synchronizations))
        })?;
        for resource in resources.iter() {
            resource.rollback(tx_id);
        }
        self.finish(TransactionState::RolledBack, synchronizations);
        debug!(tx_id, "transaction rolled back");
        Ok(())
    }

    /// Runs `work` between `begin` and `complete`. An error or a panic rolls back.
    pub fn execute_in_transaction<T>(
        &self,
        work: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        self.begin()?;
        let mut guard = RollbackGuard {
            service: self,
            armed: true,
        };
        let result = work();
        guard.armed = false;
        match result {
            Ok(value) => {
                self.complete()?;
                Ok(value)
            }
            Err(e) => {
                self.rollback()?;
                Err(e)
            }
        }
    }

    pub fn register_synchronization(
        &self,
        sync: Box<dyn Synchronization>,
    ) -> Result<()> {
        self.with_current(|ctx| ctx.synchronizations.push(sync))
    }

    /// Shorthand for a synchronization that only acts on commit.
    pub fn register_after_commit(
        &self,
        action: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.register_synchronization(Box::new(AfterCommit::new(action)))
    }

    pub fn register_before_commit_callable(
        &self,
        callable: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.with_current(|ctx| ctx.before_commit.push(Box::new(callable)))
    }

    /// Enlists a resource once per transaction and returns the transaction id.
    pub fn enlist_resource(
        &self,
        resource: Arc<dyn TransactionResource>,
    ) -> Result<u64> {
        self.with_current(|ctx| {
            if !ctx.resources.iter().any(|r| Arc::ptr_eq(r, &resource)) {
                ctx.resources.push(resource);
            }
            ctx.id
        })
    }

    pub fn set_rollback_only(&self) -> Result<()> {
        self.with_current(|ctx| ctx.rollback_only = true)
    }

    pub fn is_rollback_only(&self) -> Result<bool> {
        self.with_current(|ctx| ctx.rollback_only)
    }

    pub fn is_transaction_active(&self) -> bool {
        self.active.lock().contains_key(&thread::current().id())
    }

    pub fn current_transaction_id(&self) -> Option<u64> {
        self.active.lock().get(&thread::current().id()).map(|ctx| ctx.id)
    }

    pub fn state(&self) -> Option<TransactionState> {
        self.active.lock().get(&thread::current().id()).map(|ctx| ctx.state)
    }

    pub fn number_of_active_transactions(&self) -> usize {
        self.active.lock().len()
    }

    /// Waits until no transaction is active or `timeout` expires. Returns true when drained.
    pub fn wait_for_drain(
        &self,
        timeout: std::time::Duration,
    ) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut active = self.active.lock();
        while !active.is_empty() {
            if self.drained.wait_until(&mut active, deadline).timed_out() {
                return active.is_empty();
            }
        }
        true
    }

    fn with_current<T>(
        &self,
        f: impl FnOnce(&mut TransactionContext) -> T,
    ) -> Result<T> {
        let mut active = self.active.lock();
        match active.get_mut(&thread::current().id()) {
            Some(ctx) => Ok(f(ctx)),
            None => Err(ProcflowError::Transaction("no active transaction on this thread".to_string())),
        }
    }

    fn restore_synchronizations(
        &self,
        synchronizations: Vec<Box<dyn Synchronization>>,
    ) -> Result<()> {
        self.with_current(|ctx| ctx.synchronizations.extend(synchronizations))
    }

    fn finish(
        &self,
        state: TransactionState,
        mut synchronizations: Vec<Box<dyn Synchronization>>,
    ) {
        {
            let mut active = self.active.lock();
            if let Some(mut ctx) = active.remove(&thread::current().id()) {
                ctx.state = state;
                synchronizations.append(&mut ctx.synchronizations);
            }
            if active.is_empty() {
                self.drained.notify_all();
            }
        }
        let committed = state == TransactionState::Committed;
        for sync in synchronizations.iter_mut() {
            sync.after_completion(committed);
        }
    }
}

struct RollbackGuard<'a> {
    service: &'a TransactionService,
    armed: bool,
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.service.is_transaction_active() {
            warn!("unwinding inside a transaction, rolling back");
            let _ = self.service.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{AssertUnwindSafe, catch_unwind},
        sync::atomic::{AtomicBool, AtomicUsize},
    };

    use super::*;

    #[derive(Default)]
    struct CountingResource {
        prepared: AtomicUsize,
        committed: AtomicUsize,
        rolled_back: AtomicUsize,
        fail_commit: AtomicBool,
    }

    impl TransactionResource for CountingResource {
        fn prepare(
            &self,
            _tx_id: u64,
        ) -> Result<()> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn commit(
            &self,
            _tx_id: u64,
        ) -> Result<()> {
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err(ProcflowError::persistence("disk gone"));
            }
            self.committed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn rollback(
            &self,
            _tx_id: u64,
        ) {
            self.rolled_back.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Recording {
        log: Arc<Mutex<Vec<String>>>,
        fail_before: bool,
    }

    impl Synchronization for Recording {
        fn before_completion(&mut self) -> Result<()> {
            self.log.lock().push("before".to_string());
            if self.fail_before {
                return Err(ProcflowError::Handler("refused".to_string()));
            }
            Ok(())
        }

        fn after_completion(
            &mut self,
            committed: bool,
        ) {
            self.log.lock().push(format!("after:{}", committed));
        }
    }

    #[test]
    fn test_nested_begin_fails() {
        let txs = TransactionService::new();
        txs.begin().unwrap();
        assert!(matches!(txs.begin(), Err(ProcflowError::Transaction(_))));
        txs.complete().unwrap();
        assert!(!txs.is_transaction_active());
        assert!(matches!(txs.complete(), Err(ProcflowError::Transaction(_))));
    }

    #[test]
    fn test_completion_order() {
        let txs = Arc::new(TransactionService::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let resource = Arc::new(CountingResource::default());

        txs.execute_in_transaction(|| {
            txs.enlist_resource(resource.clone())?;
            txs.enlist_resource(resource.clone())?;
            txs.register_synchronization(Box::new(Recording {
                log: log.clone(),
                fail_before: false,
            }))?;
            let inner_log = log.clone();
            let txs2 = txs.clone();
            txs.register_before_commit_callable(move || {
                inner_log.lock().push("callable".to_string());
                let late_log = inner_log.clone();
                txs2.register_before_commit_callable(move || {
                    late_log.lock().push("late callable".to_string());
                    Ok(())
                })
            })?;
            assert_eq!(txs.state(), Some(TransactionState::Active));
            Ok(())
        })
        .unwrap();

        assert_eq!(*log.lock(), vec!["callable", "late callable", "before", "after:true"]);
        assert_eq!(resource.prepared.load(Ordering::SeqCst), 1);
        assert_eq!(resource.committed.load(Ordering::SeqCst), 1);
        assert_eq!(txs.number_of_active_transactions(), 0);
    }

    #[test]
    fn test_before_completion_failure_rolls_back() {
        let txs = TransactionService::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let resource = Arc::new(CountingResource::default());

        let err = txs
            .execute_in_transaction(|| {
                txs.enlist_resource(resource.clone())?;
                txs.register_synchronization(Box::new(Recording {
                    log: log.clone(),
                    fail_before: true,
                }))
            })
            .unwrap_err();
        assert!(matches!(err, ProcflowError::Handler(_)));
        assert_eq!(*log.lock(), vec!["before", "after:false"]);
        assert_eq!(resource.committed.load(Ordering::SeqCst), 0);
        assert_eq!(resource.rolled_back.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rollback_only_completes_without_commit() {
        let txs = TransactionService::new();
        let resource = Arc::new(CountingResource::default());
        txs.begin().unwrap();
        txs.enlist_resource(resource.clone()).unwrap();
        txs.set_rollback_only().unwrap();
        assert!(txs.is_rollback_only().unwrap());
        txs.complete().unwrap();
        assert_eq!(resource.committed.load(Ordering::SeqCst), 0);
        assert_eq!(resource.rolled_back.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_commit_failures_are_distinguished() {
        let txs = TransactionService::new();
        let first = Arc::new(CountingResource::default());
        first.fail_commit.store(true, Ordering::SeqCst);
        let err = txs.execute_in_transaction(|| txs.enlist_resource(first.clone()).map(|_| ())).unwrap_err();
        assert_eq!(err.failure_kind(), crate::FailureKind::NothingHappened);

        let ok = Arc::new(CountingResource::default());
        let failing = Arc::new(CountingResource::default());
        failing.fail_commit.store(true, Ordering::SeqCst);
        let err = txs
            .execute_in_transaction(|| {
                txs.enlist_resource(ok.clone())?;
                txs.enlist_resource(failing.clone())?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, ProcflowError::Commit(_)));
        assert_eq!(err.failure_kind(), crate::FailureKind::Unknown);
        assert_eq!(ok.committed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_rolls_back_and_clears_thread() {
        let txs = TransactionService::new();
        let resource = Arc::new(CountingResource::default());
        let result = catch_unwind(AssertUnwindSafe(|| {
            txs.execute_in_transaction(|| -> Result<()> {
                txs.enlist_resource(resource.clone())?;
                panic!("boom");
            })
        }));
        assert!(result.is_err());
        assert!(!txs.is_transaction_active());
        assert_eq!(resource.rolled_back.load(Ordering::SeqCst), 1);
        assert!(txs.wait_for_drain(std::time::Duration::from_millis(10)));
    }

    #[test]
    fn test_transactions_are_per_thread() {
        let txs = Arc::new(TransactionService::new());
        txs.begin().unwrap();
        let other = {
            let txs = txs.clone();
            std::thread::spawn(move || {
                assert!(!txs.is_transaction_active());
                txs.begin().unwrap();
                txs.complete().unwrap();
            })
        };
        other.join().unwrap();
        assert_eq!(txs.number_of_active_transactions(), 1);
        txs.complete().unwrap();
    }
}
