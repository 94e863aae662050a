//! Asynchronous continuation of flow-node execution.
//!
//! Works registered inside a transaction are queued only once it commits, so a worker
//! never observes state that was rolled back.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::{Result, TenantId, Vars, common::Queue, transaction::TransactionService, utils};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkKind {
    /// Runs one transition of a flow node.
    ExecuteFlowNode {
        flow_node_instance_id: u64,
    },
    /// Delivers a trigger (message, signal, timer, child completion) to a waiting flow node.
    TriggerFlowNode {
        flow_node_instance_id: u64,
        payload: Vars,
    },
    CancelProcessInstance {
        process_instance_id: u64,
    },
    /// Correlates pending messages with waiting catchers of the tenant.
    MatchMessages,
}

#[derive(Debug, Clone)]
pub struct Work {
    pub id: String,
    pub tenant_id: TenantId,
    pub kind: WorkKind,
}

pub struct WorkService {
    queue: Arc<Queue<Work>>,
    txs: Arc<TransactionService>,
    queue_size: usize,
    paused: AtomicBool,
}

impl WorkService {
    pub fn new(
        txs: Arc<TransactionService>,
        queue_size: usize,
    ) -> Self {
        Self {
            queue: Queue::new(),
            txs,
            queue_size,
            paused: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> Arc<Queue<Work>> {
        self.queue.clone()
    }

    /// Queues `kind` after the current transaction commits, or right away without one.
    pub fn register(
        &self,
        tenant_id: TenantId,
        kind: WorkKind,
    ) -> Result<()> {
        let work = Work {
            id: utils::longid(),
            tenant_id,
            kind,
        };
        let queue = self.queue.clone();
        let queue_size = self.queue_size;
        let push = move || {
            trace!(work_id = %work.id, tenant_id = work.tenant_id, kind = ?work.kind, "work queued");
            if let Err(e) = queue.send(work) {
                warn!(error = %e, "failed to queue work");
            }
            if queue.len() > queue_size {
                warn!(backlog = queue.len(), "work queue backlog exceeds its configured size");
            }
        };
        if self.txs.is_transaction_active() {
            self.txs.register_after_commit(push)
        } else {
            push();
            Ok(())
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
