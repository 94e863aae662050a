//! Message queues for inter-component communication.
//!
//! `Queue` carries works from committing transactions to the worker threads.
//! `BroadcastQueue` carries committed events to channel subscribers.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{ProcflowError, Result};

/// Unbounded MPMC (multi-producer, multi-consumer) queue.
///
/// Each message is consumed by exactly one receiver. Backed by flume so that
/// producers on plain OS threads and consumers on the async runtime can share it.
#[derive(Clone)]
pub struct Queue<T> {
    receiver: flume::Receiver<T>,
    sender: flume::Sender<T>,
}

impl<T> Queue<T> {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = flume::unbounded();

        Arc::new(Self {
            receiver: rx,
            sender: tx,
        })
    }

    pub fn send(
        &self,
        msg: T,
    ) -> Result<()> {
        self.sender.send(msg).map_err(|e| ProcflowError::Queue(e.to_string()))
    }

    /// Receive a message without waiting.
    pub fn try_next(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub async fn next_async(&self) -> Option<T> {
        self.receiver.recv_async().await.ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}

/// Broadcast queue for one-to-many message distribution.
///
/// Every subscriber receives every message published after it subscribed.
#[derive(Clone)]
pub struct BroadcastQueue<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> BroadcastQueue<T> {
    pub fn new(cap: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(cap);

        Arc::new(Self {
            sender: tx,
        })
    }

    /// Publish a message. Publishing without subscribers is not an error.
    pub fn send(
        &self,
        msg: T,
    ) {
        let _ = self.sender.send(msg);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }
}
