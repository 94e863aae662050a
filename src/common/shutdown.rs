use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

/// One-shot termination signal shared between a component and its background tasks.
#[derive(Debug, Default)]
pub struct Shutdown {
    terminated: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Resolves once `shutdown` has been called, including calls made before `wait`.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let terminated = self.terminated.clone();
        let notify = self.notify.clone();
        async move {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if terminated.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}
