use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::runtime::Handle;

use crate::{
    ProcflowError, Result, ShareLock, TenantId,
    common::{BroadcastQueue, Shutdown},
    events::{Event, EventAction},
    flownode::FlowNodeState,
    store::{StoreIden, data::ProcessState},
};

macro_rules! dispatch_event {
    ($handles:expr, $(&$item:ident), +) => {
        let handlers = $handles.read().clone();
        for handle in handlers.iter() {
            (handle)($(&$item),+);
        }
    };
}

macro_rules! dispatch_event_async {
    ($handles:expr, $(&$item:ident), +) => {
        let handles = $handles.clone();

        tokio::spawn(async move {
            let handlers = handles.read().clone();
            for handle in handlers.iter() {
                (handle)($(&$item),+).await;
            }
        });
    };
}

/// Capacity of the committed event broadcast.
pub(crate) const EVENT_QUEUE_SIZE: usize = 4096;

pub type EventHandle = Arc<dyn Fn(&Event) + Send + Sync>;
pub type EventHandleAsync = Arc<dyn Fn(&Event) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// use the glob pattern to match the event key
    /// eg. FLOWNODEINSTANCE_*
    pub key: String,

    /// use the glob pattern to match the process instance id
    /// eg. 12*
    pub pid: String,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            key: "*".to_string(),
            pid: "*".to_string(),
        }
    }
}

impl ChannelOptions {
    pub fn new(
        key: String,
        pid: String,
    ) -> Self {
        Self {
            key,
            pid,
        }
    }

    pub fn with_key(key: String) -> Self {
        Self {
            key,
            pid: "*".to_string(),
        }
    }

    pub fn with_pid(pid: u64) -> Self {
        Self {
            key: "*".to_string(),
            pid: pid.to_string(),
        }
    }
}

/// Fan-out of committed events to observers. Events of a rolled-back transaction never
/// reach the channel.
#[derive(Clone)]
pub struct Channel {
    event_queue: Arc<BroadcastQueue<Event>>,

    events: ShareLock<Vec<EventHandle>>,
    events_async: ShareLock<Vec<EventHandleAsync>>,

    handle: Handle,
    shutdown: Arc<Shutdown>,
}

impl Channel {
    pub(crate) fn new(
        event_queue: Arc<BroadcastQueue<Event>>,
        handle: Handle,
    ) -> Self {
        Self {
            event_queue,
            events: Arc::new(RwLock::new(Vec::new())),
            events_async: Arc::new(RwLock::new(Vec::new())),
            handle,
            shutdown: Arc::new(Shutdown::new()),
        }
    }

    pub(crate) fn event_queue(&self) -> Arc<BroadcastQueue<Event>> {
        self.event_queue.clone()
    }

    pub(crate) fn listen(&self) {
        let mut event_queue = self.event_queue.subscribe();
        let events = self.events.clone();
        let events_async = self.events_async.clone();

        let shutdown = self.shutdown.clone();
        self.handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    Ok(e) = event_queue.recv() => {
                        let evt = e.clone();
                        dispatch_event!(events, &evt);
                        dispatch_event_async!(events_async, &e);
                    }
                }
            }
        });
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.shutdown();
    }
}

#[derive(Clone)]
pub struct ChannelEvent {
    channel: Arc<Channel>,

    glob: (globset::GlobMatcher, globset::GlobMatcher),
}

impl ChannelEvent {
    pub fn channel(
        channel: Arc<Channel>,
        options: ChannelOptions,
    ) -> Result<Self> {
        Ok(Self {
            channel,
            glob: (compile(&options.key)?, compile(&options.pid)?),
        })
    }

    /// Called with the tenant and id of every process instance that completes.
    pub fn on_process_completed(
        &self,
        f: impl Fn(TenantId, u64) + Send + Sync + 'static,
    ) {
        let glob = self.glob.clone();

        self.channel.events.write().push(Arc::new(move |e| {
            if e.key.iden == StoreIden::ProcessInstances
                && e.key.action == EventAction::Updated
                && e.state_changed()
                && e.state() == Some(ProcessState::Completed.as_ref())
                && is_match(&glob, e)
            {
                f(e.tenant_id, e.object_id);
            }
        }));
    }

    pub fn on_flow_node_failed(
        &self,
        f: impl Fn(&Event) + Send + Sync + 'static,
    ) {
        let glob = self.glob.clone();

        self.channel.events.write().push(Arc::new(move |e| {
            if e.key.iden == StoreIden::FlowNodeInstances && e.state_changed() && e.state() == Some(FlowNodeState::Failed.as_ref()) && is_match(&glob, e) {
                f(e);
            }
        }));
    }

    pub fn on_event(
        &self,
        f: impl Fn(&Event) + Send + Sync + 'static,
    ) {
        let glob = self.glob.clone();

        self.channel.events.write().push(Arc::new(move |e| {
            if is_match(&glob, e) {
                f(e);
            }
        }));
    }

    pub fn on_event_async<F>(
        &self,
        f: F,
    ) where
        F: Fn(&Event) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let glob = self.glob.clone();

        self.channel.events_async.write().push(Arc::new(move |e| {
            if is_match(&glob, e) {
                f(e)
            } else {
                Box::pin(async {})
            }
        }));
    }
}

fn compile(pattern: &str) -> Result<globset::GlobMatcher> {
    globset::Glob::new(pattern).map(|g| g.compile_matcher()).map_err(|e| ProcflowError::Config(format!("invalid channel pattern '{}': {}", pattern, e)))
}

fn is_match(
    glob: &(globset::GlobMatcher, globset::GlobMatcher),
    e: &Event,
) -> bool {
    let (pat_key, pat_pid) = glob;
    let pid = e.process_instance_id().map(|id| id.to_string()).unwrap_or_default();
    pat_key.is_match(e.key.to_string()) && pat_pid.is_match(pid)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::events::EventTypeKey;

    fn process_event(
        id: u64,
        old: &str,
        new: &str,
    ) -> Event {
        Event {
            key: EventTypeKey::new(StoreIden::ProcessInstances, EventAction::Updated),
            tenant_id: 1,
            object_id: id,
            old: Some(json!({ "state": old })),
            new: Some(json!({ "state": new })),
            timestamp: 0,
        }
    }

    #[test]
    fn test_glob_matching() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let channel = Arc::new(Channel::new(BroadcastQueue::new(16), runtime.handle().clone()));
        let by_key = ChannelEvent::channel(channel.clone(), ChannelOptions::with_key("PROCESSINSTANCE_*".to_string())).unwrap();
        let e = process_event(12, "started", "completed");
        assert!(is_match(&by_key.glob, &e));

        let by_pid = ChannelEvent::channel(channel.clone(), ChannelOptions::with_pid(13)).unwrap();
        assert!(!is_match(&by_pid.glob, &e));
        assert!(ChannelEvent::channel(channel, ChannelOptions::with_key("[".to_string())).is_err());
    }

    #[test]
    fn test_completed_handler_receives_committed_events() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let queue = BroadcastQueue::new(16);
        let channel = Arc::new(Channel::new(queue.clone(), runtime.handle().clone()));
        let completed = Arc::new(Mutex::new(Vec::new()));
        let c = completed.clone();
        ChannelEvent::channel(channel.clone(), ChannelOptions::default()).unwrap().on_process_completed(move |tenant_id, pid| {
            c.lock().push((tenant_id, pid));
        });
        channel.listen();

        queue.send(process_event(1, "initializing", "started"));
        queue.send(process_event(2, "started", "completed"));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while completed.lock().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*completed.lock(), vec![(1, 2)]);
        channel.shutdown();
    }
}
