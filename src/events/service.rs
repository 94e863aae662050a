use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::{trace, warn};

use super::{Event, EventHandler, EventTypeKey};
use crate::Result;

/// Typed registry of event handlers.
#[derive(Default)]
pub struct EventService {
    handlers: RwLock<HashMap<EventTypeKey, Vec<Arc<dyn EventHandler>>>>,
}

impl EventService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` to the handlers of `key`; handlers run in registration order.
    pub fn add_handler(
        &self,
        key: EventTypeKey,
        handler: Arc<dyn EventHandler>,
    ) {
        self.handlers.write().entry(key).or_default().push(handler);
    }

    /// Handlers of `key`; empty when none is registered.
    pub fn handlers(
        &self,
        key: &EventTypeKey,
    ) -> Vec<Arc<dyn EventHandler>> {
        self.handlers.read().get(key).cloned().unwrap_or_default()
    }

    pub fn has_handlers(
        &self,
        key: &EventTypeKey,
    ) -> bool {
        self.handlers.read().get(key).is_some_and(|h| !h.is_empty())
    }

    /// Runs every interested handler. The first failure stops the dispatch.
    pub fn fire(
        &self,
        event: &Event,
    ) -> Result<()> {
        for handler in self.handlers(&event.key) {
            if !handler.is_interested(event) {
                continue;
            }
            if let Err(e) = handler.handle(event) {
                warn!(event = %event.key, object_id = event.object_id, error = %e, "event handler failed");
                return Err(e);
            }
        }
        trace!(event = %event.key, object_id = event.object_id, "event fired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::{ProcflowError, events::EventAction, store::StoreIden};

    fn event(action: EventAction) -> Event {
        Event {
            key: EventTypeKey::new(StoreIden::ProcessInstances, action),
            tenant_id: 1,
            object_id: 5,
            old: Some(json!({ "state": "started" })),
            new: Some(json!({ "state": "completed" })),
            timestamp: 0,
        }
    }

    struct OnlyCompleted(Arc<Mutex<Vec<String>>>);

    impl EventHandler for OnlyCompleted {
        fn handle(
            &self,
            _event: &Event,
        ) -> Result<()> {
            self.0.lock().push("completed".to_string());
            Ok(())
        }

        fn is_interested(
            &self,
            event: &Event,
        ) -> bool {
            event.state() == Some("completed")
        }
    }

    #[test]
    fn test_key_rendering() {
        assert_eq!(EventTypeKey::new(StoreIden::ProcessInstances, EventAction::Updated).to_string(), "PROCESSINSTANCE_UPDATED");
        assert_eq!(EventTypeKey::new(StoreIden::FlowNodeInstances, EventAction::Created).to_string(), "FLOWNODEINSTANCE_CREATED");
    }

    #[test]
    fn test_handlers_run_in_order_and_stop_on_error() {
        let events = EventService::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let key = EventTypeKey::new(StoreIden::ProcessInstances, EventAction::Updated);

        let l = log.clone();
        events.add_handler(
            key,
            Arc::new(move |_: &Event| {
                l.lock().push("first".to_string());
                Ok(())
            }),
        );
        events.add_handler(key, Arc::new(OnlyCompleted(log.clone())));
        events.add_handler(key, Arc::new(|_: &Event| Err(ProcflowError::Handler("refused".into()))));
        let l = log.clone();
        events.add_handler(
            key,
            Arc::new(move |_: &Event| {
                l.lock().push("never".to_string());
                Ok(())
            }),
        );

        let err = events.fire(&event(EventAction::Updated)).unwrap_err();
        assert!(matches!(err, ProcflowError::Handler(_)));
        assert_eq!(*log.lock(), vec!["first", "completed"]);
    }

    #[test]
    fn test_no_handler_is_not_an_error() {
        let events = EventService::new();
        let e = event(EventAction::Deleted);
        assert!(!events.has_handlers(&e.key));
        events.fire(&e).unwrap();
        assert_eq!(e.process_instance_id(), Some(5));
        assert!(!e.state_changed());
    }
}
