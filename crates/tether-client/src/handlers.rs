//! One-shot "connected" callbacks.
//!
//! Handlers are keyed by registration id and fire in registration order.
//! Firing drains the registry, so a handler never runs twice.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

pub(crate) type ConnectedHandler = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub(crate) struct ConnectedHandlers {
    next_id: u64,
    handlers: BTreeMap<u64, ConnectedHandler>,
}

impl ConnectedHandlers {
    pub(crate) fn register(&mut self, handler: ConnectedHandler) -> u64 {
        self.next_id += 1;
        self.handlers.insert(self.next_id, handler);
        self.next_id
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        self.handlers.remove(&id).is_some()
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.handlers.contains_key(&id)
    }

    pub(crate) fn drain(&mut self) -> Vec<(u64, ConnectedHandler)> {
        std::mem::take(&mut self.handlers).into_iter().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.handlers.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }
}

/// Runs drained handlers in order. A panicking handler is logged and the
/// rest still run.
pub(crate) fn fire(handlers: Vec<(u64, ConnectedHandler)>) {
    for (id, handler) in handlers {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(handler)) {
            tracing::error!(
                handler_id = id,
                panic = %panic_message(panic.as_ref()),
                "connected handler panicked"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Returned by [`crate::ConnectionManager::once_connected`].
///
/// Dropping it does nothing; the handler stays registered until it fires or
/// [`HandlerRegistration::unsubscribe`] is called.
#[derive(Clone)]
pub struct HandlerRegistration {
    registry: Weak<Mutex<ConnectedHandlers>>,
    id: Option<u64>,
}

impl HandlerRegistration {
    pub(crate) fn new(registry: &Arc<Mutex<ConnectedHandlers>>, id: u64) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            id: Some(id),
        }
    }

    /// Registration for a callback that already ran.
    pub(crate) fn fired() -> Self {
        Self {
            registry: Weak::new(),
            id: None,
        }
    }

    /// Safe at any time, including after the handler fired or the manager
    /// was dropped.
    pub fn unsubscribe(&self) {
        if let (Some(id), Some(registry)) = (self.id, self.registry.upgrade()) {
            registry.lock().remove(id);
        }
    }

    /// Whether the handler is still waiting to fire.
    pub fn is_pending(&self) -> bool {
        match (self.id, self.registry.upgrade()) {
            (Some(id), Some(registry)) => registry.lock().contains(id),
            _ => false,
        }
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    fn recorder(log: &Arc<SyncMutex<Vec<u32>>>, value: u32) -> ConnectedHandler {
        let log = Arc::clone(log);
        Box::new(move || log.lock().push(value))
    }

    #[test]
    fn fires_in_registration_order_and_drains() {
        let log = Arc::new(SyncMutex::new(Vec::new()));
        let mut handlers = ConnectedHandlers::default();
        handlers.register(recorder(&log, 1));
        let second = handlers.register(recorder(&log, 2));
        handlers.register(recorder(&log, 3));
        assert!(handlers.remove(second));

        fire(handlers.drain());
        assert_eq!(*log.lock(), vec![1, 3]);
        assert_eq!(handlers.len(), 0);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let log = Arc::new(SyncMutex::new(Vec::new()));
        let mut handlers = ConnectedHandlers::default();
        handlers.register(Box::new(|| panic!("handler failure")));
        handlers.register(recorder(&log, 7));

        fire(handlers.drain());
        assert_eq!(*log.lock(), vec![7]);
    }

    #[test]
    fn registration_unsubscribe_is_safe_after_fire() {
        let registry = Arc::new(Mutex::new(ConnectedHandlers::default()));
        let id = registry.lock().register(Box::new(|| {}));
        let registration = HandlerRegistration::new(&registry, id);
        assert!(registration.is_pending());

        let drained = registry.lock().drain();
        fire(drained);
        assert!(!registration.is_pending());
        registration.unsubscribe();
        registration.unsubscribe();

        drop(registry);
        registration.unsubscribe();
        assert!(!HandlerRegistration::fired().is_pending());
    }
}
