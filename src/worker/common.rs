//! Per-target notification subscription registry shared by channel implementations.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

type Callback<V> = Arc<dyn Fn(V) + Send + Sync + 'static>;

struct Inner<V> {
    handlers: Mutex<HashMap<String, Vec<(usize, Callback<V>)>>>,
    next_index: Mutex<usize>,
}

/// Registry of notification callbacks keyed by target id. Listeners are invoked in
/// registration order over a snapshot, so a callback removing itself (or adding others) takes
/// effect on the next dispatch.
pub(crate) struct EventHandlers<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for EventHandlers<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + 'static> EventHandlers<V> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: Mutex::new(HashMap::new()),
                next_index: Mutex::new(0),
            }),
        }
    }

    pub(crate) fn add<F>(&self, target_id: String, callback: F) -> SubscriptionHandler
    where
        F: Fn(V) + Send + Sync + 'static,
    {
        let index = {
            let mut next_index = self.inner.next_index.lock();
            let index = *next_index;
            *next_index += 1;
            index
        };

        self.inner
            .handlers
            .lock()
            .entry(target_id.clone())
            .or_default()
            .push((index, Arc::new(callback)));

        let inner_weak = Arc::downgrade(&self.inner);
        SubscriptionHandler::new(Box::new(move || {
            if let Some(inner) = Weak::upgrade(&inner_weak) {
                let mut handlers = inner.handlers.lock();
                if let Some(list) = handlers.get_mut(&target_id) {
                    list.retain(|(entry_index, _)| *entry_index != index);
                    if list.is_empty() {
                        handlers.remove(&target_id);
                    }
                }
            }
        }))
    }

    pub(crate) fn call_callbacks_with_value(&self, target_id: &str, value: V) {
        let callbacks = {
            let handlers = self.inner.handlers.lock();
            match handlers.get(target_id) {
                Some(list) => list
                    .iter()
                    .map(|(_, callback)| Arc::clone(callback))
                    .collect::<Vec<_>>(),
                None => return,
            }
        };

        for callback in callbacks {
            callback(value.clone());
        }
    }

    pub(crate) fn has_target(&self, target_id: &str) -> bool {
        self.inner.handlers.lock().contains_key(target_id)
    }
}

/// Subscription guard: dropping it unsubscribes the callback.
pub(crate) struct SubscriptionHandler {
    remove_callback: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandler {
    fn new(remove_callback: Box<dyn FnOnce() + Send + Sync>) -> Self {
        Self {
            remove_callback: Some(remove_callback),
        }
    }
}

impl Drop for SubscriptionHandler {
    fn drop(&mut self) {
        if let Some(remove_callback) = self.remove_callback.take() {
            remove_callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscription_lifetime_controls_delivery() {
        let event_handlers = EventHandlers::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let handler = event_handlers.add("target".to_string(), {
            let calls = Arc::clone(&calls);
            move |value| {
                assert_eq!(value, 42);
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });

        event_handlers.call_callbacks_with_value("target", 42);
        event_handlers.call_callbacks_with_value("other", 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(event_handlers.has_target("target"));

        drop(handler);
        event_handlers.call_callbacks_with_value("target", 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!event_handlers.has_target("target"));
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let event_handlers = EventHandlers::<()>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let _first = event_handlers.add("t".to_string(), {
            let order = Arc::clone(&order);
            move |_| order.lock().push(1)
        });
        let _second = event_handlers.add("t".to_string(), {
            let order = Arc::clone(&order);
            move |_| order.lock().push(2)
        });

        event_handlers.call_callbacks_with_value("t", ());
        assert_eq!(*order.lock(), vec![1, 2]);
    }
}
