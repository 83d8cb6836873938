use super::*;
use crate::events::{
    BundleEvent, BundleListener, FrameworkStopListener, ServiceEvent, ServiceEventKind,
    ServiceListener,
};
use crate::hooks::{EventListenerHook, ListenerInfo, ShrinkableListeners};
use gantry_filter::Filter;

fn listener_addr<T: ?Sized>(listener: &Arc<T>) -> *const () {
    Arc::as_ptr(listener) as *const ()
}

struct BundleEntry {
    bundle_id: u64,
    listener: Arc<dyn BundleListener>,
}

struct FrameworkEntry {
    bundle_id: u64,
    listener: Arc<dyn FrameworkStopListener>,
}

/// Routes bundle, service and framework-stop events to their listeners.
///
/// Each listener set has its own mutex; the matching listeners are
/// snapshotted under the lock and invoked outside it, in snapshot order.
pub(crate) struct EventDispatcher {
    registry: RwLock<Weak<registry::ServiceRegistry>>,
    bundle_listeners: Mutex<Vec<BundleEntry>>,
    service_listeners: Mutex<HashMap<Option<String>, Vec<ListenerInfo>>>,
    framework_listeners: Mutex<Vec<FrameworkEntry>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Weak::new()),
            bundle_listeners: Mutex::new(Vec::new()),
            service_listeners: Mutex::new(HashMap::new()),
            framework_listeners: Mutex::new(Vec::new()),
        }
    }

    /// Wires the registry in after construction; hooks are looked up
    /// through it.
    pub fn set_registry(&self, registry: Weak<registry::ServiceRegistry>) {
        *self
            .registry
            .write()
            .trace_expect("Failed to lock registry handle") = registry;
    }

    pub fn clear(&self) {
        self.bundle_listeners
            .lock()
            .trace_expect("Failed to lock bundle listeners")
            .clear();
        self.service_listeners
            .lock()
            .trace_expect("Failed to lock service listeners")
            .clear();
        self.framework_listeners
            .lock()
            .trace_expect("Failed to lock framework listeners")
            .clear();
    }

    /// Drops every listener registered through the given bundle.
    pub fn remove_bundle(&self, bundle_id: u64) {
        self.bundle_listeners
            .lock()
            .trace_expect("Failed to lock bundle listeners")
            .retain(|e| e.bundle_id != bundle_id);

        let mut listeners = self
            .service_listeners
            .lock()
            .trace_expect("Failed to lock service listeners");
        for bucket in listeners.values_mut() {
            bucket.retain(|e| e.bundle_id != bundle_id);
        }
        listeners.retain(|_, bucket| !bucket.is_empty());

        self.framework_listeners
            .lock()
            .trace_expect("Failed to lock framework listeners")
            .retain(|e| e.bundle_id != bundle_id);
    }

    pub fn add_bundle_listener(&self, bundle_id: u64, listener: Arc<dyn BundleListener>) -> bool {
        let mut listeners = self
            .bundle_listeners
            .lock()
            .trace_expect("Failed to lock bundle listeners");
        if listeners
            .iter()
            .any(|e| listener_addr(&e.listener) == listener_addr(&listener))
        {
            warn!("Already known bundle listener");
            return false;
        }
        listeners.push(BundleEntry {
            bundle_id,
            listener,
        });
        true
    }

    pub fn remove_bundle_listener(&self, listener: &Arc<dyn BundleListener>) -> bool {
        let mut listeners = self
            .bundle_listeners
            .lock()
            .trace_expect("Failed to lock bundle listeners");
        let before = listeners.len();
        listeners.retain(|e| listener_addr(&e.listener) != listener_addr(listener));
        listeners.len() != before
    }

    pub fn add_framework_listener(
        &self,
        bundle_id: u64,
        listener: Arc<dyn FrameworkStopListener>,
    ) -> bool {
        let mut listeners = self
            .framework_listeners
            .lock()
            .trace_expect("Failed to lock framework listeners");
        if listeners
            .iter()
            .any(|e| listener_addr(&e.listener) == listener_addr(&listener))
        {
            warn!("Already known framework stop listener");
            return false;
        }
        listeners.push(FrameworkEntry {
            bundle_id,
            listener,
        });
        true
    }

    pub fn remove_framework_listener(&self, listener: &Arc<dyn FrameworkStopListener>) -> bool {
        let mut listeners = self
            .framework_listeners
            .lock()
            .trace_expect("Failed to lock framework listeners");
        let before = listeners.len();
        listeners.retain(|e| listener_addr(&e.listener) != listener_addr(listener));
        listeners.len() != before
    }

    pub fn add_service_listener(
        &self,
        bundle_id: u64,
        listener: Arc<dyn ServiceListener>,
        specification: Option<String>,
        filter: Option<Filter>,
    ) -> bool {
        let mut listeners = self
            .service_listeners
            .lock()
            .trace_expect("Failed to lock service listeners");

        if listeners
            .values()
            .flatten()
            .any(|e| listener_addr(&e.listener) == listener_addr(&listener))
        {
            warn!("Already known service listener");
            return false;
        }

        listeners
            .entry(specification.clone())
            .or_default()
            .push(ListenerInfo {
                bundle_id,
                listener,
                specification,
                filter,
            });
        true
    }

    pub fn remove_service_listener(&self, listener: &Arc<dyn ServiceListener>) -> bool {
        let mut listeners = self
            .service_listeners
            .lock()
            .trace_expect("Failed to lock service listeners");

        let mut removed = false;
        for bucket in listeners.values_mut() {
            let before = bucket.len();
            bucket.retain(|e| listener_addr(&e.listener) != listener_addr(listener));
            removed |= bucket.len() != before;
        }
        listeners.retain(|_, bucket| !bucket.is_empty());
        removed
    }

    pub fn fire_bundle_event(&self, event: &BundleEvent) {
        let snapshot: Vec<Arc<dyn BundleListener>> = self
            .bundle_listeners
            .lock()
            .trace_expect("Failed to lock bundle listeners")
            .iter()
            .map(|e| e.listener.clone())
            .collect();

        for listener in snapshot {
            listener.bundle_changed(event);
        }
    }

    pub fn fire_framework_stopping(&self) {
        let snapshot: Vec<Arc<dyn FrameworkStopListener>> = self
            .framework_listeners
            .lock()
            .trace_expect("Failed to lock framework listeners")
            .iter()
            .map(|e| e.listener.clone())
            .collect();

        for listener in snapshot {
            listener.framework_stopping();
        }
    }

    /// Delivers a service event.
    ///
    /// Listeners are collected per specification (plus the any-spec
    /// bucket), filtered by the hooks, then each listener's own filter is
    /// evaluated: a MODIFIED event whose current properties stopped
    /// matching but whose previous ones did becomes MODIFIED_ENDMATCH for
    /// that listener; one that never matched is dropped.
    pub fn fire_service_event(&self, event: &ServiceEvent) {
        let properties = event.reference().properties();
        let specifications = event.reference().specifications();

        let snapshot: Vec<ListenerInfo> = {
            let listeners = self
                .service_listeners
                .lock()
                .trace_expect("Failed to lock service listeners");

            let mut seen: Vec<*const ()> = Vec::new();
            let mut snapshot = Vec::new();

            let buckets = specifications
                .iter()
                .map(|s| Some(s.clone()))
                .chain(std::iter::once(None));
            for bucket in buckets {
                if let Some(entries) = listeners.get(&bucket) {
                    for entry in entries {
                        let addr = listener_addr(&entry.listener);
                        if !seen.contains(&addr) {
                            seen.push(addr);
                            snapshot.push(entry.clone());
                        }
                    }
                }
            }
            snapshot
        };

        let snapshot = self.filter_with_hooks(event, snapshot);

        let endmatch = event.as_endmatch();
        for info in snapshot {
            let send = match &info.filter {
                None => Some(event),
                Some(filter) if filter.matches(&properties) => Some(event),
                Some(filter) => {
                    let previous_matched = event.kind() == ServiceEventKind::Modified
                        && event
                            .previous_properties()
                            .is_some_and(|previous| filter.matches(previous));
                    if previous_matched {
                        // The service just left this listener's view
                        Some(&endmatch)
                    } else {
                        None
                    }
                }
            };

            if let Some(event) = send {
                info.listener.service_changed(event);
            }
        }
    }

    /// Lets the registered event listener hooks shrink the candidate
    /// set. A hook whose own service is the event's subject is skipped.
    fn filter_with_hooks(
        &self,
        event: &ServiceEvent,
        snapshot: Vec<ListenerInfo>,
    ) -> Vec<ListenerInfo> {
        let Some(registry) = self
            .registry
            .read()
            .trace_expect("Failed to lock registry handle")
            .upgrade()
        else {
            return snapshot;
        };

        let hooks = registry.hook_services();
        if hooks.is_empty() {
            return snapshot;
        }

        let mut shrinkable = ShrinkableListeners::new(snapshot);
        for (hook_ref, service) in hooks {
            if &hook_ref == event.reference() {
                continue;
            }
            match typed_service::<Arc<dyn EventListenerHook>>(&service) {
                Some(hook) => hook.event(event, &mut shrinkable),
                None => warn!(
                    "Listener hook #{} is not an EventListenerHook service",
                    hook_ref.service_id()
                ),
            }
        }
        shrinkable.into_entries()
    }
}
