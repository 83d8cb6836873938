//! Instantiation waiting list: queued `(factory, name, properties)`
//! entries are instantiated as soon as their factory appears.
//!
//! Instance names are unique across the whole list. A successful
//! instantiation leaves the retry queue but keeps its name claim, so
//! [`WaitingList::remove`] always resolves back to the right factory.

use super::*;
use crate::runtime::{ComponentCore, ComponentEvent, ComponentEventKind, ComponentEventListener};

#[derive(Default)]
struct WaitState {
    /// Factory name -> component name -> properties (the retry queue).
    queue: BTreeMap<String, BTreeMap<String, Properties>>,
    /// Component name -> factory name (the name claims).
    names: BTreeMap<String, String>,
}

pub struct WaitingList {
    context: BundleContext,
    me: Weak<WaitingList>,
    state: Mutex<WaitState>,
    registration: Mutex<Option<ServiceRegistration>>,
}

impl WaitingList {
    /// Starts the waiting list: follows component-core arrivals,
    /// subscribes to factory events and publishes itself as a service.
    pub fn start(context: BundleContext) -> Result<Arc<Self>> {
        let list = Arc::new_cyclic(|me| Self {
            context: context.clone(),
            me: me.clone(),
            state: Mutex::new(WaitState::default()),
            registration: Mutex::new(None),
        });

        context.add_service_listener(
            list.clone() as Arc<dyn ServiceListener>,
            Some(constants::SERVICE_COMPONENT_CORE),
            None,
        )?;

        // Follow the current core's factory events, if one is up already
        let follower = list.clone();
        list.with_core(|core| {
            core.add_listener(follower as Arc<dyn ComponentEventListener>);
        });

        let object: ServiceObject = list.clone();
        let registration =
            context.register_service(&[constants::SERVICE_WAITING_LIST], object, Properties::new())?;
        *list
            .registration
            .lock()
            .trace_expect("Failed to lock waiting registration") = Some(registration);

        Ok(list)
    }

    pub fn stop(&self) {
        if let Some(me) = self.me.upgrade() {
            self.context
                .remove_service_listener(&(me.clone() as Arc<dyn ServiceListener>));
            self.with_core(|core| {
                core.remove_listener(&(me as Arc<dyn ComponentEventListener>));
            });
        }

        let registration = self
            .registration
            .lock()
            .trace_expect("Failed to lock waiting registration")
            .take();
        if let Some(registration) = registration {
            if let Err(e) = registration.unregister() {
                debug!("Waiting list service left early: {e}");
            }
        }

        let mut state = self.state.lock().trace_expect("Failed to lock waiting list");
        state.queue.clear();
        state.names.clear();
    }

    /// Runs `f` against the component core service, when available.
    fn with_core<R>(&self, f: impl FnOnce(&ComponentCore) -> R) -> Option<R> {
        let reference = self
            .context
            .get_service_reference(Some(constants::SERVICE_COMPONENT_CORE), None)
            .ok()??;
        let service = self.context.get_service(&reference).ok()?;
        let result = typed_service::<ComponentCore>(&service).map(f);
        let _ = self.context.unget_service(&reference);
        result
    }

    /// Enqueues an instantiation. The name must be free across the
    /// whole list; when the core is already available the instantiation
    /// is attempted immediately.
    pub fn add(&self, factory: &str, name: &str, properties: Properties) -> Result<()> {
        {
            let mut state = self.state.lock().trace_expect("Failed to lock waiting list");
            if state.names.contains_key(name) {
                return Err(Error::DuplicateName(name.to_string()));
            }
            state.names.insert(name.to_string(), factory.to_string());
            state
                .queue
                .entry(factory.to_string())
                .or_default()
                .insert(name.to_string(), properties);
        }

        self.with_core(|core| self.try_instantiate(core, factory, name));
        Ok(())
    }

    /// Releases a name claim and kills the component if it is running.
    pub fn remove(&self, name: &str) -> Result<()> {
        {
            let mut state = self.state.lock().trace_expect("Failed to lock waiting list");
            let factory = state
                .names
                .remove(name)
                .ok_or_else(|| Error::UnknownInstance(name.to_string()))?;

            if let Some(entries) = state.queue.get_mut(&factory) {
                entries.remove(name);
                if entries.is_empty() {
                    state.queue.remove(&factory);
                }
            }
        }

        self.with_core(|core| {
            if let Err(e) = core.kill(name) {
                debug!("Waiting list: component '{name}' was not running: {e}");
            }
        });
        Ok(())
    }

    /// Names currently claimed by the list, with their factories.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .trace_expect("Failed to lock waiting list")
            .names
            .iter()
            .map(|(name, factory)| (factory.clone(), name.clone()))
            .collect()
    }

    fn try_instantiate(&self, core: &ComponentCore, factory: &str, name: &str) {
        let properties = {
            let state = self.state.lock().trace_expect("Failed to lock waiting list");
            match state.queue.get(factory).and_then(|c| c.get(name)) {
                Some(properties) => properties.clone(),
                None => return,
            }
        };

        match core.instantiate(factory, name, properties) {
            Ok(_) => {
                // Out of the retry queue; the name claim stays
                let mut state = self.state.lock().trace_expect("Failed to lock waiting list");
                if let Some(entries) = state.queue.get_mut(factory) {
                    entries.remove(name);
                    if entries.is_empty() {
                        state.queue.remove(factory);
                    }
                }
            }
            Err(Error::UnknownFactory(_)) => {
                // Not there yet; a factory-registered event retries
            }
            Err(e) => warn!("Error instantiating component '{name}': {e}"),
        }
    }
}

impl ServiceListener for WaitingList {
    fn service_changed(&self, event: &ServiceEvent) {
        if event.kind() != ServiceEventKind::Registered {
            return;
        }
        // A component core arrived: follow its factory events
        if let Some(me) = self.me.upgrade() {
            self.with_core(|core| {
                core.add_listener(me as Arc<dyn ComponentEventListener>);
            });
        }
    }
}

impl ComponentEventListener for WaitingList {
    fn handle_event(&self, event: &ComponentEvent) {
        if event.kind() != ComponentEventKind::Registered {
            return;
        }

        let factory = event.factory_name().to_string();
        let pending: Vec<String> = {
            let state = self.state.lock().trace_expect("Failed to lock waiting list");
            state
                .queue
                .get(&factory)
                .map(|entries| entries.keys().cloned().collect())
                .unwrap_or_default()
        };
        if pending.is_empty() {
            return;
        }

        self.with_core(|core| {
            for name in &pending {
                self.try_instantiate(core, &factory, name);
            }
        });
    }
}

impl std::fmt::Debug for WaitingList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().trace_expect("Failed to lock waiting list");
        f.debug_struct("WaitingList")
            .field("claimed", &state.names.len())
            .finish()
    }
}
