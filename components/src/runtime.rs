use super::*;
use crate::handlers::{Handler, HandlerFactory};
use std::sync::atomic::{AtomicBool, Ordering};

/// Kind of a component lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentEventKind {
    /// A factory has been registered.
    Registered,
    /// A factory has been unregistered.
    Unregistered,
    Instantiated,
    Validated,
    Invalidated,
    Bound,
    Unbound,
    Killed,
}

#[derive(Clone)]
pub struct ComponentEvent {
    kind: ComponentEventKind,
    factory: String,
    instance: Option<String>,
}

impl ComponentEvent {
    pub fn kind(&self) -> ComponentEventKind {
        self.kind
    }

    pub fn factory_name(&self) -> &str {
        &self.factory
    }

    pub fn instance_name(&self) -> Option<&str> {
        self.instance.as_deref()
    }
}

impl std::fmt::Debug for ComponentEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentEvent")
            .field("kind", &self.kind)
            .field("factory", &self.factory)
            .field("instance", &self.instance)
            .finish()
    }
}

pub trait ComponentEventListener: Send + Sync {
    fn handle_event(&self, event: &ComponentEvent);
}

fn listener_addr(listener: &Arc<dyn ComponentEventListener>) -> *const () {
    Arc::as_ptr(listener) as *const ()
}

/// The component runtime: holds the factories, instantiates and kills
/// component instances, and publishes itself as a service so that other
/// parties (the waiting list, shells) can drive it.
pub struct ComponentCore {
    context: BundleContext,
    me: Weak<ComponentCore>,
    running: AtomicBool,
    factories: RwLock<BTreeMap<String, Arc<ComponentFactory>>>,
    instances: Mutex<BTreeMap<String, Arc<StoredInstance>>>,
    listeners: Mutex<Vec<Arc<dyn ComponentEventListener>>>,
    registration: Mutex<Option<ServiceRegistration>>,
}

impl ComponentCore {
    /// Starts the runtime on the given context and registers it under
    /// [`constants::SERVICE_COMPONENT_CORE`].
    pub fn start(context: BundleContext) -> Result<Arc<Self>> {
        let core = Arc::new_cyclic(|me| Self {
            context: context.clone(),
            me: me.clone(),
            running: AtomicBool::new(true),
            factories: RwLock::new(BTreeMap::new()),
            instances: Mutex::new(BTreeMap::new()),
            listeners: Mutex::new(Vec::new()),
            registration: Mutex::new(None),
        });

        let object: ServiceObject = core.clone();
        let registration = context.register_service(
            &[constants::SERVICE_COMPONENT_CORE],
            object,
            Properties::new(),
        )?;
        *core
            .registration
            .lock()
            .trace_expect("Failed to lock core registration") = Some(registration);

        info!("Component core started");
        Ok(core)
    }

    /// Stops the runtime: kills every instance and withdraws the core
    /// service.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let names: Vec<String> = self
            .instances
            .lock()
            .trace_expect("Failed to lock instances")
            .keys()
            .cloned()
            .collect();
        for name in names {
            if let Err(e) = self.kill(&name) {
                debug!("Error killing component '{name}': {e}");
            }
        }

        let registration = self
            .registration
            .lock()
            .trace_expect("Failed to lock core registration")
            .take();
        if let Some(registration) = registration {
            if let Err(e) = registration.unregister() {
                debug!("Core service left early: {e}");
            }
        }

        info!("Component core stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn context(&self) -> &BundleContext {
        &self.context
    }

    /// Registers a component factory and announces it.
    pub fn register_factory(&self, factory: ComponentFactory) -> Result<()> {
        let name = factory.name().to_string();
        {
            let mut factories = self
                .factories
                .write()
                .trace_expect("Failed to lock factories");
            if factories.contains_key(&name) {
                return Err(Error::DuplicateFactory(name));
            }
            factories.insert(name.clone(), Arc::new(factory));
        }

        debug!("Registered component factory '{name}'");
        self.fire_event(ComponentEventKind::Registered, &name, None);
        Ok(())
    }

    /// Unregisters a factory, killing its live instances.
    pub fn unregister_factory(&self, name: &str) -> Result<()> {
        if self
            .factories
            .write()
            .trace_expect("Failed to lock factories")
            .remove(name)
            .is_none()
        {
            return Err(Error::UnknownFactory(name.to_string()));
        }

        let doomed: Vec<String> = self
            .instances
            .lock()
            .trace_expect("Failed to lock instances")
            .values()
            .filter(|i| i.factory_name() == name)
            .map(|i| i.name().to_string())
            .collect();
        for instance in doomed {
            if let Err(e) = self.kill(&instance) {
                debug!("Error killing component '{instance}': {e}");
            }
        }

        self.fire_event(ComponentEventKind::Unregistered, name, None);
        Ok(())
    }

    pub fn factories(&self) -> Vec<String> {
        self.factories
            .read()
            .trace_expect("Failed to lock factories")
            .keys()
            .cloned()
            .collect()
    }

    pub fn get_instance(&self, name: &str) -> Option<Arc<StoredInstance>> {
        self.instances
            .lock()
            .trace_expect("Failed to lock instances")
            .get(name)
            .cloned()
    }

    pub fn instances(&self) -> Vec<Arc<StoredInstance>> {
        self.instances
            .lock()
            .trace_expect("Failed to lock instances")
            .values()
            .cloned()
            .collect()
    }

    /// Instantiates a component from a factory.
    ///
    /// The instance is created, its handlers resolved through the
    /// service registry and started, and its lifecycle checked once. A
    /// handler configuration failure leaves the instance stored in the
    /// erroneous state.
    pub fn instantiate(
        &self,
        factory_name: &str,
        name: &str,
        properties: Properties,
    ) -> Result<Arc<StoredInstance>> {
        if !self.is_running() {
            return Err(Error::InvalidState("the component core is stopped".to_string()));
        }

        let factory = self
            .factories
            .read()
            .trace_expect("Failed to lock factories")
            .get(factory_name)
            .cloned()
            .ok_or_else(|| Error::UnknownFactory(factory_name.to_string()))?;

        let context = Arc::new(ComponentContext::new(
            factory.context().clone(),
            name.to_string(),
            properties,
            self.context.clone(),
        ));
        let instance = StoredInstance::new(self.me.clone(), context.clone(), factory.construct());

        {
            let mut instances = self
                .instances
                .lock()
                .trace_expect("Failed to lock instances");
            if instances.contains_key(name) {
                return Err(Error::DuplicateName(name.to_string()));
            }
            instances.insert(name.to_string(), instance.clone());
        }

        info!("Instantiating component '{name}' from factory '{factory_name}'");

        match self.create_handlers(&context) {
            Err(e) => {
                warn!("Component '{name}' cannot be realized: {e}");
                instance.mark_erroneous(e.to_string());
                self.fire_event(ComponentEventKind::Instantiated, factory_name, Some(name));
            }
            Ok(handlers) => {
                for handler in &handlers {
                    handler.manipulate(&instance);
                }
                instance.store_handlers(handlers);
                instance.start();

                metrics::counter!("gantry_components_instantiated").increment(1);
                self.fire_event(ComponentEventKind::Instantiated, factory_name, Some(name));

                instance.update_bindings();
                instance.check_lifecycle();
            }
        }

        Ok(instance)
    }

    /// Resolves the handler factories named by the component's
    /// configuration and collects their handlers.
    fn create_handlers(&self, context: &Arc<ComponentContext>) -> Result<Vec<Arc<dyn Handler>>> {
        let handler_ids: Vec<String> = context
            .factory_context()
            .handler_ids()
            .map(str::to_string)
            .collect();

        let mut all = Vec::new();
        for handler_id in handler_ids {
            let filter = format!("({}={})", constants::PROP_HANDLER_ID, handler_id);
            let reference = self
                .context
                .get_service_reference(Some(constants::SERVICE_HANDLER_FACTORY), Some(&filter))?
                .ok_or_else(|| {
                    Error::HandlerConfiguration(format!("no handler factory for '{handler_id}'"))
                })?;

            let service = self.context.get_service(&reference)?;
            let result = match typed_service::<Arc<dyn HandlerFactory>>(&service) {
                None => Err(Error::HandlerConfiguration(format!(
                    "handler factory '{handler_id}' has the wrong type"
                ))),
                Some(handler_factory) => handler_factory.get_handlers(context),
            };
            drop(service);
            let _ = self.context.unget_service(&reference);

            all.extend(result?);
        }
        Ok(all)
    }

    /// Kills a component instance and forgets it.
    pub fn kill(&self, name: &str) -> Result<()> {
        let instance = self
            .instances
            .lock()
            .trace_expect("Failed to lock instances")
            .remove(name)
            .ok_or_else(|| Error::UnknownInstance(name.to_string()))?;

        instance.kill();
        Ok(())
    }

    /// Retries the validation of an erroneous component.
    pub fn retry_erroneous(
        &self,
        name: &str,
        properties: Option<&Properties>,
    ) -> Result<ComponentState> {
        let instance = self
            .get_instance(name)
            .ok_or_else(|| Error::UnknownInstance(name.to_string()))?;
        Ok(instance.retry_erroneous(properties))
    }

    pub fn add_listener(&self, listener: Arc<dyn ComponentEventListener>) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .trace_expect("Failed to lock listeners");
        if listeners
            .iter()
            .any(|l| listener_addr(l) == listener_addr(&listener))
        {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ComponentEventListener>) -> bool {
        let mut listeners = self
            .listeners
            .lock()
            .trace_expect("Failed to lock listeners");
        let before = listeners.len();
        listeners.retain(|l| listener_addr(l) != listener_addr(listener));
        listeners.len() != before
    }

    pub(crate) fn fire_event(
        &self,
        kind: ComponentEventKind,
        factory: &str,
        instance: Option<&str>,
    ) {
        let snapshot: Vec<Arc<dyn ComponentEventListener>> = self
            .listeners
            .lock()
            .trace_expect("Failed to lock listeners")
            .clone();

        let event = ComponentEvent {
            kind,
            factory: factory.to_string(),
            instance: instance.map(str::to_string),
        };
        for listener in snapshot {
            listener.handle_event(&event);
        }
    }
}

impl std::fmt::Debug for ComponentCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentCore")
            .field("running", &self.is_running())
            .finish()
    }
}
