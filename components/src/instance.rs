use super::*;
use crate::handlers::Handler;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a component instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    /// Initial state, and the state after an invalidation.
    Invalid,
    /// Inside the user validation callback.
    Validating,
    Valid,
    /// The validation callback failed; see the error trace.
    Erroneous,
    /// Terminal. Every further callback is a no-op.
    Killed,
}

impl ComponentState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ComponentState::Validating,
            2 => ComponentState::Valid,
            3 => ComponentState::Erroneous,
            4 => ComponentState::Killed,
            _ => ComponentState::Invalid,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ComponentState::Invalid => 0,
            ComponentState::Validating => 1,
            ComponentState::Valid => 2,
            ComponentState::Erroneous => 3,
            ComponentState::Killed => 4,
        }
    }
}

struct InnerState {
    component: Box<dyn Component>,
    controllers: BTreeMap<String, bool>,
    error_trace: Option<String>,
}

/// One managed component instance: its user object, its handlers and its
/// lifecycle state machine.
///
/// The state is mirrored in an atomic so event-path checks
/// ([`Self::check_event`]) never contend with a lifecycle walk in
/// progress. Handler hooks that can reach back into the service registry
/// run after the internal mutex has been released.
pub struct StoredInstance {
    name: String,
    factory_name: String,
    context: Arc<ComponentContext>,
    bundle_context: BundleContext,
    core: Weak<runtime::ComponentCore>,
    state: AtomicU8,
    inner: Mutex<InnerState>,
    handlers: RwLock<Vec<Arc<dyn Handler>>>,
}

impl StoredInstance {
    pub(crate) fn new(
        core: Weak<runtime::ComponentCore>,
        context: Arc<ComponentContext>,
        component: Box<dyn Component>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: context.name().to_string(),
            factory_name: context.factory_name().to_string(),
            bundle_context: context.bundle_context().clone(),
            context,
            core,
            state: AtomicU8::new(ComponentState::Invalid.as_u8()),
            inner: Mutex::new(InnerState {
                component,
                controllers: BTreeMap::new(),
                error_trace: None,
            }),
            handlers: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factory_name(&self) -> &str {
        &self.factory_name
    }

    pub fn context(&self) -> &Arc<ComponentContext> {
        &self.context
    }

    pub fn bundle_context(&self) -> &BundleContext {
        &self.bundle_context
    }

    pub fn state(&self) -> ComponentState {
        ComponentState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ComponentState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// The stored validation error, when the state is erroneous.
    pub fn error_trace(&self) -> Option<String> {
        self.inner
            .lock()
            .trace_expect("Failed to lock instance")
            .error_trace
            .clone()
    }

    pub(crate) fn store_handlers(&self, handlers: Vec<Arc<dyn Handler>>) {
        *self
            .handlers
            .write()
            .trace_expect("Failed to lock handlers") = handlers;
    }

    pub(crate) fn handlers(&self) -> Vec<Arc<dyn Handler>> {
        self.handlers
            .read()
            .trace_expect("Failed to lock handlers")
            .clone()
    }

    pub(crate) fn with_component<R>(&self, f: impl FnOnce(&mut dyn Component) -> R) -> R {
        let mut inner = self.inner.lock().trace_expect("Failed to lock instance");
        f(inner.component.as_mut())
    }

    fn fire(&self, kind: runtime::ComponentEventKind) {
        if let Some(core) = self.core.upgrade() {
            core.fire_event(kind, &self.factory_name, Some(&self.name));
        }
    }

    /// Starts the handlers (listener subscriptions).
    pub(crate) fn start(&self) {
        for handler in self.handlers() {
            handler.start();
        }
    }

    /// Whether a service event should be handled for this instance.
    pub(crate) fn check_event(&self, event: &ServiceEvent) -> bool {
        if self.state() == ComponentState::Killed {
            return false;
        }
        self.handlers().iter().all(|h| h.check_event(event))
    }

    /// Assigns a field without firing callbacks (initial defaults).
    pub(crate) fn assign_binding(&self, field: &str, value: Injection) {
        self.with_component(|c| c.set_binding(field, value));
    }

    /// A dependency was bound: assign, fire the bind callbacks, then
    /// re-check the lifecycle.
    pub(crate) fn bind(
        &self,
        field: &str,
        value: Injection,
        service: &ServiceObject,
        reference: &ServiceReference,
    ) {
        if self.state() == ComponentState::Killed {
            return;
        }

        {
            let mut inner = self.inner.lock().trace_expect("Failed to lock instance");
            inner.component.set_binding(field, value);
            inner.component.on_bind(service, reference);
            inner.component.on_bind_field(field, service, reference);
        }

        self.fire(runtime::ComponentEventKind::Bound);
        self.check_lifecycle();
    }

    /// The properties of a bound dependency changed; `value` carries the
    /// handler's new injection when it changed too.
    pub(crate) fn update(
        &self,
        field: &str,
        value: Option<Injection>,
        service: &ServiceObject,
        reference: &ServiceReference,
        old_properties: &Properties,
    ) {
        if self.state() == ComponentState::Killed {
            return;
        }

        {
            let mut inner = self.inner.lock().trace_expect("Failed to lock instance");
            if let Some(value) = value {
                inner.component.set_binding(field, value);
            }
            inner
                .component
                .on_update_field(field, service, reference, old_properties);
            inner.component.on_update(service, reference, old_properties);
        }

        self.check_lifecycle();
    }

    /// A dependency was lost. The lifecycle is re-evaluated *before* the
    /// unbind callbacks, so an invalidation still sees the old service;
    /// the field is reassigned afterwards and the service released.
    pub(crate) fn unbind(
        &self,
        field: &str,
        value: Injection,
        service: &ServiceObject,
        reference: &ServiceReference,
    ) {
        if self.state() == ComponentState::Killed {
            return;
        }

        // Invalidate first, if the lost dependency requires it
        self.check_lifecycle();

        {
            let mut inner = self.inner.lock().trace_expect("Failed to lock instance");
            inner.component.on_unbind_field(field, service, reference);
            inner.component.on_unbind(service, reference);
            inner.component.set_binding(field, value);
        }

        self.release_service(service, reference);
        self.fire(runtime::ComponentEventKind::Unbound);

        // Try a new configuration
        if self.update_bindings() {
            self.check_lifecycle();
        }
    }

    fn release_service(&self, service: &ServiceObject, reference: &ServiceReference) {
        let result = if reference.is_prototype() {
            self.bundle_context
                .unget_service_instance(reference, service)
        } else {
            self.bundle_context.unget_service(reference)
        };
        if let Err(e) = result {
            debug!("{}: error releasing service: {e}", self.name);
        }
    }

    /// Asks every dependency handler to look for bindings, and reports
    /// whether they are all satisfied.
    pub(crate) fn update_bindings(&self) -> bool {
        let mut all_valid = true;
        for handler in self.handlers() {
            if let Some(dependency) = handler.as_dependency() {
                dependency.try_binding();
                all_valid &= handler.is_valid();
            }
        }
        all_valid
    }

    /// Walks the state machine: invalidates a valid component whose
    /// handlers turned invalid, validates an invalid one whose handlers
    /// are all satisfied.
    pub fn check_lifecycle(&self) {
        let state = self.state();
        let handlers_valid = self.handlers().iter().all(|h| h.is_valid());
        let core_running = self.core.upgrade().is_some_and(|c| c.is_running());

        if state == ComponentState::Valid && !handlers_valid {
            self.invalidate(true);
        } else if state == ComponentState::Invalid && handlers_valid && core_running {
            self.validate(true);
        }
    }

    /// Validates the component, calling its validation callback.
    pub(crate) fn validate(&self, safe_callback: bool) -> bool {
        match self.state() {
            ComponentState::Valid | ComponentState::Validating | ComponentState::Erroneous => {
                return false;
            }
            ComponentState::Killed => {
                warn!("{}: cannot validate a killed component", self.name);
                return false;
            }
            _ => {}
        }

        self.inner
            .lock()
            .trace_expect("Failed to lock instance")
            .error_trace = None;

        for handler in self.handlers() {
            handler.pre_validate();
        }

        if safe_callback {
            self.set_state(ComponentState::Validating);

            let result = {
                let mut inner = self.inner.lock().trace_expect("Failed to lock instance");
                let InnerState { component, .. } = &mut *inner;
                component.validate(&self.context)
            };

            match result {
                Ok(()) => {}
                Err(CallbackError::FrameworkStop {
                    message,
                    stop_framework,
                }) => {
                    warn!("{}: framework stop requested: {message}", self.name);
                    self.inner
                        .lock()
                        .trace_expect("Failed to lock instance")
                        .error_trace = Some(message);
                    self.kill_through_core();
                    if stop_framework {
                        if let Ok(framework) = self.bundle_context.framework() {
                            framework.stop();
                        }
                    }
                    return false;
                }
                Err(CallbackError::Failed(message)) => {
                    warn!("{}: validation failed: {message}", self.name);
                    self.inner
                        .lock()
                        .trace_expect("Failed to lock instance")
                        .error_trace = Some(message);

                    // Run the teardown path, then mark erroneous
                    self.set_state(ComponentState::Valid);
                    self.invalidate(true);
                    self.set_state(ComponentState::Erroneous);
                    return false;
                }
            }
        }

        self.set_state(ComponentState::Valid);
        metrics::counter!("gantry_components_validated").increment(1);

        for handler in self.handlers() {
            handler.post_validate();
        }

        self.fire(runtime::ComponentEventKind::Validated);
        true
    }

    /// Invalidates the component, calling its invalidation callback when
    /// `callback` is set.
    pub(crate) fn invalidate(&self, callback: bool) -> bool {
        if self.state() != ComponentState::Valid {
            return false;
        }

        self.set_state(ComponentState::Invalid);

        for handler in self.handlers() {
            handler.pre_invalidate();
        }

        if callback {
            let result = {
                let mut inner = self.inner.lock().trace_expect("Failed to lock instance");
                let InnerState { component, .. } = &mut *inner;
                component.invalidate(&self.context)
            };

            match result {
                Ok(()) => {}
                Err(CallbackError::FrameworkStop {
                    message,
                    stop_framework,
                }) => {
                    warn!("{}: framework stop requested: {message}", self.name);
                    self.kill_through_core();
                    if stop_framework {
                        if let Ok(framework) = self.bundle_context.framework() {
                            framework.stop();
                        }
                    }
                    return true;
                }
                Err(CallbackError::Failed(message)) => {
                    warn!("{}: error in invalidation callback: {message}", self.name);
                }
            }

            self.fire(runtime::ComponentEventKind::Invalidated);
        }

        for handler in self.handlers() {
            handler.post_invalidate();
        }
        true
    }

    fn kill_through_core(&self) {
        if let Some(core) = self.core.upgrade() {
            if let Err(e) = core.kill(&self.name) {
                debug!("{}: error killing component: {e}", self.name);
            }
        }
    }

    /// Kills the instance: invalidation, handler teardown, terminal
    /// state. The instance must already have left the core's table.
    pub(crate) fn kill(&self) -> bool {
        if self.state() == ComponentState::Killed {
            return false;
        }

        self.invalidate(true);

        // Stop the handlers; dependency handlers hand back their live
        // bindings for a last unbind round
        for handler in self.handlers() {
            let removed = handler.stop();
            if let Some(dependency) = handler.as_dependency() {
                let field = dependency.field().to_string();
                for (service, reference) in removed {
                    {
                        let mut inner =
                            self.inner.lock().trace_expect("Failed to lock instance");
                        inner.component.on_unbind_field(&field, &service, &reference);
                        inner.component.on_unbind(&service, &reference);
                        inner.component.set_binding(&field, Injection::Cleared);
                    }
                    self.release_service(&service, &reference);
                }
            }
        }

        for handler in self.handlers() {
            handler.clear();
        }
        self.store_handlers(Vec::new());

        self.set_state(ComponentState::Killed);
        self.fire(runtime::ComponentEventKind::Killed);
        true
    }

    /// Moves straight to erroneous with the given trace (handler
    /// configuration failures).
    pub(crate) fn mark_erroneous(&self, trace: String) {
        self.inner
            .lock()
            .trace_expect("Failed to lock instance")
            .error_trace = Some(trace);
        self.set_state(ComponentState::Erroneous);
    }

    /// Leaves the erroneous state: merges the property update, clears
    /// the trace, goes back to invalid and re-checks the lifecycle.
    pub fn retry_erroneous(&self, properties: Option<&Properties>) -> ComponentState {
        if self.state() != ComponentState::Erroneous {
            return self.state();
        }

        if let Some(update) = properties {
            self.context.merge_properties(update);
        }
        self.inner
            .lock()
            .trace_expect("Failed to lock instance")
            .error_trace = None;

        self.set_state(ComponentState::Invalid);
        self.check_lifecycle();
        self.state()
    }

    /// Seeds a controller value without notifying the handlers.
    pub(crate) fn init_controller(&self, name: &str, value: bool) {
        self.inner
            .lock()
            .trace_expect("Failed to lock instance")
            .controllers
            .insert(name.to_string(), value);
    }

    pub fn get_controller_state(&self, name: &str) -> Option<bool> {
        self.inner
            .lock()
            .trace_expect("Failed to lock instance")
            .controllers
            .get(name)
            .copied()
    }

    /// Flips a controller; service-provider handlers react by
    /// publishing or unregistering their service.
    pub fn set_controller_state(&self, name: &str, value: bool) {
        let changed = {
            let mut inner = self.inner.lock().trace_expect("Failed to lock instance");
            inner.controllers.insert(name.to_string(), value) != Some(value)
        };
        if !changed || self.state() == ComponentState::Killed {
            return;
        }
        for handler in self.handlers() {
            handler.on_controller_change(name, value);
        }
    }

    /// Updates one component property and notifies the handlers.
    pub fn set_property(&self, name: &str, value: impl Into<Value>) {
        if self.state() == ComponentState::Killed {
            return;
        }
        let value = value.into();
        let old = self.context.set_property(name, value.clone());
        if old.as_ref() == Some(&value) {
            return;
        }
        for handler in self.handlers() {
            handler.on_property_change(name, old.as_ref(), &value);
        }
    }
}

impl std::fmt::Debug for StoredInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredInstance")
            .field("name", &self.name)
            .field("factory", &self.factory_name)
            .field("state", &self.state())
            .finish()
    }
}
