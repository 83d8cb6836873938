//! Temporal dependency: the injected value is a proxy whose calls block
//! up to a timeout waiting for a service, riding out provider swaps
//! without invalidating the component.

use super::*;
use crate::factory::TemporalConfig;
use gantry_framework::clock::{Clock, SystemClock};
use gantry_framework::events::FrameworkStopListener;
use std::sync::Condvar;
use std::time::Duration;
use thiserror::Error;

pub struct Factory;

impl HandlerFactory for Factory {
    fn get_handlers(&self, context: &Arc<ComponentContext>) -> Result<Vec<Arc<dyn Handler>>> {
        let Some(crate::factory::HandlerConfig::Temporal(configs)) = context
            .factory_context()
            .handler_config(constants::HANDLER_TEMPORAL)
        else {
            return Ok(Vec::new());
        };

        let mut handlers: Vec<Arc<dyn Handler>> = Vec::new();
        for (field, config) in configs {
            if config.timeout.is_zero() {
                return Err(Error::HandlerConfiguration(format!(
                    "temporal dependency '{field}' needs a positive timeout"
                )));
            }
            handlers.push(TemporalDependency::new(field, config.clone())?);
        }
        Ok(handlers)
    }
}

#[derive(Error, Debug)]
pub enum TemporalError {
    #[error("No service available before the timeout")]
    Timeout,

    #[error("The framework is stopping")]
    Stopped,
}

struct ProxyState {
    service: Option<ServiceObject>,
    closed: bool,
}

struct TemporalInner {
    state: Mutex<ProxyState>,
    available: Condvar,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

/// The injected proxy. Calls block up to the configured timeout until a
/// backing service is available.
#[derive(Clone)]
pub struct TemporalProxy {
    inner: Arc<TemporalInner>,
}

impl TemporalProxy {
    fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(TemporalInner {
                state: Mutex::new(ProxyState {
                    service: None,
                    closed: false,
                }),
                available: Condvar::new(),
                timeout,
                clock,
            }),
        }
    }

    /// Runs `call` against the backing service, waiting up to the
    /// timeout for one to arrive.
    pub fn call<R>(
        &self,
        call: impl FnOnce(&ServiceObject) -> R,
    ) -> std::result::Result<R, TemporalError> {
        let deadline = self.inner.clock.now() + self.inner.timeout;
        let mut state = self
            .inner
            .state
            .lock()
            .trace_expect("Failed to lock temporal proxy");

        loop {
            if let Some(service) = state.service.clone() {
                drop(state);
                return Ok(call(&service));
            }
            if state.closed {
                return Err(TemporalError::Stopped);
            }

            let now = self.inner.clock.now();
            if now >= deadline {
                return Err(TemporalError::Timeout);
            }
            let (guard, _) = self
                .inner
                .available
                .wait_timeout(state, deadline - now)
                .trace_expect("Failed to wait on temporal proxy");
            state = guard;
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner
            .state
            .lock()
            .trace_expect("Failed to lock temporal proxy")
            .service
            .is_some()
    }

    fn set_service(&self, service: ServiceObject) {
        self.inner
            .state
            .lock()
            .trace_expect("Failed to lock temporal proxy")
            .service = Some(service);
        self.inner.available.notify_all();
    }

    fn take_service(&self) -> Option<ServiceObject> {
        self.inner
            .state
            .lock()
            .trace_expect("Failed to lock temporal proxy")
            .service
            .take()
    }

    /// Wakes every waiter with a stopped error; used at teardown.
    fn close(&self) {
        self.inner
            .state
            .lock()
            .trace_expect("Failed to lock temporal proxy")
            .closed = true;
        self.inner.available.notify_all();
    }
}

#[derive(Default)]
struct TemporalState {
    reference: Option<ServiceReference>,
    service: Option<ServiceObject>,
    pending: Option<ServiceReference>,
    still_valid: bool,
    /// Bumped on every (re)bind and cancellation; a grace timer only
    /// fires if its generation is still current.
    generation: u64,
    /// Deferred unbind arguments while a grace timer runs.
    grace: Option<(ServiceObject, ServiceReference)>,
}

pub struct TemporalDependency {
    core: DependencyCore,
    timeout: Duration,
    clock: Arc<dyn Clock>,
    proxy: TemporalProxy,
    state: Mutex<TemporalState>,
    timer_cvar: Condvar,
    me: Weak<TemporalDependency>,
}

impl TemporalDependency {
    pub(crate) fn new(field: &str, config: TemporalConfig) -> Result<Arc<Self>> {
        let core = DependencyCore::new(field, config.requirement);
        core.init_filter()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Ok(Arc::new_cyclic(|me| Self {
            core,
            timeout: config.timeout,
            clock: clock.clone(),
            proxy: TemporalProxy::new(config.timeout, clock),
            state: Mutex::new(TemporalState::default()),
            timer_cvar: Condvar::new(),
            me: me.clone(),
        }))
    }

    fn listener(&self) -> Option<Arc<dyn ServiceListener>> {
        self.me.upgrade().map(|me| me as Arc<dyn ServiceListener>)
    }

    fn injection(&self) -> Injection {
        Injection::Temporal(self.proxy.clone())
    }

    fn on_arrival(&self, reference: &ServiceReference) {
        let (service, cancelled_grace) = {
            let mut state = self.state.lock().trace_expect("Failed to lock dependency");
            if state.reference.is_some() {
                return;
            }
            let Some(service) = self.core.get_service(reference) else {
                return;
            };

            state.reference = Some(reference.clone());
            state.service = Some(service.clone());
            state.pending = None;
            state.still_valid = true;
            state.generation += 1;
            let grace = state.grace.take();

            self.proxy.set_service(service.clone());
            (service, grace)
        };
        self.timer_cvar.notify_all();

        let Some(instance) = self.core.instance() else {
            return;
        };

        if let Some((old_service, old_reference)) = cancelled_grace {
            // Replacement arrived within the grace period: deliver the
            // deferred unbind first; the component stays valid
            instance.unbind(self.core.field(), self.injection(), &old_service, &old_reference);
        }

        instance.bind(self.core.field(), self.injection(), &service, reference);
    }

    fn on_departure(&self, reference: &ServiceReference) {
        enum Action {
            UnbindNow(ServiceObject),
            StartGrace(u64),
        }

        let action = {
            let mut state = self.state.lock().trace_expect("Failed to lock dependency");
            if state.reference.as_ref() != Some(reference) {
                return;
            }

            let Some(service) = state.service.take() else {
                return;
            };
            state.reference = None;
            self.proxy.take_service();

            state.pending = self.core.lookup_one();
            if state.pending.is_none() {
                // No replacement yet: wait out the grace period
                state.still_valid = true;
                state.generation += 1;
                state.grace = Some((service, reference.clone()));
                Action::StartGrace(state.generation)
            } else {
                Action::UnbindNow(service)
            }
        };

        match action {
            Action::UnbindNow(service) => {
                if let Some(instance) = self.core.instance() {
                    instance.unbind(self.core.field(), self.injection(), &service, reference);
                }
            }
            Action::StartGrace(generation) => {
                if let Some(me) = self.me.upgrade() {
                    std::thread::spawn(move || me.grace_expired(generation));
                }
            }
        }
    }

    /// Timer body: waits out the grace period unless cancelled by a
    /// replacement, then publishes the deferred unbind as an
    /// invalidating departure.
    fn grace_expired(&self, generation: u64) {
        let deadline = self.clock.now() + self.timeout;
        let mut state = self.state.lock().trace_expect("Failed to lock dependency");
        loop {
            if state.generation != generation {
                // Cancelled
                return;
            }
            let now = self.clock.now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .timer_cvar
                .wait_timeout(state, deadline - now)
                .trace_expect("Failed to wait on grace timer");
            state = guard;
        }

        state.still_valid = false;
        let Some((service, reference)) = state.grace.take() else {
            return;
        };
        drop(state);

        if let Some(instance) = self.core.instance() {
            instance.unbind(self.core.field(), self.injection(), &service, &reference);
        }
    }

    fn on_modify(&self, reference: &ServiceReference, old: Option<&Properties>) {
        let current = {
            let state = self.state.lock().trace_expect("Failed to lock dependency");
            match (&state.reference, &state.service) {
                (Some(bound), Some(service)) if bound == reference => Some(service.clone()),
                (None, _) => None,
                _ => return,
            }
        };

        match current {
            None => self.on_arrival(reference),
            Some(service) => {
                if let Some(instance) = self.core.instance() {
                    instance.update(
                        self.core.field(),
                        None,
                        &service,
                        reference,
                        old.unwrap_or(&Properties::new()),
                    );
                }
            }
        }
    }
}

impl ServiceListener for TemporalDependency {
    fn service_changed(&self, event: &ServiceEvent) {
        let Some(instance) = self.core.instance() else {
            return;
        };
        if !instance.check_event(event) {
            return;
        }

        match event.kind() {
            ServiceEventKind::Registered => self.on_arrival(event.reference()),
            ServiceEventKind::Unregistering | ServiceEventKind::ModifiedEndmatch => {
                self.on_departure(event.reference())
            }
            ServiceEventKind::Modified => {
                self.on_modify(event.reference(), event.previous_properties())
            }
        }
    }
}

impl FrameworkStopListener for TemporalDependency {
    fn framework_stopping(&self) {
        // Waiters must not out-live the framework
        self.proxy.close();
    }
}

impl Handler for TemporalDependency {
    fn kinds(&self) -> &[HandlerKind] {
        &[HandlerKind::Dependency]
    }

    fn manipulate(&self, instance: &Arc<StoredInstance>) {
        self.core.attach(instance);
        // The proxy is the injected value from the start
        instance.assign_binding(self.core.field(), self.injection());
    }

    fn start(&self) {
        if let Some(listener) = self.listener() {
            self.core.subscribe(listener);
        }
        if let (Some(me), Some(context)) = (self.me.upgrade(), self.core.context()) {
            let _ = context.add_framework_stop_listener(me as Arc<dyn FrameworkStopListener>);
        }
    }

    fn stop(&self) -> Vec<(ServiceObject, ServiceReference)> {
        if let Some(listener) = self.listener() {
            self.core.unsubscribe(&listener);
        }
        if let (Some(me), Some(context)) = (self.me.upgrade(), self.core.context()) {
            context.remove_framework_stop_listener(&(me as Arc<dyn FrameworkStopListener>));
        }

        let state = self.state.lock().trace_expect("Failed to lock dependency");
        match (&state.service, &state.reference) {
            (Some(service), Some(reference)) => vec![(service.clone(), reference.clone())],
            _ => Vec::new(),
        }
    }

    fn clear(&self) {
        self.proxy.close();
        {
            let mut state = self.state.lock().trace_expect("Failed to lock dependency");
            let generation = state.generation + 1;
            *state = TemporalState {
                generation,
                ..TemporalState::default()
            };
        }
        self.timer_cvar.notify_all();
    }

    fn is_valid(&self) -> bool {
        let state = self.state.lock().trace_expect("Failed to lock dependency");
        state.still_valid || state.pending.is_some()
    }

    fn as_dependency(&self) -> Option<&dyn DependencyHandler> {
        Some(self)
    }
}

impl DependencyHandler for TemporalDependency {
    fn field(&self) -> &str {
        self.core.field()
    }

    fn bindings(&self) -> Vec<ServiceReference> {
        let state = self.state.lock().trace_expect("Failed to lock dependency");
        state.reference.iter().cloned().collect()
    }

    fn try_binding(&self) {
        let candidate = {
            let mut state = self.state.lock().trace_expect("Failed to lock dependency");
            if state.reference.is_some() {
                return;
            }
            state.pending.take()
        };

        let candidate = candidate.or_else(|| self.core.lookup_one());
        if let Some(reference) = candidate {
            self.on_arrival(&reference);
        }
    }
}
