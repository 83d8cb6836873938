//! Simple and aggregate service dependencies.

use super::*;

pub struct Factory;

impl HandlerFactory for Factory {
    fn get_handlers(&self, context: &Arc<ComponentContext>) -> Result<Vec<Arc<dyn Handler>>> {
        let Some(crate::factory::HandlerConfig::Requires(requirements)) = context
            .factory_context()
            .handler_config(constants::HANDLER_REQUIRES)
        else {
            return Ok(Vec::new());
        };

        let mut handlers: Vec<Arc<dyn Handler>> = Vec::new();
        for (field, requirement) in requirements {
            if requirement.is_aggregate() {
                handlers.push(AggregateDependency::new(field, requirement.clone())?);
            } else {
                handlers.push(SimpleDependency::new(field, requirement.clone())?);
            }
        }
        Ok(handlers)
    }
}

#[derive(Default)]
struct SimpleState {
    reference: Option<ServiceReference>,
    value: Option<ServiceObject>,
    /// Replacement found on departure, to keep the component valid when
    /// immediate rebind is requested.
    pending: Option<ServiceReference>,
}

/// At most one bound service.
pub struct SimpleDependency {
    core: DependencyCore,
    state: Mutex<SimpleState>,
    me: Weak<SimpleDependency>,
}

impl SimpleDependency {
    pub(crate) fn new(field: &str, requirement: Requirement) -> Result<Arc<Self>> {
        let core = DependencyCore::new(field, requirement);
        core.init_filter()?;
        Ok(Arc::new_cyclic(|me| Self {
            core,
            state: Mutex::new(SimpleState::default()),
            me: me.clone(),
        }))
    }

    pub(crate) fn core(&self) -> &DependencyCore {
        &self.core
    }

    fn listener(&self) -> Option<Arc<dyn ServiceListener>> {
        self.me.upgrade().map(|me| me as Arc<dyn ServiceListener>)
    }

    pub(crate) fn resubscribe(&self) {
        if let Some(listener) = self.listener() {
            self.core.unsubscribe(&listener);
            self.core.subscribe(listener);
        }
    }

    pub(crate) fn current_bindings(&self) -> Vec<ServiceReference> {
        let state = self.state.lock().trace_expect("Failed to lock dependency");
        state.reference.iter().cloned().collect()
    }

    pub(crate) fn on_arrival(&self, reference: &ServiceReference) {
        let bound = {
            let mut state = self.state.lock().trace_expect("Failed to lock dependency");
            if state.value.is_some() {
                None
            } else {
                let Some(service) = self.core.get_service(reference) else {
                    return;
                };
                state.reference = Some(reference.clone());
                state.value = Some(service.clone());
                state.pending = None;
                Some(service)
            }
        };

        if let Some(service) = bound {
            if let Some(instance) = self.core.instance() {
                instance.bind(
                    self.core.field(),
                    Injection::Service(service.clone()),
                    &service,
                    reference,
                );
            }
        }
    }

    pub(crate) fn on_departure(&self, reference: &ServiceReference) {
        let lost = {
            let mut state = self.state.lock().trace_expect("Failed to lock dependency");
            if state.reference.as_ref() != Some(reference) {
                None
            } else {
                let service = state.value.take();
                state.reference = None;
                if self.core.requirement().is_immediate_rebind() {
                    // Look for a replacement before publishing the loss
                    state.pending = self.core.lookup_one();
                }
                service
            }
        };

        if let Some(service) = lost {
            if let Some(instance) = self.core.instance() {
                instance.unbind(self.core.field(), Injection::Cleared, &service, reference);
            }
        }
    }

    pub(crate) fn on_modify(&self, reference: &ServiceReference, old: Option<&Properties>) {
        let current = {
            let state = self.state.lock().trace_expect("Failed to lock dependency");
            match (&state.reference, &state.value) {
                (Some(bound), Some(value)) if bound == reference => Some(value.clone()),
                (None, _) => None,
                _ => return,
            }
        };

        match current {
            None => {
                // A known service now matches the filter
                self.on_arrival(reference);
            }
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

impl ServiceListener for SimpleDependency {
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

impl Handler for SimpleDependency {
    fn kinds(&self) -> &[HandlerKind] {
        &[HandlerKind::Dependency]
    }

    fn manipulate(&self, instance: &Arc<StoredInstance>) {
        self.core.attach(instance);
        if self.core.requirement().is_optional() {
            instance.assign_binding(self.core.field(), Injection::Cleared);
        }
    }

    fn start(&self) {
        if let Some(listener) = self.listener() {
            self.core.subscribe(listener);
        }
    }

    fn stop(&self) -> Vec<(ServiceObject, ServiceReference)> {
        if let Some(listener) = self.listener() {
            self.core.unsubscribe(&listener);
        }
        let state = self.state.lock().trace_expect("Failed to lock dependency");
        match (&state.value, &state.reference) {
            (Some(service), Some(reference)) => vec![(service.clone(), reference.clone())],
            _ => Vec::new(),
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock().trace_expect("Failed to lock dependency");
        *state = SimpleState::default();
    }

    fn is_valid(&self) -> bool {
        if !self.core.filter_ok() {
            return false;
        }
        if self.core.requirement().is_optional() {
            return true;
        }
        let state = self.state.lock().trace_expect("Failed to lock dependency");
        state.value.is_some()
            || (self.core.requirement().is_immediate_rebind() && state.pending.is_some())
    }

    fn as_dependency(&self) -> Option<&dyn DependencyHandler> {
        Some(self)
    }
}

impl DependencyHandler for SimpleDependency {
    fn field(&self) -> &str {
        self.core.field()
    }

    fn bindings(&self) -> Vec<ServiceReference> {
        self.current_bindings()
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

#[derive(Default)]
struct AggregateState {
    /// Bound services, in arrival order.
    services: Vec<(ServiceReference, ServiceObject)>,
}

impl AggregateState {
    fn injection(&self, optional: bool) -> Injection {
        if self.services.is_empty() {
            if optional {
                Injection::Services(Vec::new())
            } else {
                Injection::Cleared
            }
        } else {
            Injection::Services(self.services.iter().map(|(_, s)| s.clone()).collect())
        }
    }
}

/// An ordered list of bound services.
pub struct AggregateDependency {
    core: DependencyCore,
    state: Mutex<AggregateState>,
    me: Weak<AggregateDependency>,
}

impl AggregateDependency {
    pub(crate) fn new(field: &str, requirement: Requirement) -> Result<Arc<Self>> {
        let core = DependencyCore::new(field, requirement);
        core.init_filter()?;
        Ok(Arc::new_cyclic(|me| Self {
            core,
            state: Mutex::new(AggregateState::default()),
            me: me.clone(),
        }))
    }

    pub(crate) fn core(&self) -> &DependencyCore {
        &self.core
    }

    fn listener(&self) -> Option<Arc<dyn ServiceListener>> {
        self.me.upgrade().map(|me| me as Arc<dyn ServiceListener>)
    }

    pub(crate) fn resubscribe(&self) {
        if let Some(listener) = self.listener() {
            self.core.unsubscribe(&listener);
            self.core.subscribe(listener);
        }
    }

    pub(crate) fn current_bindings(&self) -> Vec<ServiceReference> {
        self.state
            .lock()
            .trace_expect("Failed to lock dependency")
            .services
            .iter()
            .map(|(r, _)| r.clone())
            .collect()
    }

    pub(crate) fn on_arrival(&self, reference: &ServiceReference) {
        let bound = {
            let mut state = self.state.lock().trace_expect("Failed to lock dependency");
            if state.services.iter().any(|(r, _)| r == reference) {
                None
            } else {
                let Some(service) = self.core.get_service(reference) else {
                    return;
                };
                state.services.push((reference.clone(), service.clone()));
                Some((service, state.injection(self.core.requirement().is_optional())))
            }
        };

        if let Some((service, injection)) = bound {
            if let Some(instance) = self.core.instance() {
                instance.bind(self.core.field(), injection, &service, reference);
            }
        }
    }

    pub(crate) fn on_departure(&self, reference: &ServiceReference) {
        let lost = {
            let mut state = self.state.lock().trace_expect("Failed to lock dependency");
            match state.services.iter().position(|(r, _)| r == reference) {
                None => None,
                Some(pos) => {
                    let (_, service) = state.services.remove(pos);
                    Some((
                        service,
                        state.injection(self.core.requirement().is_optional()),
                    ))
                }
            }
        };

        if let Some((service, injection)) = lost {
            if let Some(instance) = self.core.instance() {
                instance.unbind(self.core.field(), injection, &service, reference);
            }
        }
    }

    pub(crate) fn on_modify(&self, reference: &ServiceReference, old: Option<&Properties>) {
        let known = {
            let state = self.state.lock().trace_expect("Failed to lock dependency");
            state
                .services
                .iter()
                .find(|(r, _)| r == reference)
                .map(|(_, s)| s.clone())
        };

        match known {
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

impl ServiceListener for AggregateDependency {
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

impl Handler for AggregateDependency {
    fn kinds(&self) -> &[HandlerKind] {
        &[HandlerKind::Dependency]
    }

    fn manipulate(&self, instance: &Arc<StoredInstance>) {
        self.core.attach(instance);
        if self.core.requirement().is_optional() {
            instance.assign_binding(self.core.field(), Injection::Services(Vec::new()));
        }
    }

    fn start(&self) {
        if let Some(listener) = self.listener() {
            self.core.subscribe(listener);
        }
    }

    fn stop(&self) -> Vec<(ServiceObject, ServiceReference)> {
        if let Some(listener) = self.listener() {
            self.core.unsubscribe(&listener);
        }
        self.state
            .lock()
            .trace_expect("Failed to lock dependency")
            .services
            .iter()
            .map(|(r, s)| (s.clone(), r.clone()))
            .collect()
    }

    fn clear(&self) {
        self.state
            .lock()
            .trace_expect("Failed to lock dependency")
            .services
            .clear();
    }

    fn is_valid(&self) -> bool {
        if !self.core.filter_ok() {
            return false;
        }
        self.core.requirement().is_optional()
            || !self
                .state
                .lock()
                .trace_expect("Failed to lock dependency")
                .services
                .is_empty()
    }

    fn as_dependency(&self) -> Option<&dyn DependencyHandler> {
        Some(self)
    }
}

impl DependencyHandler for AggregateDependency {
    fn field(&self) -> &str {
        self.core.field()
    }

    fn bindings(&self) -> Vec<ServiceReference> {
        self.current_bindings()
    }

    fn try_binding(&self) {
        let already_bound = !self
            .state
            .lock()
            .trace_expect("Failed to lock dependency")
            .services
            .is_empty();
        if already_bound {
            // Already alive; service events keep us up to date
            return;
        }

        for reference in self.core.lookup_all() {
            self.on_arrival(&reference);
        }
    }
}
