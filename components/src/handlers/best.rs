//! Simple dependency with ranking-based reselection: when a strictly
//! better-ranked service appears, the current one is unbound and the
//! newcomer bound in its place.

use super::*;

pub struct Factory;

impl HandlerFactory for Factory {
    fn get_handlers(&self, context: &Arc<ComponentContext>) -> Result<Vec<Arc<dyn Handler>>> {
        let Some(crate::factory::HandlerConfig::RequiresBest(requirements)) = context
            .factory_context()
            .handler_config(constants::HANDLER_REQUIRES_BEST)
        else {
            return Ok(Vec::new());
        };

        let mut handlers: Vec<Arc<dyn Handler>> = Vec::new();
        for (field, requirement) in requirements {
            handlers.push(BestDependency::new(field, requirement.clone())?);
        }
        Ok(handlers)
    }
}

#[derive(Default)]
struct BestState {
    reference: Option<ServiceReference>,
    value: Option<ServiceObject>,
    current_ranking: Option<i64>,
    pending: Option<ServiceReference>,
}

pub struct BestDependency {
    core: DependencyCore,
    state: Mutex<BestState>,
    me: Weak<BestDependency>,
}

impl BestDependency {
    pub(crate) fn new(field: &str, requirement: Requirement) -> Result<Arc<Self>> {
        let core = DependencyCore::new(field, requirement);
        core.init_filter()?;
        Ok(Arc::new_cyclic(|me| Self {
            core,
            state: Mutex::new(BestState::default()),
            me: me.clone(),
        }))
    }

    fn listener(&self) -> Option<Arc<dyn ServiceListener>> {
        self.me.upgrade().map(|me| me as Arc<dyn ServiceListener>)
    }

    fn on_arrival(&self, reference: &ServiceReference) {
        enum Action {
            Bind(ServiceObject),
            Supersede(ServiceObject, ServiceReference),
        }

        let action = {
            let mut state = self.state.lock().trace_expect("Failed to lock dependency");
            match state.current_ranking {
                Some(current) if reference.ranking() > current => {
                    // Strictly better: unbind the current, remember the
                    // newcomer for the rebind
                    state.pending = Some(reference.clone());
                    state.current_ranking = None;
                    let old_value = state.value.take();
                    let old_reference = state.reference.take();
                    match (old_value, old_reference) {
                        (Some(v), Some(r)) => Some(Action::Supersede(v, r)),
                        _ => None,
                    }
                }
                Some(_) => None,
                None => {
                    let Some(service) = self.core.get_service(reference) else {
                        return;
                    };
                    state.reference = Some(reference.clone());
                    state.value = Some(service.clone());
                    state.current_ranking = Some(reference.ranking());
                    state.pending = None;
                    Some(Action::Bind(service))
                }
            }
        };

        let Some(instance) = self.core.instance() else {
            return;
        };
        match action {
            None => {}
            Some(Action::Bind(service)) => {
                instance.bind(
                    self.core.field(),
                    Injection::Service(service.clone()),
                    &service,
                    reference,
                );
            }
            Some(Action::Supersede(service, old_reference)) => {
                // The unbind triggers try_binding, which picks up the
                // pending reference
                instance.unbind(self.core.field(), Injection::Cleared, &service, &old_reference);
            }
        }
    }

    fn on_departure(&self, reference: &ServiceReference) {
        let lost = {
            let mut state = self.state.lock().trace_expect("Failed to lock dependency");
            if state.reference.as_ref() != Some(reference) {
                None
            } else {
                let service = state.value.take();
                state.reference = None;
                state.current_ranking = None;
                state.pending = if self.core.requirement().is_immediate_rebind() {
                    self.core.lookup_one()
                } else {
                    None
                };
                service
            }
        };

        if let Some(service) = lost {
            if let Some(instance) = self.core.instance() {
                instance.unbind(self.core.field(), Injection::Cleared, &service, reference);
            }
        }
    }

    fn on_modify(&self, reference: &ServiceReference, old: Option<&Properties>) {
        let (bound, current) = {
            let state = self.state.lock().trace_expect("Failed to lock dependency");
            (state.reference.clone(), state.value.clone())
        };

        let Some(bound) = bound else {
            // A known service now matches the filter
            self.on_arrival(reference);
            return;
        };

        // A ranking change may promote another service
        let best = self.core.lookup_one();
        if best.as_ref() == Some(&bound) {
            if &bound == reference {
                if let (Some(service), Some(instance)) = (current, self.core.instance()) {
                    instance.update(
                        self.core.field(),
                        None,
                        &service,
                        reference,
                        old.unwrap_or(&Properties::new()),
                    );
                }
            }
        } else {
            // Someone else is now the best: run a departure round
            self.on_departure(&bound);
        }
    }
}

impl ServiceListener for BestDependency {
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

impl Handler for BestDependency {
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
        *self.state.lock().trace_expect("Failed to lock dependency") = BestState::default();
    }

    fn is_valid(&self) -> bool {
        if self.core.requirement().is_optional() {
            return true;
        }
        let state = self.state.lock().trace_expect("Failed to lock dependency");
        state.value.is_some() || state.pending.is_some()
    }

    fn as_dependency(&self) -> Option<&dyn DependencyHandler> {
        Some(self)
    }
}

impl DependencyHandler for BestDependency {
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
