//! Dependencies injected as maps, grouping bound services by the value
//! of a configured service property.

use super::*;
use crate::factory::MapConfig;

pub struct Factory;

impl HandlerFactory for Factory {
    fn get_handlers(&self, context: &Arc<ComponentContext>) -> Result<Vec<Arc<dyn Handler>>> {
        let Some(crate::factory::HandlerConfig::RequiresMap(configs)) = context
            .factory_context()
            .handler_config(constants::HANDLER_REQUIRES_MAP)
        else {
            return Ok(Vec::new());
        };

        let mut handlers: Vec<Arc<dyn Handler>> = Vec::new();
        for (field, config) in configs {
            handlers.push(MapDependency::new(field, config.clone())?);
        }
        Ok(handlers)
    }
}

enum KeyLookup {
    /// The bucket the service belongs to.
    Key(Option<String>),
    /// The service has no usable key and is not bound.
    Rejected,
}

#[derive(Default)]
struct MapState {
    /// Bound services with the bucket key they were filed under.
    services: Vec<(ServiceReference, ServiceObject, Option<String>)>,
}

impl MapState {
    fn bucket_occupied(&self, key: &Option<String>) -> bool {
        self.services.iter().any(|(_, _, k)| k == key)
    }

    fn injection(&self, aggregate: bool, optional: bool) -> Injection {
        if self.services.is_empty() && !optional {
            return Injection::Cleared;
        }
        if aggregate {
            let mut map: BTreeMap<Option<String>, Vec<ServiceObject>> = BTreeMap::new();
            for (_, service, key) in &self.services {
                map.entry(key.clone()).or_default().push(service.clone());
            }
            Injection::ServiceMultiMap(map)
        } else {
            let mut map: BTreeMap<Option<String>, ServiceObject> = BTreeMap::new();
            for (_, service, key) in &self.services {
                map.entry(key.clone()).or_insert_with(|| service.clone());
            }
            Injection::ServiceMap(map)
        }
    }
}

/// Groups bound services by a property key: one service per key, or a
/// list per key when the requirement is aggregate.
pub struct MapDependency {
    core: DependencyCore,
    config: MapConfig,
    aggregate: bool,
    state: Mutex<MapState>,
    me: Weak<MapDependency>,
}

impl MapDependency {
    pub(crate) fn new(field: &str, config: MapConfig) -> Result<Arc<Self>> {
        let aggregate = config.requirement.is_aggregate();
        let core = DependencyCore::new(field, config.requirement.clone());
        core.init_filter()?;
        Ok(Arc::new_cyclic(|me| Self {
            core,
            config,
            aggregate,
            state: Mutex::new(MapState::default()),
            me: me.clone(),
        }))
    }

    fn listener(&self) -> Option<Arc<dyn ServiceListener>> {
        self.me.upgrade().map(|me| me as Arc<dyn ServiceListener>)
    }

    fn key_of(&self, reference: &ServiceReference) -> KeyLookup {
        match reference.property(&self.config.key) {
            Some(value) => KeyLookup::Key(Some(value.to_string())),
            None if self.config.allow_none => KeyLookup::Key(None),
            None => KeyLookup::Rejected,
        }
    }

    fn optional(&self) -> bool {
        self.core.requirement().is_optional()
    }

    fn on_arrival(&self, reference: &ServiceReference) {
        let KeyLookup::Key(key) = self.key_of(reference) else {
            return;
        };

        let bound = {
            let mut state = self.state.lock().trace_expect("Failed to lock dependency");
            if state.services.iter().any(|(r, _, _)| r == reference) {
                None
            } else if !self.aggregate && state.bucket_occupied(&key) {
                // One service per key; duplicates are ignored
                None
            } else {
                let Some(service) = self.core.get_service(reference) else {
                    return;
                };
                state
                    .services
                    .push((reference.clone(), service.clone(), key));
                Some((service, state.injection(self.aggregate, self.optional())))
            }
        };

        if let Some((service, injection)) = bound {
            if let Some(instance) = self.core.instance() {
                instance.bind(self.core.field(), injection, &service, reference);
            }
        }
    }

    fn on_departure(&self, reference: &ServiceReference) {
        let lost = {
            let mut state = self.state.lock().trace_expect("Failed to lock dependency");
            match state.services.iter().position(|(r, _, _)| r == reference) {
                None => None,
                Some(pos) => {
                    let (_, service, _) = state.services.remove(pos);
                    Some((service, state.injection(self.aggregate, self.optional())))
                }
            }
        };

        if let Some((service, injection)) = lost {
            if let Some(instance) = self.core.instance() {
                instance.unbind(self.core.field(), injection, &service, reference);
            }
        }
    }

    fn on_modify(&self, reference: &ServiceReference, old: Option<&Properties>) {
        enum Action {
            Update(ServiceObject, Option<Injection>),
            Departure,
        }

        let action = {
            let mut state = self.state.lock().trace_expect("Failed to lock dependency");
            let Some(pos) = state.services.iter().position(|(r, _, _)| r == reference) else {
                drop(state);
                self.on_arrival(reference);
                return;
            };

            match self.key_of(reference) {
                KeyLookup::Rejected => Action::Departure,
                KeyLookup::Key(new_key) => {
                    let old_key = state.services[pos].2.clone();
                    if new_key == old_key {
                        Action::Update(state.services[pos].1.clone(), None)
                    } else if !self.aggregate && state.bucket_occupied(&new_key) {
                        // The target bucket is taken; the service leaves
                        Action::Departure
                    } else {
                        // Migrate between buckets atomically
                        state.services[pos].2 = new_key;
                        let service = state.services[pos].1.clone();
                        let injection = state.injection(self.aggregate, self.optional());
                        Action::Update(service, Some(injection))
                    }
                }
            }
        };

        match action {
            Action::Departure => self.on_departure(reference),
            Action::Update(service, injection) => {
                if let Some(instance) = self.core.instance() {
                    instance.update(
                        self.core.field(),
                        injection,
                        &service,
                        reference,
                        old.unwrap_or(&Properties::new()),
                    );
                }
            }
        }
    }
}

impl ServiceListener for MapDependency {
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

impl Handler for MapDependency {
    fn kinds(&self) -> &[HandlerKind] {
        &[HandlerKind::Dependency]
    }

    fn manipulate(&self, instance: &Arc<StoredInstance>) {
        self.core.attach(instance);
        // The field starts as an empty map
        let empty = if self.aggregate {
            Injection::ServiceMultiMap(BTreeMap::new())
        } else {
            Injection::ServiceMap(BTreeMap::new())
        };
        instance.assign_binding(self.core.field(), empty);
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
            .map(|(r, s, _)| (s.clone(), r.clone()))
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

impl DependencyHandler for MapDependency {
    fn field(&self) -> &str {
        self.core.field()
    }

    fn bindings(&self) -> Vec<ServiceReference> {
        self.state
            .lock()
            .trace_expect("Failed to lock dependency")
            .services
            .iter()
            .map(|(r, _, _)| r.clone())
            .collect()
    }

    fn try_binding(&self) {
        let already_bound = !self
            .state
            .lock()
            .trace_expect("Failed to lock dependency")
            .services
            .is_empty();
        if already_bound {
            return;
        }

        for reference in self.core.lookup_all() {
            self.on_arrival(&reference);
        }
    }
}
