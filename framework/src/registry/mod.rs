use super::*;
use crate::events::{ServiceEvent, ServiceEventKind};
use gantry_filter::Filter;

mod factory;
mod reference;

pub use factory::{Provided, PrototypeServiceFactory, ServiceFactory, ServiceObject};
pub use reference::{ServiceReference, SortKey};

use factory::{FactoryUse, UsageCounter};

/// The owner-side handle on one registered service.
#[derive(Clone)]
pub struct ServiceRegistration {
    registry: Weak<ServiceRegistry>,
    reference: ServiceReference,
}

impl ServiceRegistration {
    fn new(registry: Weak<ServiceRegistry>, reference: ServiceReference) -> Self {
        Self {
            registry,
            reference,
        }
    }

    pub fn reference(&self) -> &ServiceReference {
        &self.reference
    }

    /// Updates the service properties.
    ///
    /// `objectClass` and `service.id` are ignored; a non-coercible
    /// `service.ranking` drops the key from the update. Emits a MODIFIED
    /// event carrying the previous snapshot.
    pub fn set_properties(&self, update: Properties) -> Result<()> {
        self.registry
            .upgrade()
            .ok_or(Error::FrameworkStopped)?
            .update_properties(&self.reference, update)
    }

    pub fn unregister(&self) -> Result<()> {
        self.registry
            .upgrade()
            .ok_or(Error::FrameworkStopped)?
            .unregister(&self.reference)
            .map(|_| ())
    }
}

impl std::fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("reference", &self.reference)
            .finish()
    }
}

#[derive(Default)]
struct Inner {
    next_service_id: u64,

    /// Reference -> what the registration provides
    services: HashMap<ServiceReference, Provided>,
    /// Reference -> owner-side registration (needed for factory hooks)
    registrations: HashMap<ServiceReference, ServiceRegistration>,
    /// Specification -> references, always sorted by sort key
    specs: HashMap<String, Vec<ServiceReference>>,
    /// Owner bundle -> its registered references
    bundle_services: HashMap<u64, HashSet<ServiceReference>>,
    /// Consumer bundle -> reference -> usage counter
    imports: HashMap<u64, HashMap<ServiceReference, UsageCounter>>,
    /// Consumer bundle -> factory-produced object bookkeeping
    factory_use: HashMap<u64, FactoryUse>,
    /// Hidden services, still resolvable for in-flight unregistration
    pending: HashMap<ServiceReference, Provided>,
}

impl Inner {
    fn remove_from_specs(&mut self, reference: &ServiceReference) {
        for spec in reference.specifications() {
            if let Some(refs) = self.specs.get_mut(&spec) {
                if let Ok(pos) = refs.binary_search(reference) {
                    refs.remove(pos);
                }
                if refs.is_empty() {
                    self.specs.remove(&spec);
                }
            }
        }
    }

    fn insert_into_specs(&mut self, reference: &ServiceReference) {
        for spec in reference.specifications() {
            let refs = self.specs.entry(spec).or_default();
            let pos = refs.binary_search(reference).unwrap_or_else(|p| p);
            refs.insert(pos, reference.clone());
        }
    }
}

/// The service registry: assigns identities, indexes services by
/// specification, enforces scopes and tracks per-bundle usage.
///
/// All state lives under a single mutex; user code (factories, event
/// listeners) is always invoked after that mutex has been released.
pub struct ServiceRegistry {
    dispatcher: Arc<dispatcher::EventDispatcher>,
    inner: Mutex<Inner>,
}

impl ServiceRegistry {
    pub(crate) fn new(dispatcher: Arc<dispatcher::EventDispatcher>) -> Self {
        Self {
            dispatcher,
            inner: Mutex::new(Inner {
                next_service_id: 1,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        bundle: &Arc<bundle::Bundle>,
        specifications: &[&str],
        mut properties: Properties,
        provided: Provided,
    ) -> Result<ServiceRegistration> {
        if specifications.is_empty() {
            return Err(Error::NoSpecification);
        }

        let registration = {
            let mut inner = self.inner.lock().trace_expect("Failed to lock registry");

            let service_id = inner.next_service_id;
            inner.next_service_id += 1;

            properties.insert(
                keys::OBJECTCLASS,
                Value::List(specifications.iter().map(|s| Value::from(*s)).collect()),
            );
            properties.insert(keys::SERVICE_ID, service_id as i64);
            properties.insert(keys::SERVICE_BUNDLEID, bundle.id() as i64);
            properties.insert(keys::SERVICE_SCOPE, provided.scope());

            // Force a valid service ranking
            let ranking = properties
                .get(keys::SERVICE_RANKING)
                .and_then(Value::coerce_int)
                .unwrap_or(0);
            properties.insert(keys::SERVICE_RANKING, ranking);

            let reference = ServiceReference::new(bundle.id(), properties);
            let registration = ServiceRegistration::new(Arc::downgrade(self), reference.clone());

            inner.services.insert(reference.clone(), provided);
            inner
                .registrations
                .insert(reference.clone(), registration.clone());
            inner.insert_into_specs(&reference);
            inner
                .bundle_services
                .entry(bundle.id())
                .or_default()
                .insert(reference);

            registration
        };

        metrics::counter!("gantry_services_registered").increment(1);
        debug!(
            "Registered service #{} under {:?}",
            registration.reference().service_id(),
            specifications
        );

        self.dispatcher.fire_service_event(&ServiceEvent::new(
            ServiceEventKind::Registered,
            registration.reference().clone(),
            None,
        ));

        Ok(registration)
    }

    /// Unregisters a service, returning what it provided.
    ///
    /// The UNREGISTERING event is delivered while the service is still
    /// resolvable. References found only in the pending set (hidden by
    /// [`Self::hide_bundle_services`]) are accepted.
    pub(crate) fn unregister(&self, reference: &ServiceReference) -> Result<Provided> {
        {
            let inner = self.inner.lock().trace_expect("Failed to lock registry");
            if !inner.services.contains_key(reference) && !inner.pending.contains_key(reference) {
                return Err(Error::UnknownService(format!(
                    "#{}",
                    reference.service_id()
                )));
            }
        }

        self.dispatcher.fire_service_event(&ServiceEvent::new(
            ServiceEventKind::Unregistering,
            reference.clone(),
            None,
        ));

        let (provided, releases) = {
            let mut inner = self.inner.lock().trace_expect("Failed to lock registry");

            let provided = if let Some(provided) = inner.pending.remove(reference) {
                provided
            } else {
                let provided = inner.services.remove(reference).ok_or_else(|| {
                    Error::UnknownService(format!("#{}", reference.service_id()))
                })?;
                inner.remove_from_specs(reference);
                if let Some(refs) = inner.bundle_services.get_mut(&reference.bundle_id()) {
                    refs.remove(reference);
                    if refs.is_empty() {
                        inner.bundle_services.remove(&reference.bundle_id());
                    }
                }
                provided
            };

            let registration = inner.registrations.remove(reference);

            // Collect the factory clean-ups for every consumer bundle
            let mut releases = Vec::new();
            if let Some(registration) = registration {
                if matches!(provided, Provided::Factory(_) | Provided::Prototype(_)) {
                    let consumers: Vec<u64> = inner.factory_use.keys().copied().collect();
                    for consumer in consumers {
                        let Some(fu) = inner.factory_use.get_mut(&consumer) else {
                            continue;
                        };
                        let Some((instances, _)) = fu.factored.remove(reference) else {
                            continue;
                        };
                        let consumer_bundle = fu.bundle.clone();
                        if !fu.is_used() {
                            inner.factory_use.remove(&consumer);
                        }
                        if let Some(imports) = inner.imports.get_mut(&consumer) {
                            imports.remove(reference);
                            if imports.is_empty() {
                                inner.imports.remove(&consumer);
                            }
                        }
                        releases.push((consumer_bundle, instances, registration.clone()));
                    }
                }
            }

            (provided, releases)
        };

        // Call the factories back outside the lock; errors during
        // consumer-side teardown must not stop the unregistration
        for (consumer, instances, registration) in releases {
            match &provided {
                Provided::Prototype(factory) => {
                    for instance in &instances {
                        factory.unget_service_instance(&consumer, &registration, instance);
                    }
                    factory.unget_service(&consumer, &registration);
                }
                Provided::Factory(factory) => {
                    factory.unget_service(&consumer, &registration);
                }
                Provided::Instance(_) => {}
            }
            reference.unused_by(consumer.id());
        }

        metrics::counter!("gantry_services_unregistered").increment(1);
        debug!("Unregistered service #{}", reference.service_id());

        Ok(provided)
    }

    /// Returns the service object for a reference, per its scope.
    pub(crate) fn get_service(
        &self,
        bundle: &Arc<bundle::Bundle>,
        reference: &ServiceReference,
    ) -> Result<ServiceObject> {
        enum Plan {
            Done(ServiceObject),
            Create(Provided, ServiceRegistration),
        }

        let plan = {
            let mut inner = self.inner.lock().trace_expect("Failed to lock registry");

            let provided = inner
                .services
                .get(reference)
                .cloned()
                .ok_or_else(|| Error::UnknownService(format!("#{}", reference.service_id())))?;

            match provided {
                Provided::Instance(instance) => {
                    inner
                        .imports
                        .entry(bundle.id())
                        .or_default()
                        .entry(reference.clone())
                        .or_default()
                        .inc();
                    reference.used_by(bundle.id());
                    Plan::Done(instance)
                }
                Provided::Factory(_) => {
                    // Reuse the instance cached for this consumer, if any
                    if let Some((instances, counter)) = inner
                        .factory_use
                        .get_mut(&bundle.id())
                        .and_then(|fu| fu.factored.get_mut(reference))
                    {
                        counter.inc();
                        Plan::Done(instances[0].clone())
                    } else {
                        let registration =
                            inner.registrations.get(reference).cloned().ok_or_else(|| {
                                Error::UnknownService(format!("#{}", reference.service_id()))
                            })?;
                        Plan::Create(provided, registration)
                    }
                }
                Provided::Prototype(_) => {
                    let registration =
                        inner.registrations.get(reference).cloned().ok_or_else(|| {
                            Error::UnknownService(format!("#{}", reference.service_id()))
                        })?;
                    Plan::Create(provided, registration)
                }
            }
        };

        match plan {
            Plan::Done(instance) => Ok(instance),
            Plan::Create(provided, registration) => {
                self.create_from_factory(bundle, reference, provided, registration)
            }
        }
    }

    /// Calls a (prototype) service factory outside the registry lock and
    /// stores the result. A lost creation race in `bundle` scope releases
    /// the surplus instance back through the factory.
    fn create_from_factory(
        &self,
        bundle: &Arc<bundle::Bundle>,
        reference: &ServiceReference,
        provided: Provided,
        registration: ServiceRegistration,
    ) -> Result<ServiceObject> {
        let created = match &provided {
            Provided::Factory(factory) => factory.get_service(bundle, &registration),
            Provided::Prototype(factory) => factory.get_service(bundle, &registration),
            Provided::Instance(_) => unreachable!("singletons are not factory-created"),
        };

        let surplus = {
            let mut inner = self.inner.lock().trace_expect("Failed to lock registry");

            let bundle_id = bundle.id();
            let fu = inner
                .factory_use
                .entry(bundle_id)
                .or_insert_with(|| FactoryUse::new(bundle.clone()));

            match &provided {
                Provided::Factory(_) => {
                    if let Some((instances, counter)) = fu.factored.get_mut(reference) {
                        // Another thread created the cached instance first
                        counter.inc();
                        Some(instances[0].clone())
                    } else {
                        let mut counter = UsageCounter::default();
                        counter.inc();
                        fu.factored
                            .insert(reference.clone(), (vec![created.clone()], counter));
                        Self::mark_import(&mut inner, bundle_id, reference);
                        None
                    }
                }
                _ => {
                    let (instances, counter) = fu.factored.entry(reference.clone()).or_default();
                    instances.push(created.clone());
                    counter.inc();
                    Self::mark_import(&mut inner, bundle_id, reference);
                    None
                }
            }
        };

        match surplus {
            Some(cached) => {
                // Release our extra creation, hand back the winner's
                match &provided {
                    Provided::Factory(factory) => factory.unget_service(bundle, &registration),
                    Provided::Prototype(factory) => {
                        factory.unget_service_instance(bundle, &registration, &created);
                        factory.unget_service(bundle, &registration);
                    }
                    Provided::Instance(_) => {}
                }
                Ok(cached)
            }
            None => Ok(created),
        }
    }

    /// Factory-scope imports are marked once; the factory counters do the
    /// per-call accounting.
    fn mark_import(inner: &mut Inner, bundle_id: u64, reference: &ServiceReference) {
        let imports = inner.imports.entry(bundle_id).or_default();
        if !imports.contains_key(reference) {
            let mut counter = UsageCounter::default();
            counter.inc();
            imports.insert(reference.clone(), counter);
            reference.used_by(bundle_id);
        }
    }

    /// Releases one usage of a service by a bundle.
    ///
    /// Prototype releases must name the instance; naming one for any
    /// other scope is a scope violation.
    pub(crate) fn unget_service(
        &self,
        bundle: &Arc<bundle::Bundle>,
        reference: &ServiceReference,
        instance: Option<&ServiceObject>,
    ) -> Result<bool> {
        if reference.is_prototype() {
            let Some(instance) = instance else {
                return Err(Error::ScopeViolation(
                    "a prototype release requires the service instance",
                ));
            };
            self.unget_from_factory(bundle, reference, Some(instance))
        } else if instance.is_some() {
            Err(Error::ScopeViolation(
                "an instance release applies to prototype scope only",
            ))
        } else if reference.is_factory() {
            self.unget_from_factory(bundle, reference, None)
        } else {
            let mut inner = self.inner.lock().trace_expect("Failed to lock registry");
            let Some(imports) = inner.imports.get_mut(&bundle.id()) else {
                return Ok(false);
            };
            let Some(counter) = imports.get_mut(reference) else {
                return Ok(false);
            };
            if !counter.dec() {
                imports.remove(reference);
                if imports.is_empty() {
                    inner.imports.remove(&bundle.id());
                }
            }
            reference.unused_by(bundle.id());
            Ok(true)
        }
    }

    fn unget_from_factory(
        &self,
        bundle: &Arc<bundle::Bundle>,
        reference: &ServiceReference,
        instance: Option<&ServiceObject>,
    ) -> Result<bool> {
        let (provided, registration, released_instance, last) = {
            let mut inner = self.inner.lock().trace_expect("Failed to lock registry");

            let Some(registration) = inner.registrations.get(reference).cloned() else {
                return Ok(false);
            };
            let Some(provided) = inner
                .services
                .get(reference)
                .or_else(|| inner.pending.get(reference))
                .cloned()
            else {
                return Ok(false);
            };
            let Some((instances, counter)) = inner
                .factory_use
                .get_mut(&bundle.id())
                .and_then(|fu| fu.factored.get_mut(reference))
            else {
                warn!(
                    "Releasing an unknown service factory usage: #{}",
                    reference.service_id()
                );
                return Ok(false);
            };

            let released_instance = match instance {
                Some(instance) => {
                    let Some(pos) = instances.iter().position(|o| Arc::ptr_eq(o, instance)) else {
                        warn!(
                            "Releasing an unknown prototype instance of #{}",
                            reference.service_id()
                        );
                        return Ok(false);
                    };
                    Some(instances.remove(pos))
                }
                None => None,
            };

            let last = !counter.dec();
            if last {
                let bundle_id = bundle.id();
                if let Some(fu) = inner.factory_use.get_mut(&bundle_id) {
                    fu.factored.remove(reference);
                    if !fu.is_used() {
                        inner.factory_use.remove(&bundle_id);
                    }
                }
                if let Some(imports) = inner.imports.get_mut(&bundle_id) {
                    imports.remove(reference);
                    if imports.is_empty() {
                        inner.imports.remove(&bundle_id);
                    }
                }
            }

            (provided, registration, released_instance, last)
        };

        // Factory hooks run outside the lock; the per-instance release
        // precedes the per-consumer release
        match &provided {
            Provided::Prototype(factory) => {
                if let Some(instance) = &released_instance {
                    factory.unget_service_instance(bundle, &registration, instance);
                }
                if last {
                    factory.unget_service(bundle, &registration);
                }
            }
            Provided::Factory(factory) => {
                if last {
                    factory.unget_service(bundle, &registration);
                }
            }
            Provided::Instance(_) => {}
        }

        if last {
            reference.unused_by(bundle.id());
        }
        Ok(true)
    }

    /// Finds references by specification and/or filter, in sort order.
    pub(crate) fn find_references(
        &self,
        specification: Option<&str>,
        filter: Option<&Filter>,
    ) -> Vec<ServiceReference> {
        let candidates: Vec<ServiceReference> = {
            let inner = self.inner.lock().trace_expect("Failed to lock registry");
            match specification {
                Some(spec) => inner.specs.get(spec).cloned().unwrap_or_default(),
                None => {
                    let mut all: Vec<_> = inner.services.keys().cloned().collect();
                    all.sort();
                    all
                }
            }
        };

        match filter {
            None => candidates,
            Some(filter) => candidates
                .into_iter()
                .filter(|r| filter.matches(&r.properties()))
                .collect(),
        }
    }

    pub(crate) fn find_reference(
        &self,
        specification: Option<&str>,
        filter: Option<&Filter>,
    ) -> Option<ServiceReference> {
        self.find_references(specification, filter)
            .into_iter()
            .next()
    }

    /// Applies a property update and re-sorts the indices when the sort
    /// key changes. Emits MODIFIED with the previous snapshot.
    fn update_properties(&self, reference: &ServiceReference, update: Properties) -> Result<()> {
        let current = reference.properties();
        let mut filtered = Properties::new();
        for (key, value) in update.iter() {
            if key == keys::OBJECTCLASS || key == keys::SERVICE_ID {
                continue;
            }
            if key == keys::SERVICE_RANKING {
                // A non-coercible ranking drops the key from the update
                if let Some(ranking) = value.coerce_int() {
                    if current.get_int(keys::SERVICE_RANKING) != Some(ranking) {
                        filtered.insert(key, ranking);
                    }
                }
                continue;
            }
            if current.get(key) != Some(value) {
                filtered.insert(key, value.clone());
            }
        }

        if filtered.is_empty() {
            return Ok(());
        }

        let previous = {
            let mut inner = self.inner.lock().trace_expect("Failed to lock registry");

            let hidden = !inner.services.contains_key(reference);
            if hidden && !inner.pending.contains_key(reference) {
                return Err(Error::UnknownService(format!(
                    "#{}",
                    reference.service_id()
                )));
            }

            let previous = reference.apply_update(filtered);
            if reference.needs_sort_update() {
                // Remove under the old key, re-insert under the new one
                if !hidden {
                    inner.remove_from_specs(reference);
                }
                reference.update_sort_key();
                if !hidden {
                    inner.insert_into_specs(reference);
                }
            }
            previous
        };

        self.dispatcher.fire_service_event(&ServiceEvent::new(
            ServiceEventKind::Modified,
            reference.clone(),
            Some(previous),
        ));

        Ok(())
    }

    /// Atomically removes a bundle's services from the indices while
    /// keeping them resolvable for in-flight unregistration.
    pub(crate) fn hide_bundle_services(&self, bundle_id: u64) -> Vec<ServiceReference> {
        let mut inner = self.inner.lock().trace_expect("Failed to lock registry");

        let Some(refs) = inner.bundle_services.remove(&bundle_id) else {
            return Vec::new();
        };

        let mut hidden: Vec<ServiceReference> = refs.into_iter().collect();
        hidden.sort();
        for reference in &hidden {
            if let Some(provided) = inner.services.remove(reference) {
                inner.pending.insert(reference.clone(), provided);
                inner.remove_from_specs(reference);
            }
        }
        hidden
    }

    /// Services registered by a bundle, in sort order.
    pub(crate) fn get_bundle_registered_services(&self, bundle_id: u64) -> Vec<ServiceReference> {
        let inner = self.inner.lock().trace_expect("Failed to lock registry");
        let mut refs: Vec<ServiceReference> = inner
            .bundle_services
            .get(&bundle_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        refs.sort();
        refs
    }

    /// Services a bundle is currently using, in sort order.
    pub(crate) fn get_bundle_imported_services(&self, bundle_id: u64) -> Vec<ServiceReference> {
        let inner = self.inner.lock().trace_expect("Failed to lock registry");
        let mut refs: Vec<ServiceReference> = inner
            .imports
            .get(&bundle_id)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        refs.sort();
        refs
    }

    /// Releases every service usage of a stopping bundle.
    pub(crate) fn release_bundle(&self, bundle: &Arc<bundle::Bundle>) {
        let (singles, factored) = {
            let mut inner = self.inner.lock().trace_expect("Failed to lock registry");

            let singles: Vec<ServiceReference> = inner
                .imports
                .remove(&bundle.id())
                .map(|map| map.into_keys().collect())
                .unwrap_or_default();

            let mut factored = Vec::new();
            if let Some(fu) = inner.factory_use.remove(&bundle.id()) {
                for (reference, (instances, _)) in fu.factored {
                    let provided = inner
                        .services
                        .get(&reference)
                        .or_else(|| inner.pending.get(&reference))
                        .cloned();
                    let registration = inner.registrations.get(&reference).cloned();
                    if let (Some(provided), Some(registration)) = (provided, registration) {
                        factored.push((reference, provided, registration, instances));
                    }
                }
            }
            (singles, factored)
        };

        for reference in singles {
            reference.unused_by(bundle.id());
        }

        for (reference, provided, registration, instances) in factored {
            match &provided {
                Provided::Prototype(factory) => {
                    for instance in &instances {
                        factory.unget_service_instance(bundle, &registration, instance);
                    }
                    factory.unget_service(bundle, &registration);
                }
                Provided::Factory(factory) => factory.unget_service(bundle, &registration),
                Provided::Instance(_) => {}
            }
            reference.unused_by(bundle.id());
        }
    }

    /// Singleton services registered under the listener-hook
    /// specification, for the dispatcher.
    pub(crate) fn hook_services(&self) -> Vec<(ServiceReference, ServiceObject)> {
        let refs = self.find_references(Some(keys::SERVICE_EVENT_LISTENER_HOOK), None);
        let inner = self.inner.lock().trace_expect("Failed to lock registry");
        refs.into_iter()
            .filter_map(|r| match inner.services.get(&r) {
                Some(Provided::Instance(instance)) => Some((r, instance.clone())),
                _ => None,
            })
            .collect()
    }
}
