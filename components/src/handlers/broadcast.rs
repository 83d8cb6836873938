//! Dependency injected as a broadcasting proxy: a call through the
//! proxy reaches every bound service.

use super::*;
use crate::factory::BroadcastConfig;

pub struct Factory;

impl HandlerFactory for Factory {
    fn get_handlers(&self, context: &Arc<ComponentContext>) -> Result<Vec<Arc<dyn Handler>>> {
        let Some(crate::factory::HandlerConfig::RequiresBroadcast(configs)) = context
            .factory_context()
            .handler_config(constants::HANDLER_REQUIRES_BROADCAST)
        else {
            return Ok(Vec::new());
        };

        let mut handlers: Vec<Arc<dyn Handler>> = Vec::new();
        for (field, config) in configs {
            handlers.push(BroadcastDependency::new(field, config.clone())?);
        }
        Ok(handlers)
    }
}

struct BroadcastInner {
    services: Mutex<Vec<(ServiceReference, ServiceObject)>>,
    muffle_exceptions: bool,
    trace_exceptions: bool,
}

/// The injected proxy. Cloneable; all clones share the bound set.
#[derive(Clone)]
pub struct BroadcastProxy {
    inner: Arc<BroadcastInner>,
}

impl BroadcastProxy {
    fn new(muffle_exceptions: bool, trace_exceptions: bool) -> Self {
        Self {
            inner: Arc::new(BroadcastInner {
                services: Mutex::new(Vec::new()),
                muffle_exceptions,
                trace_exceptions,
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .services
            .lock()
            .trace_expect("Failed to lock broadcast services")
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner
            .services
            .lock()
            .trace_expect("Failed to lock broadcast services")
            .len()
    }

    /// Applies `call` to every bound service, in binding order.
    ///
    /// Callee errors are logged when tracing is enabled; when muffling is
    /// off the first error aborts the broadcast and is returned.
    pub fn invoke<R>(
        &self,
        mut call: impl FnMut(&ServiceReference, &ServiceObject) -> std::result::Result<R, String>,
    ) -> std::result::Result<Vec<R>, String> {
        let snapshot: Vec<(ServiceReference, ServiceObject)> = self
            .inner
            .services
            .lock()
            .trace_expect("Failed to lock broadcast services")
            .clone();

        let mut results = Vec::with_capacity(snapshot.len());
        for (reference, service) in &snapshot {
            match call(reference, service) {
                Ok(result) => results.push(result),
                Err(e) => {
                    if self.inner.trace_exceptions {
                        warn!(
                            "Broadcast callee #{} failed: {e}",
                            reference.service_id()
                        );
                    }
                    if !self.inner.muffle_exceptions {
                        return Err(e);
                    }
                }
            }
        }
        Ok(results)
    }

    fn add(&self, reference: &ServiceReference, service: &ServiceObject) -> bool {
        let mut services = self
            .inner
            .services
            .lock()
            .trace_expect("Failed to lock broadcast services");
        if services.iter().any(|(r, _)| r == reference) {
            return false;
        }
        services.push((reference.clone(), service.clone()));
        true
    }

    fn remove(&self, reference: &ServiceReference) -> Option<ServiceObject> {
        let mut services = self
            .inner
            .services
            .lock()
            .trace_expect("Failed to lock broadcast services");
        let pos = services.iter().position(|(r, _)| r == reference)?;
        Some(services.remove(pos).1)
    }
}

/// Holds a set of bound services and injects a [`BroadcastProxy`].
pub struct BroadcastDependency {
    core: DependencyCore,
    proxy: BroadcastProxy,
    me: Weak<BroadcastDependency>,
}

impl BroadcastDependency {
    pub(crate) fn new(field: &str, config: BroadcastConfig) -> Result<Arc<Self>> {
        let core = DependencyCore::new(field, config.requirement);
        core.init_filter()?;
        Ok(Arc::new_cyclic(|me| Self {
            core,
            proxy: BroadcastProxy::new(config.muffle_exceptions, config.trace_exceptions),
            me: me.clone(),
        }))
    }

    fn listener(&self) -> Option<Arc<dyn ServiceListener>> {
        self.me.upgrade().map(|me| me as Arc<dyn ServiceListener>)
    }

    fn on_arrival(&self, reference: &ServiceReference) {
        let Some(service) = self.core.get_service(reference) else {
            return;
        };
        if !self.proxy.add(reference, &service) {
            // Already known: release the extra usage
            if let Some(context) = self.core.context() {
                let _ = context.unget_service(reference);
            }
            return;
        }

        if let Some(instance) = self.core.instance() {
            instance.bind(
                self.core.field(),
                Injection::Broadcast(self.proxy.clone()),
                &service,
                reference,
            );
        }
    }

    fn on_departure(&self, reference: &ServiceReference) {
        let Some(service) = self.proxy.remove(reference) else {
            return;
        };

        let injection = if self.proxy.is_empty() && !self.core.requirement().is_optional() {
            Injection::Cleared
        } else {
            Injection::Broadcast(self.proxy.clone())
        };

        if let Some(instance) = self.core.instance() {
            instance.unbind(self.core.field(), injection, &service, reference);
        }
    }

    fn on_modify(&self, reference: &ServiceReference, old: Option<&Properties>) {
        let known = {
            let services = self
                .proxy
                .inner
                .services
                .lock()
                .trace_expect("Failed to lock broadcast services");
            services
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

impl ServiceListener for BroadcastDependency {
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

impl Handler for BroadcastDependency {
    fn kinds(&self) -> &[HandlerKind] {
        &[HandlerKind::Dependency]
    }

    fn manipulate(&self, instance: &Arc<StoredInstance>) {
        self.core.attach(instance);
        if self.core.requirement().is_optional() {
            // An optional broadcast is always usable; calls just reach
            // nobody while the set is empty
            instance.assign_binding(
                self.core.field(),
                Injection::Broadcast(self.proxy.clone()),
            );
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
        self.proxy
            .inner
            .services
            .lock()
            .trace_expect("Failed to lock broadcast services")
            .iter()
            .map(|(r, s)| (s.clone(), r.clone()))
            .collect()
    }

    fn clear(&self) {
        self.proxy
            .inner
            .services
            .lock()
            .trace_expect("Failed to lock broadcast services")
            .clear();
    }

    fn is_valid(&self) -> bool {
        self.core.requirement().is_optional() || !self.proxy.is_empty()
    }

    fn as_dependency(&self) -> Option<&dyn DependencyHandler> {
        Some(self)
    }
}

impl DependencyHandler for BroadcastDependency {
    fn field(&self) -> &str {
        self.core.field()
    }

    fn bindings(&self) -> Vec<ServiceReference> {
        self.proxy
            .inner
            .services
            .lock()
            .trace_expect("Failed to lock broadcast services")
            .iter()
            .map(|(r, _)| r.clone())
            .collect()
    }

    fn try_binding(&self) {
        if !self.proxy.is_empty() {
            return;
        }
        for reference in self.core.lookup_all() {
            self.on_arrival(&reference);
        }
    }
}
