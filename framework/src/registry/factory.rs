use super::*;

/// A registered service object.
///
/// Consumers recover the concrete type with
/// [`typed_service`](crate::typed_service); trait-object services are
/// registered as an `Arc<dyn Trait>` inside the `Any`.
pub type ServiceObject = Arc<dyn std::any::Any + Send + Sync>;

/// Produces one service object per consumer bundle (`bundle` scope).
pub trait ServiceFactory: Send + Sync {
    /// Called on the first `get_service` of a consumer bundle; the result
    /// is cached for that bundle.
    fn get_service(&self, bundle: &Arc<bundle::Bundle>, registration: &ServiceRegistration)
    -> ServiceObject;

    /// Called once the consumer bundle has released all its usages.
    fn unget_service(&self, bundle: &Arc<bundle::Bundle>, registration: &ServiceRegistration);
}

/// Produces a fresh service object per `get_service` call (`prototype`
/// scope).
pub trait PrototypeServiceFactory: ServiceFactory {
    /// Called for each released instance, before the per-consumer
    /// [`ServiceFactory::unget_service`] hook.
    fn unget_service_instance(
        &self,
        bundle: &Arc<bundle::Bundle>,
        registration: &ServiceRegistration,
        service: &ServiceObject,
    );
}

/// What a registration provides: a shared instance or a factory.
#[derive(Clone)]
pub enum Provided {
    Instance(ServiceObject),
    Factory(Arc<dyn ServiceFactory>),
    Prototype(Arc<dyn PrototypeServiceFactory>),
}

impl Provided {
    pub fn scope(&self) -> &'static str {
        match self {
            Provided::Instance(_) => keys::SCOPE_SINGLETON,
            Provided::Factory(_) => keys::SCOPE_BUNDLE,
            Provided::Prototype(_) => keys::SCOPE_PROTOTYPE,
        }
    }
}

impl std::fmt::Debug for Provided {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.scope())
    }
}

/// Usage counter for one consumed reference. Never negative.
#[derive(Debug, Default)]
pub(crate) struct UsageCounter {
    count: usize,
}

impl UsageCounter {
    pub fn inc(&mut self) {
        self.count += 1;
    }

    /// Decrements and reports whether the counter is still in use.
    pub fn dec(&mut self) -> bool {
        self.count = self.count.saturating_sub(1);
        self.count > 0
    }

    pub fn is_used(&self) -> bool {
        self.count > 0
    }
}

/// Per-consumer-bundle bookkeeping of factory-produced service objects:
/// one cached instance for `bundle` scope, a list of live instances for
/// `prototype` scope.
pub(crate) struct FactoryUse {
    pub bundle: Arc<bundle::Bundle>,
    pub factored: HashMap<ServiceReference, (Vec<ServiceObject>, UsageCounter)>,
}

impl FactoryUse {
    pub fn new(bundle: Arc<bundle::Bundle>) -> Self {
        Self {
            bundle,
            factored: HashMap::new(),
        }
    }

    pub fn is_used(&self) -> bool {
        !self.factored.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::UsageCounter;

    #[test]
    fn counter_stays_non_negative() {
        let mut counter = UsageCounter::default();
        assert!(!counter.is_used());

        counter.inc();
        counter.inc();
        assert!(counter.is_used());
        assert!(counter.dec());
        assert!(!counter.dec());
        assert!(!counter.dec());
        assert!(!counter.is_used());
    }
}
