//! Pluggable component behavior.
//!
//! A handler participates in one instance's lifecycle through the hooks
//! of [`Handler`], every one of which has a default, so a handler only
//! implements what it cares about. Handler factories are services
//! registered under [`constants::SERVICE_HANDLER_FACTORY`] and keyed by
//! the [`constants::PROP_HANDLER_ID`] property; the component core
//! resolves them through the registry when instantiating.

use super::*;

pub mod best;
pub mod broadcast;
pub mod map;
pub mod properties;
pub mod provides;
pub mod requires;
pub mod temporal;
pub mod var_filter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Properties,
    Dependency,
    ServiceProvider,
}

/// One pluggable participant in a component instance's lifecycle.
pub trait Handler: Send + Sync {
    fn kinds(&self) -> &[HandlerKind];

    /// Called once at attach, before the handlers are started.
    fn manipulate(&self, _instance: &Arc<StoredInstance>) {}

    /// Called once after every handler has manipulated the instance.
    fn start(&self) {}

    /// Called once, just after the component has been killed. Dependency
    /// handlers hand back their removed bindings.
    fn stop(&self) -> Vec<(ServiceObject, ServiceReference)> {
        Vec::new()
    }

    /// Called after `stop`, once all handlers stopped; release
    /// everything here.
    fn clear(&self) {}

    fn pre_validate(&self) {}
    fn post_validate(&self) {}
    fn pre_invalidate(&self) {}
    fn post_invalidate(&self) {}

    fn on_controller_change(&self, _name: &str, _value: bool) {}

    fn on_property_change(&self, _name: &str, _old: Option<&Value>, _new: &Value) {}

    /// Whether a service event should be handled at all for the owning
    /// instance; any handler may veto it.
    fn check_event(&self, _event: &ServiceEvent) -> bool {
        true
    }

    /// All handlers must be valid for the component to validate.
    fn is_valid(&self) -> bool {
        true
    }

    fn as_dependency(&self) -> Option<&dyn DependencyHandler> {
        None
    }
}

/// Extra surface of `dependency`-kind handlers.
pub trait DependencyHandler {
    /// The component field this dependency is injected into.
    fn field(&self) -> &str;

    /// The currently bound service references.
    fn bindings(&self) -> Vec<ServiceReference>;

    /// Looks for matching services if nothing is bound yet.
    fn try_binding(&self);
}

/// Builds the handlers backing one component instance.
///
/// Registered as a service object holding an
/// `Arc<dyn HandlerFactory>`.
pub trait HandlerFactory: Send + Sync {
    fn get_handlers(&self, context: &Arc<ComponentContext>) -> Result<Vec<Arc<dyn Handler>>>;
}

/// Registers a handler factory service under its handler ID.
pub fn register_handler_factory(
    context: &BundleContext,
    handler_id: &str,
    factory: Arc<dyn HandlerFactory>,
) -> Result<ServiceRegistration> {
    let object: ServiceObject = Arc::new(factory);
    Ok(context.register_service(
        &[constants::SERVICE_HANDLER_FACTORY],
        object,
        Properties::from([(constants::PROP_HANDLER_ID, handler_id)]),
    )?)
}

/// Registers every built-in handler factory on the given context.
pub fn register_core_handlers(context: &BundleContext) -> Result<Vec<ServiceRegistration>> {
    Ok(vec![
        register_handler_factory(
            context,
            constants::HANDLER_PROPERTIES,
            Arc::new(properties::Factory),
        )?,
        register_handler_factory(
            context,
            constants::HANDLER_PROVIDES,
            Arc::new(provides::Factory),
        )?,
        register_handler_factory(
            context,
            constants::HANDLER_REQUIRES,
            Arc::new(requires::Factory),
        )?,
        register_handler_factory(context, constants::HANDLER_REQUIRES_BEST, Arc::new(best::Factory))?,
        register_handler_factory(context, constants::HANDLER_REQUIRES_MAP, Arc::new(map::Factory))?,
        register_handler_factory(
            context,
            constants::HANDLER_REQUIRES_BROADCAST,
            Arc::new(broadcast::Factory),
        )?,
        register_handler_factory(
            context,
            constants::HANDLER_REQUIRES_VAR_FILTER,
            Arc::new(var_filter::Factory),
        )?,
        register_handler_factory(
            context,
            constants::HANDLER_TEMPORAL,
            Arc::new(temporal::Factory),
        )?,
    ])
}

/// Shared plumbing of the dependency handlers: the injected field, the
/// requirement, the resolved extra filter and the owning instance.
pub(crate) struct DependencyCore {
    field: String,
    requirement: Requirement,
    instance: OnceLock<Arc<StoredInstance>>,
    filter: RwLock<Option<gantry_filter::Filter>>,
    filter_valid: std::sync::atomic::AtomicBool,
}

impl DependencyCore {
    pub fn new(field: &str, requirement: Requirement) -> Self {
        Self {
            field: field.to_string(),
            requirement,
            instance: OnceLock::new(),
            filter: RwLock::new(None),
            filter_valid: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Parses the requirement's extra filter into the active filter.
    pub fn init_filter(&self) -> Result<()> {
        match self.requirement.extra_filter() {
            None => Ok(()),
            Some(text) => {
                let filter = gantry_filter::Filter::parse(text)?;
                self.set_filter(filter, true);
                Ok(())
            }
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn requirement(&self) -> &Requirement {
        &self.requirement
    }

    pub fn attach(&self, instance: &Arc<StoredInstance>) {
        let _ = self.instance.set(instance.clone());
    }

    pub fn instance(&self) -> Option<&Arc<StoredInstance>> {
        self.instance.get()
    }

    pub fn context(&self) -> Option<BundleContext> {
        self.instance.get().map(|i| i.bundle_context().clone())
    }

    pub fn set_filter(&self, filter: Option<gantry_filter::Filter>, valid: bool) {
        *self.filter.write().trace_expect("Failed to lock filter") = filter;
        self.filter_valid
            .store(valid, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn filter_ok(&self) -> bool {
        self.filter_valid.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn filter_string(&self) -> Option<String> {
        self.filter
            .read()
            .trace_expect("Failed to lock filter")
            .as_ref()
            .map(ToString::to_string)
    }

    /// Whether a reference's current properties satisfy the active
    /// extra filter.
    pub fn filter_matches(&self, reference: &ServiceReference) -> bool {
        match &*self.filter.read().trace_expect("Failed to lock filter") {
            None => true,
            Some(filter) => filter.matches(&reference.properties()),
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn ServiceListener>) {
        let Some(context) = self.context() else {
            return;
        };
        let filter = self.filter_string();
        if let Err(e) = context.add_service_listener(
            listener,
            Some(self.requirement.specification()),
            filter.as_deref(),
        ) {
            warn!("Failed to subscribe dependency '{}': {e}", self.field);
        }
    }

    pub fn unsubscribe(&self, listener: &Arc<dyn ServiceListener>) {
        if let Some(context) = self.context() {
            context.remove_service_listener(listener);
        }
    }

    /// First matching reference, best-ranked first.
    pub fn lookup_one(&self) -> Option<ServiceReference> {
        let context = self.context()?;
        let filter = self.filter_string();
        context
            .get_service_reference(Some(self.requirement.specification()), filter.as_deref())
            .ok()
            .flatten()
    }

    /// Every matching reference, in sort order.
    pub fn lookup_all(&self) -> Vec<ServiceReference> {
        let Some(context) = self.context() else {
            return Vec::new();
        };
        let filter = self.filter_string();
        context
            .get_service_references(Some(self.requirement.specification()), filter.as_deref())
            .unwrap_or_default()
    }

    /// Fetches the service object for a reference.
    pub fn get_service(&self, reference: &ServiceReference) -> Option<ServiceObject> {
        let context = self.context()?;
        match context.get_service(reference) {
            Ok(service) => Some(service),
            Err(e) => {
                warn!(
                    "Dependency '{}' failed to fetch service #{}: {e}",
                    self.field,
                    reference.service_id()
                );
                None
            }
        }
    }
}
