use super::*;
use crate::events::{BundleListener, FrameworkStopListener, ServiceListener};
use crate::registry::{Provided, PrototypeServiceFactory, ServiceFactory};
use gantry_filter::Filter;

/// A bundle's handle on the framework.
///
/// Registrations made through a context are tagged with its bundle,
/// usage is accounted against it, and listeners added through it are
/// removed automatically when the bundle stops.
#[derive(Clone)]
pub struct BundleContext {
    framework: Weak<framework::Framework>,
    bundle: Arc<bundle::Bundle>,
}

impl BundleContext {
    pub(crate) fn new(
        framework: Weak<framework::Framework>,
        bundle: Arc<bundle::Bundle>,
    ) -> Self {
        Self { framework, bundle }
    }

    pub fn bundle(&self) -> &Arc<bundle::Bundle> {
        &self.bundle
    }

    pub fn framework(&self) -> Result<Arc<framework::Framework>> {
        self.framework.upgrade().ok_or(Error::FrameworkStopped)
    }

    /// Reads a framework property.
    pub fn get_property(&self, name: &str) -> Option<Value> {
        self.framework().ok()?.get_property(name)
    }

    pub fn install_bundle(
        &self,
        name: &str,
        activator: Option<Arc<dyn bundle::BundleActivator>>,
    ) -> Result<Arc<bundle::Bundle>> {
        self.framework()?.install_bundle(name, activator)
    }

    pub fn get_bundle(&self, bundle_id: u64) -> Option<Arc<bundle::Bundle>> {
        self.framework().ok()?.get_bundle(bundle_id)
    }

    pub fn get_bundles(&self) -> Vec<Arc<bundle::Bundle>> {
        self.framework().map(|f| f.bundles()).unwrap_or_default()
    }

    /// Registers a singleton service under the given specifications.
    pub fn register_service(
        &self,
        specifications: &[&str],
        instance: ServiceObject,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        self.do_register(specifications, properties, Provided::Instance(instance))
    }

    /// Registers a per-consumer (`bundle` scope) service factory.
    pub fn register_service_factory(
        &self,
        specifications: &[&str],
        factory: Arc<dyn ServiceFactory>,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        self.do_register(specifications, properties, Provided::Factory(factory))
    }

    /// Registers a prototype service factory.
    pub fn register_prototype_factory(
        &self,
        specifications: &[&str],
        factory: Arc<dyn PrototypeServiceFactory>,
        properties: Properties,
    ) -> Result<ServiceRegistration> {
        self.do_register(specifications, properties, Provided::Prototype(factory))
    }

    fn do_register(
        &self,
        specifications: &[&str],
        properties: Properties,
        provided: Provided,
    ) -> Result<ServiceRegistration> {
        self.framework()?
            .registry()
            .register(&self.bundle, specifications, properties, provided)
    }

    /// First reference matching the specification and filter, if any.
    pub fn get_service_reference(
        &self,
        specification: Option<&str>,
        filter: Option<&str>,
    ) -> Result<Option<ServiceReference>> {
        let filter = parse_filter(filter)?;
        Ok(self
            .framework()?
            .registry()
            .find_reference(specification, filter.as_ref()))
    }

    /// Every reference matching the specification and filter, in sort
    /// order.
    pub fn get_service_references(
        &self,
        specification: Option<&str>,
        filter: Option<&str>,
    ) -> Result<Vec<ServiceReference>> {
        let filter = parse_filter(filter)?;
        Ok(self
            .framework()?
            .registry()
            .find_references(specification, filter.as_ref()))
    }

    pub fn get_service(&self, reference: &ServiceReference) -> Result<ServiceObject> {
        self.framework()?
            .registry()
            .get_service(&self.bundle, reference)
    }

    pub fn unget_service(&self, reference: &ServiceReference) -> Result<bool> {
        self.framework()?
            .registry()
            .unget_service(&self.bundle, reference, None)
    }

    /// Releases one prototype-produced instance.
    pub fn unget_service_instance(
        &self,
        reference: &ServiceReference,
        instance: &ServiceObject,
    ) -> Result<bool> {
        self.framework()?
            .registry()
            .unget_service(&self.bundle, reference, Some(instance))
    }

    /// Subscribes to service events, optionally narrowed by specification
    /// and filter. Returns false if the listener was already known.
    pub fn add_service_listener(
        &self,
        listener: Arc<dyn ServiceListener>,
        specification: Option<&str>,
        filter: Option<&str>,
    ) -> Result<bool> {
        let filter = parse_filter(filter)?;
        Ok(self.framework()?.dispatcher().add_service_listener(
            self.bundle.id(),
            listener,
            specification.map(str::to_string),
            filter,
        ))
    }

    pub fn remove_service_listener(&self, listener: &Arc<dyn ServiceListener>) -> bool {
        self.framework()
            .map(|f| f.dispatcher().remove_service_listener(listener))
            .unwrap_or(false)
    }

    pub fn add_bundle_listener(&self, listener: Arc<dyn BundleListener>) -> Result<bool> {
        Ok(self
            .framework()?
            .dispatcher()
            .add_bundle_listener(self.bundle.id(), listener))
    }

    pub fn remove_bundle_listener(&self, listener: &Arc<dyn BundleListener>) -> bool {
        self.framework()
            .map(|f| f.dispatcher().remove_bundle_listener(listener))
            .unwrap_or(false)
    }

    pub fn add_framework_stop_listener(
        &self,
        listener: Arc<dyn FrameworkStopListener>,
    ) -> Result<bool> {
        Ok(self
            .framework()?
            .dispatcher()
            .add_framework_listener(self.bundle.id(), listener))
    }

    pub fn remove_framework_stop_listener(
        &self,
        listener: &Arc<dyn FrameworkStopListener>,
    ) -> bool {
        self.framework()
            .map(|f| f.dispatcher().remove_framework_listener(listener))
            .unwrap_or(false)
    }

    /// Services registered by this context's bundle.
    pub fn get_registered_services(&self) -> Result<Vec<ServiceReference>> {
        Ok(self
            .framework()?
            .registry()
            .get_bundle_registered_services(self.bundle.id()))
    }

    /// Services this context's bundle is using.
    pub fn get_imported_services(&self) -> Result<Vec<ServiceReference>> {
        Ok(self
            .framework()?
            .registry()
            .get_bundle_imported_services(self.bundle.id()))
    }
}

impl std::fmt::Debug for BundleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleContext")
            .field("bundle", &self.bundle.id())
            .finish()
    }
}

fn parse_filter(filter: Option<&str>) -> Result<Option<Filter>> {
    match filter {
        None => Ok(None),
        Some(s) => Ok(Filter::parse(s)?),
    }
}
