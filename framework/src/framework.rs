use super::*;
use crate::events::{BundleEvent, BundleEventKind};
use std::sync::atomic::{AtomicBool, Ordering};

/// The framework assembly: registry, dispatcher, bundle table and
/// framework properties.
///
/// The framework itself is bundle 0; its context can be used to register
/// framework-level services.
pub struct Framework {
    registry: Arc<registry::ServiceRegistry>,
    dispatcher: Arc<dispatcher::EventDispatcher>,
    properties: Properties,
    bundles: RwLock<BTreeMap<u64, Arc<bundle::Bundle>>>,
    next_bundle_id: Mutex<u64>,
    stopped: AtomicBool,
}

impl Framework {
    pub fn new(config: config::Config) -> Arc<Self> {
        let dispatcher = Arc::new(dispatcher::EventDispatcher::new());
        let registry = Arc::new(registry::ServiceRegistry::new(dispatcher.clone()));
        dispatcher.set_registry(Arc::downgrade(&registry));

        let mut properties = config.properties;
        let uid = properties
            .get_str(keys::FRAMEWORK_UID)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        properties.insert(keys::FRAMEWORK_UID, uid.as_str());
        properties.insert(keys::OSGI_FRAMEWORK_UUID, uid.as_str());

        let framework = Arc::new_cyclic(|weak: &Weak<Framework>| {
            let framework_bundle = bundle::Bundle::new(0, "gantry.framework", None, weak.clone());
            framework_bundle.set_state(bundle::BundleState::Active);

            Framework {
                registry,
                dispatcher,
                properties,
                bundles: RwLock::new(BTreeMap::from([(0, framework_bundle)])),
                next_bundle_id: Mutex::new(1),
                stopped: AtomicBool::new(false),
            }
        });

        info!("Framework {uid} created");
        framework
    }

    pub(crate) fn registry(&self) -> &Arc<registry::ServiceRegistry> {
        &self.registry
    }

    pub(crate) fn dispatcher(&self) -> &Arc<dispatcher::EventDispatcher> {
        &self.dispatcher
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn get_property(&self, name: &str) -> Option<Value> {
        self.properties.get(name).cloned()
    }

    /// The framework instance identifier.
    pub fn uid(&self) -> &str {
        self.properties
            .get_str(keys::FRAMEWORK_UID)
            .unwrap_or_default()
    }

    /// The framework bundle's own context.
    pub fn context(self: &Arc<Self>) -> context::BundleContext {
        let bundle = self
            .get_bundle(0)
            .trace_expect("The framework bundle is missing");
        context::BundleContext::new(Arc::downgrade(self), bundle)
    }

    pub fn get_bundle(&self, bundle_id: u64) -> Option<Arc<bundle::Bundle>> {
        self.bundles
            .read()
            .trace_expect("Failed to lock bundles")
            .get(&bundle_id)
            .cloned()
    }

    pub fn bundles(&self) -> Vec<Arc<bundle::Bundle>> {
        self.bundles
            .read()
            .trace_expect("Failed to lock bundles")
            .values()
            .cloned()
            .collect()
    }

    /// Installs a bundle with an optional activator. The bundle is not
    /// started.
    pub fn install_bundle(
        self: &Arc<Self>,
        name: &str,
        activator: Option<Arc<dyn bundle::BundleActivator>>,
    ) -> Result<Arc<bundle::Bundle>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::FrameworkStopped);
        }

        let installed = {
            let mut next_id = self
                .next_bundle_id
                .lock()
                .trace_expect("Failed to lock bundle counter");
            let id = *next_id;
            *next_id += 1;

            let installed = bundle::Bundle::new(id, name, activator, Arc::downgrade(self));
            self.bundles
                .write()
                .trace_expect("Failed to lock bundles")
                .insert(id, installed.clone());
            installed
        };

        info!("Installed bundle #{} ({})", installed.id(), name);
        self.fire(BundleEventKind::Installed, &installed);
        Ok(installed)
    }

    fn fire(&self, kind: BundleEventKind, bundle: &Arc<bundle::Bundle>) {
        self.dispatcher
            .fire_bundle_event(&BundleEvent::new(kind, bundle.clone()));
    }

    pub(crate) fn start_bundle(self: &Arc<Self>, bundle: &Arc<bundle::Bundle>) -> Result<()> {
        match bundle.state() {
            bundle::BundleState::Active | bundle::BundleState::Starting => return Ok(()),
            bundle::BundleState::Uninstalled => {
                return Err(Error::BundleLifecycle(format!(
                    "bundle #{} is uninstalled",
                    bundle.id()
                )));
            }
            _ => {}
        }

        bundle.set_state(bundle::BundleState::Starting);
        self.fire(BundleEventKind::Starting, bundle);

        if let Some(activator) = bundle.activator().cloned() {
            if let Err(e) = activator.start(&bundle.context()) {
                bundle.set_state(bundle::BundleState::Resolved);
                return Err(Error::BundleLifecycle(format!(
                    "activator of bundle #{} failed to start: {e}",
                    bundle.id()
                )));
            }
        }

        bundle.set_state(bundle::BundleState::Active);
        self.fire(BundleEventKind::Started, bundle);
        Ok(())
    }

    /// Stops a bundle: activator teardown, two-phase service removal,
    /// release of consumed services, automatic listener removal.
    pub(crate) fn stop_bundle(self: &Arc<Self>, bundle: &Arc<bundle::Bundle>) -> Result<()> {
        if bundle.state() != bundle::BundleState::Active {
            return Ok(());
        }

        bundle.set_state(bundle::BundleState::Stopping);
        self.fire(BundleEventKind::Stopping, bundle);

        if let Some(activator) = bundle.activator().cloned() {
            if let Err(e) = activator.stop(&bundle.context()) {
                warn!("Activator of bundle #{} failed to stop: {e}", bundle.id());
            }
        }

        self.fire(BundleEventKind::StoppingPreclean, bundle);

        // Hide first so new lookups miss, then unregister one by one
        for reference in self.registry.hide_bundle_services(bundle.id()) {
            if let Err(e) = self.registry.unregister(&reference) {
                debug!("Service #{} left early: {e}", reference.service_id());
            }
        }

        self.registry.release_bundle(bundle);
        self.dispatcher.remove_bundle(bundle.id());

        bundle.set_state(bundle::BundleState::Resolved);
        self.fire(BundleEventKind::Stopped, bundle);
        Ok(())
    }

    pub(crate) fn update_bundle(self: &Arc<Self>, bundle: &Arc<bundle::Bundle>) -> Result<()> {
        self.fire(BundleEventKind::UpdateBegin, bundle);

        let was_active = bundle.state() == bundle::BundleState::Active;
        let result = self.stop_bundle(bundle).and_then(|()| {
            if was_active {
                self.start_bundle(bundle)
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => {
                self.fire(BundleEventKind::Updated, bundle);
                Ok(())
            }
            Err(e) => {
                self.fire(BundleEventKind::UpdateFailed, bundle);
                Err(e)
            }
        }
    }

    pub(crate) fn uninstall_bundle(self: &Arc<Self>, bundle: &Arc<bundle::Bundle>) -> Result<()> {
        if bundle.id() == 0 {
            return Err(Error::BundleLifecycle(
                "the framework bundle cannot be uninstalled".to_string(),
            ));
        }

        self.stop_bundle(bundle)?;

        self.bundles
            .write()
            .trace_expect("Failed to lock bundles")
            .remove(&bundle.id());
        bundle.set_state(bundle::BundleState::Uninstalled);

        info!("Uninstalled bundle #{}", bundle.id());
        self.fire(BundleEventKind::Uninstalled, bundle);
        Ok(())
    }

    /// Stops the framework: notifies the framework-stop listeners, stops
    /// bundles in reverse install order, then clears the dispatcher.
    pub fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Framework {} stopping", self.uid());
        self.dispatcher.fire_framework_stopping();

        let mut bundles = self.bundles();
        bundles.reverse();
        for bundle in bundles {
            if bundle.id() == 0 {
                continue;
            }
            if let Err(e) = self.stop_bundle(&bundle) {
                warn!("Error stopping bundle #{}: {e}", bundle.id());
            }
        }

        // The framework bundle goes last
        if let Some(framework_bundle) = self.get_bundle(0) {
            for reference in self.registry.hide_bundle_services(0) {
                if let Err(e) = self.registry.unregister(&reference) {
                    debug!("Service #{} left early: {e}", reference.service_id());
                }
            }
            self.registry.release_bundle(&framework_bundle);
            framework_bundle.set_state(bundle::BundleState::Resolved);
        }

        self.dispatcher.clear();
        info!("Framework {} stopped", self.uid());
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("uid", &self.uid())
            .field("bundles", &self.bundles.read().map(|b| b.len()).unwrap_or(0))
            .finish()
    }
}
