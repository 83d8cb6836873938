//! Service publication: registers the component's service object while
//! the component is valid and its controller (if any) is on.

use super::*;
use crate::factory::ProvidesConfig;

pub struct Factory;

impl HandlerFactory for Factory {
    fn get_handlers(&self, context: &Arc<ComponentContext>) -> Result<Vec<Arc<dyn Handler>>> {
        let Some(crate::factory::HandlerConfig::Provides(configs)) = context
            .factory_context()
            .handler_config(constants::HANDLER_PROVIDES)
        else {
            return Ok(Vec::new());
        };

        Ok(configs
            .iter()
            .map(|config| {
                Arc::new(ProvidesHandler {
                    config: config.clone(),
                    instance: OnceLock::new(),
                    state: Mutex::new(ProvideState::default()),
                }) as Arc<dyn Handler>
            })
            .collect())
    }
}

#[derive(Default)]
struct ProvideState {
    registration: Option<ServiceRegistration>,
    validated: bool,
    controller_on: bool,
}

pub struct ProvidesHandler {
    config: ProvidesConfig,
    instance: OnceLock<Arc<StoredInstance>>,
    state: Mutex<ProvideState>,
}

impl ProvidesHandler {
    fn instance(&self) -> Option<&Arc<StoredInstance>> {
        self.instance.get()
    }

    /// Registers the service when the component is validated and the
    /// controller allows it.
    fn register_service(&self) {
        let Some(instance) = self.instance() else {
            return;
        };

        {
            let state = self.state.lock().trace_expect("Failed to lock provider");
            if state.registration.is_some() || !state.validated || !state.controller_on {
                return;
            }
        }

        let Some(service) = instance.with_component(|c| c.service()) else {
            warn!(
                "{}: component provides {:?} but exposes no service object",
                instance.name(),
                self.config.specifications
            );
            return;
        };

        let specifications: Vec<&str> = self
            .config
            .specifications
            .iter()
            .map(String::as_str)
            .collect();
        let properties = instance.context().properties();

        match instance
            .bundle_context()
            .register_service(&specifications, service, properties)
        {
            Err(e) => warn!("{}: failed to provide service: {e}", instance.name()),
            Ok(registration) => {
                let reference = registration.reference().clone();
                self.state
                    .lock()
                    .trace_expect("Failed to lock provider")
                    .registration = Some(registration);
                instance.with_component(|c| c.on_post_registration(&reference));
            }
        }
    }

    fn unregister_service(&self) {
        let registration = self
            .state
            .lock()
            .trace_expect("Failed to lock provider")
            .registration
            .take();

        let Some(registration) = registration else {
            return;
        };
        let reference = registration.reference().clone();
        if let Err(e) = registration.unregister() {
            debug!("Provided service left early: {e}");
        }
        if let Some(instance) = self.instance() {
            instance.with_component(|c| c.on_post_unregistration(&reference));
        }
    }
}

impl Handler for ProvidesHandler {
    fn kinds(&self) -> &[HandlerKind] {
        &[HandlerKind::ServiceProvider]
    }

    fn manipulate(&self, instance: &Arc<StoredInstance>) {
        let _ = self.instance.set(instance.clone());

        // The controller starts on
        self.state
            .lock()
            .trace_expect("Failed to lock provider")
            .controller_on = true;
        if let Some(controller) = &self.config.controller {
            instance.init_controller(controller, true);
        }
    }

    /// The component must not react to its own provided service.
    fn check_event(&self, event: &ServiceEvent) -> bool {
        let state = self.state.lock().trace_expect("Failed to lock provider");
        match &state.registration {
            Some(registration) => registration.reference() != event.reference(),
            None => true,
        }
    }

    fn post_validate(&self) {
        self.state
            .lock()
            .trace_expect("Failed to lock provider")
            .validated = true;
        self.register_service();
    }

    fn pre_invalidate(&self) {
        self.state
            .lock()
            .trace_expect("Failed to lock provider")
            .validated = false;
        self.unregister_service();
    }

    fn on_controller_change(&self, name: &str, value: bool) {
        if self.config.controller.as_deref() != Some(name) {
            return;
        }

        self.state
            .lock()
            .trace_expect("Failed to lock provider")
            .controller_on = value;
        if value {
            self.register_service();
        } else {
            self.unregister_service();
        }
    }

    /// Component property changes flow into the published service.
    fn on_property_change(&self, name: &str, _old: Option<&Value>, new: &Value) {
        let registration = self
            .state
            .lock()
            .trace_expect("Failed to lock provider")
            .registration
            .clone();

        if let Some(registration) = registration {
            let update = Properties::from([(name, new.clone())]);
            if let Err(e) = registration.set_properties(update) {
                debug!("Failed to propagate property '{name}': {e}");
            }
        }
    }

    fn stop(&self) -> Vec<(ServiceObject, ServiceReference)> {
        self.unregister_service();
        Vec::new()
    }

    fn clear(&self) {
        *self.state.lock().trace_expect("Failed to lock provider") = ProvideState::default();
    }
}
