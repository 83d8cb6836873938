//! Property injection: seeds the component with its effective
//! properties and relays later changes to it.

use super::*;

pub struct Factory;

impl HandlerFactory for Factory {
    fn get_handlers(&self, context: &Arc<ComponentContext>) -> Result<Vec<Arc<dyn Handler>>> {
        match context
            .factory_context()
            .handler_config(constants::HANDLER_PROPERTIES)
        {
            Some(crate::factory::HandlerConfig::Properties) => {
                Ok(vec![Arc::new(PropertiesHandler {
                    instance: OnceLock::new(),
                }) as Arc<dyn Handler>])
            }
            _ => Ok(Vec::new()),
        }
    }
}

pub struct PropertiesHandler {
    instance: OnceLock<Arc<StoredInstance>>,
}

impl Handler for PropertiesHandler {
    fn kinds(&self) -> &[HandlerKind] {
        &[HandlerKind::Properties]
    }

    fn manipulate(&self, instance: &Arc<StoredInstance>) {
        let _ = self.instance.set(instance.clone());

        // Seed the component with its initial properties
        let properties = instance.context().properties();
        instance.with_component(|component| {
            for (name, value) in properties.iter() {
                component.on_property_changed(name, None, value);
            }
        });
    }

    fn on_property_change(&self, name: &str, old: Option<&Value>, new: &Value) {
        if let Some(instance) = self.instance.get() {
            instance.with_component(|component| component.on_property_changed(name, old, new));
        }
    }
}
