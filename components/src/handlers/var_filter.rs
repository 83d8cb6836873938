//! Variable-filter dependencies: the LDAP filter is a template
//! interpolated from the component's own properties, re-evaluated on
//! every property change.

use super::*;
use crate::handlers::requires::{AggregateDependency, SimpleDependency};
use gantry_filter::Filter;

pub struct Factory;

impl HandlerFactory for Factory {
    fn get_handlers(&self, context: &Arc<ComponentContext>) -> Result<Vec<Arc<dyn Handler>>> {
        let Some(crate::factory::HandlerConfig::RequiresVarFilter(requirements)) = context
            .factory_context()
            .handler_config(constants::HANDLER_REQUIRES_VAR_FILTER)
        else {
            return Ok(Vec::new());
        };

        let mut handlers: Vec<Arc<dyn Handler>> = Vec::new();
        for (field, requirement) in requirements {
            let template = requirement.extra_filter().unwrap_or_default().to_string();
            let keys = find_keys(&template);
            // The inner handler starts unfiltered; the resolved filter
            // is pushed in below
            let inner_requirement = requirement.clone().without_filter();

            if requirement.is_aggregate() {
                let handler = Arc::new(VarFilterDependency {
                    template,
                    keys,
                    inner: AggregateDependency::new(field, inner_requirement)?,
                });
                handler.apply_template(&context.properties());
                handlers.push(handler);
            } else {
                let handler = Arc::new(VarFilterDependency {
                    template,
                    keys,
                    inner: SimpleDependency::new(field, inner_requirement)?,
                });
                handler.apply_template(&context.properties());
                handlers.push(handler);
            }
        }
        Ok(handlers)
    }
}

/// Lists the `{key}` placeholders of a template.
fn find_keys(template: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            if chars.peek() == Some(&'{') {
                chars.next();
                continue;
            }
            let mut key = String::new();
            for k in chars.by_ref() {
                if k == '}' {
                    break;
                }
                key.push(k);
            }
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
    }
    keys
}

/// Substitutes `{key}` placeholders with property values. A missing key
/// is an error, surfaced to the owner as handler-invalid.
fn resolve(template: &str, properties: &Properties) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(k) => key.push(k),
                        None => {
                            return Err(Error::HandlerConfiguration(format!(
                                "unterminated placeholder in filter template '{template}'"
                            )));
                        }
                    }
                }
                match properties.get(&key) {
                    Some(value) => out.push_str(&value.to_string()),
                    None => {
                        return Err(Error::HandlerConfiguration(format!(
                            "missing filter template value '{key}'"
                        )));
                    }
                }
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Interface the variable-filter wrapper needs from its wrapped
/// dependency handler.
pub(crate) trait VarTarget: Handler {
    fn dependency_core(&self) -> &DependencyCore;
    fn resubscribe_target(&self);
    fn target_bindings(&self) -> Vec<ServiceReference>;
    fn force_departure(&self, reference: &ServiceReference);
}

impl VarTarget for SimpleDependency {
    fn dependency_core(&self) -> &DependencyCore {
        self.core()
    }

    fn resubscribe_target(&self) {
        self.resubscribe();
    }

    fn target_bindings(&self) -> Vec<ServiceReference> {
        self.current_bindings()
    }

    fn force_departure(&self, reference: &ServiceReference) {
        self.on_departure(reference);
    }
}

impl VarTarget for AggregateDependency {
    fn dependency_core(&self) -> &DependencyCore {
        self.core()
    }

    fn resubscribe_target(&self) {
        self.resubscribe();
    }

    fn target_bindings(&self) -> Vec<ServiceReference> {
        self.current_bindings()
    }

    fn force_departure(&self, reference: &ServiceReference) {
        self.on_departure(reference);
    }
}

/// Wraps a simple or aggregate dependency, re-interpreting its filter
/// template against the component properties.
pub struct VarFilterDependency<T: VarTarget> {
    template: String,
    keys: Vec<String>,
    inner: Arc<T>,
}

impl<T: VarTarget> VarFilterDependency<T> {
    /// Re-resolves the template. On a missing key or a parse error the
    /// filter is marked invalid, which invalidates the owning component.
    /// Returns true when the active filter changed.
    fn apply_template(&self, properties: &Properties) -> bool {
        let core = self.inner.dependency_core();

        let parsed = resolve(&self.template, properties).and_then(|text| {
            Filter::parse(&text).map_err(|e| Error::HandlerConfiguration(e.to_string()))
        });

        match parsed {
            Err(e) => {
                warn!(
                    "Invalid filter template for '{}': {e}",
                    core.field()
                );
                core.set_filter(None, false);
                true
            }
            Ok(filter) => {
                let changed = core.filter_string() != filter.as_ref().map(ToString::to_string);
                if changed {
                    core.set_filter(filter, true);
                }
                changed
            }
        }
    }

    /// Re-subscribes with the new filter and emulates a departure for
    /// every binding that no longer matches.
    fn reset(&self) {
        self.inner.resubscribe_target();

        let core = self.inner.dependency_core();
        for reference in self.inner.target_bindings() {
            let keep = core.filter_ok() && core.filter_matches(&reference);
            if !keep {
                self.inner.force_departure(&reference);
            }
        }
    }
}

impl<T: VarTarget + 'static> Handler for VarFilterDependency<T> {
    fn kinds(&self) -> &[HandlerKind] {
        &[HandlerKind::Dependency]
    }

    fn manipulate(&self, instance: &Arc<StoredInstance>) {
        self.inner.manipulate(instance);
    }

    fn start(&self) {
        self.inner.start();
    }

    fn stop(&self) -> Vec<(ServiceObject, ServiceReference)> {
        self.inner.stop()
    }

    fn clear(&self) {
        self.inner.clear();
    }

    fn check_event(&self, event: &ServiceEvent) -> bool {
        self.inner.check_event(event)
    }

    fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    fn on_property_change(&self, name: &str, _old: Option<&Value>, _new: &Value) {
        if !self.keys.iter().any(|k| k == name) {
            return;
        }

        let Some(instance) = self.inner.dependency_core().instance() else {
            return;
        };
        if self.apply_template(&instance.context().properties()) {
            self.reset();
            // A restored filter may re-admit services
            instance.update_bindings();
            instance.check_lifecycle();
        }
    }

    fn as_dependency(&self) -> Option<&dyn DependencyHandler> {
        self.inner.as_dependency()
    }
}
