use super::*;
use crate::handlers::broadcast::BroadcastProxy;
use crate::handlers::temporal::TemporalProxy;
use thiserror::Error;

/// Failure of a component lifecycle callback.
///
/// Callback failures are values, not panics: a failed validation moves
/// the component to the erroneous state, and the framework-stop variant
/// kills the component and may take the whole framework down with it.
#[derive(Error, Debug)]
pub enum CallbackError {
    #[error("{0}")]
    Failed(String),

    #[error("Framework stop requested: {message}")]
    FrameworkStop { message: String, stop_framework: bool },
}

pub type CallbackResult = std::result::Result<(), CallbackError>;

/// A value injected into a component field by a dependency handler.
#[derive(Clone)]
pub enum Injection {
    /// Nothing bound (optional dependency, or unbound during teardown).
    Cleared,
    /// A single service object.
    Service(ServiceObject),
    /// An ordered list of service objects (aggregate dependency).
    Services(Vec<ServiceObject>),
    /// One service per property-key bucket; `None` is the null-key
    /// bucket, allowed only when configured.
    ServiceMap(BTreeMap<Option<String>, ServiceObject>),
    /// A list of services per property-key bucket.
    ServiceMultiMap(BTreeMap<Option<String>, Vec<ServiceObject>>),
    /// A proxy fanning calls out to every bound service.
    Broadcast(BroadcastProxy),
    /// A proxy that blocks up to a timeout waiting for a service.
    Temporal(TemporalProxy),
}

impl std::fmt::Debug for Injection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Injection::Cleared => f.write_str("Cleared"),
            Injection::Service(_) => f.write_str("Service"),
            Injection::Services(v) => write!(f, "Services({})", v.len()),
            Injection::ServiceMap(m) => write!(f, "ServiceMap({})", m.len()),
            Injection::ServiceMultiMap(m) => write!(f, "ServiceMultiMap({})", m.len()),
            Injection::Broadcast(_) => f.write_str("Broadcast"),
            Injection::Temporal(_) => f.write_str("Temporal"),
        }
    }
}

/// A user component, driven by the instance manager through typed hooks.
///
/// Every hook has a default so components implement only what they care
/// about. Field assignment (`set_binding`) always precedes the bind
/// callbacks; on unbind the callbacks run first and the field is
/// reassigned afterwards.
pub trait Component: Send {
    /// A dependency field changed value.
    fn set_binding(&mut self, _field: &str, _value: Injection) {}

    /// Generic bind callback, fired after the field assignment.
    fn on_bind(&mut self, _service: &ServiceObject, _reference: &ServiceReference) {}

    /// Per-field bind callback, fired after the generic one.
    fn on_bind_field(
        &mut self,
        _field: &str,
        _service: &ServiceObject,
        _reference: &ServiceReference,
    ) {
    }

    /// Per-field update callback: the properties of a bound service
    /// changed.
    fn on_update_field(
        &mut self,
        _field: &str,
        _service: &ServiceObject,
        _reference: &ServiceReference,
        _old_properties: &Properties,
    ) {
    }

    /// Generic update callback, fired after the per-field one.
    fn on_update(
        &mut self,
        _service: &ServiceObject,
        _reference: &ServiceReference,
        _old_properties: &Properties,
    ) {
    }

    /// Per-field unbind callback, fired before the generic one.
    fn on_unbind_field(
        &mut self,
        _field: &str,
        _service: &ServiceObject,
        _reference: &ServiceReference,
    ) {
    }

    fn on_unbind(&mut self, _service: &ServiceObject, _reference: &ServiceReference) {}

    /// All requirements are satisfied; make the component live.
    fn validate(&mut self, _context: &ComponentContext) -> CallbackResult {
        Ok(())
    }

    /// The component is going down; release what `validate` acquired.
    fn invalidate(&mut self, _context: &ComponentContext) -> CallbackResult {
        Ok(())
    }

    /// A component property changed.
    fn on_property_changed(&mut self, _name: &str, _old: Option<&Value>, _new: &Value) {}

    /// The provided service has just been registered.
    fn on_post_registration(&mut self, _reference: &ServiceReference) {}

    /// The provided service has just been unregistered.
    fn on_post_unregistration(&mut self, _reference: &ServiceReference) {}

    /// The object published on this component's behalf while it is
    /// valid. Required when the factory declares provided specifications.
    fn service(&self) -> Option<ServiceObject> {
        None
    }
}
