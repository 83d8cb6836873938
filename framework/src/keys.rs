//! Reserved service and framework property keys.

/// The list of specifications (strings) provided by a service.
pub const OBJECTCLASS: &str = "objectClass";

/// The service ID, unique and monotonic within a framework instance.
pub const SERVICE_ID: &str = "service.id";

/// The ID of the bundle providing the service.
pub const SERVICE_BUNDLEID: &str = "service.bundleid";

/// The persistent ID of a service.
pub const SERVICE_PID: &str = "service.pid";

/// Integer preference used to sort lookup results. Higher wins; ties go
/// to the older service ID.
pub const SERVICE_RANKING: &str = "service.ranking";

/// The service scope: one of [`SCOPE_SINGLETON`], [`SCOPE_BUNDLE`] or
/// [`SCOPE_PROTOTYPE`].
pub const SERVICE_SCOPE: &str = "service.scope";

pub const SCOPE_SINGLETON: &str = "singleton";
pub const SCOPE_BUNDLE: &str = "bundle";
pub const SCOPE_PROTOTYPE: &str = "prototype";

/// Framework instance identifier, constant for the life of the instance.
pub const FRAMEWORK_UID: &str = "framework.uid";

/// OSGi-standard alias of [`FRAMEWORK_UID`].
pub const OSGI_FRAMEWORK_UUID: &str = "org.osgi.framework.uuid";

/// Specification under which event listener hooks are registered.
pub const SERVICE_EVENT_LISTENER_HOOK: &str = "gantry.hooks.event_listener";
