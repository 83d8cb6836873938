//! Well-known specifications and handler identifiers.

/// Specification of the component core service.
pub const SERVICE_COMPONENT_CORE: &str = "gantry.components.core";

/// Specification under which handler factories are registered.
pub const SERVICE_HANDLER_FACTORY: &str = "gantry.components.handler.factory";

/// Service property carrying a handler factory's handler ID.
pub const PROP_HANDLER_ID: &str = "handler.id";

/// Specification of the instantiation waiting list service.
pub const SERVICE_WAITING_LIST: &str = "gantry.components.waiting_list";

// Built-in handler IDs

pub const HANDLER_PROPERTIES: &str = "properties";
pub const HANDLER_PROVIDES: &str = "provides";
pub const HANDLER_REQUIRES: &str = "requires";
pub const HANDLER_REQUIRES_BEST: &str = "requires.best";
pub const HANDLER_REQUIRES_MAP: &str = "requires.map";
pub const HANDLER_REQUIRES_BROADCAST: &str = "requires.broadcast";
pub const HANDLER_REQUIRES_VAR_FILTER: &str = "requires.var_filter";
pub const HANDLER_TEMPORAL: &str = "temporal";
