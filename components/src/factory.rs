use super::*;
use crate::contexts::FactoryContext;
use std::time::Duration;

/// One provided service of a component: its specifications and an
/// optional controller gating publication.
#[derive(Debug, Clone)]
pub struct ProvidesConfig {
    pub specifications: Vec<String>,
    pub controller: Option<String>,
}

/// Map dependency configuration: the property key services are grouped
/// by, and whether a missing key is allowed as the null bucket.
#[derive(Debug, Clone)]
pub struct MapConfig {
    pub requirement: Requirement,
    pub key: String,
    pub allow_none: bool,
}

/// Broadcast dependency configuration.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub requirement: Requirement,
    /// Swallow callee errors instead of surfacing them to the caller.
    pub muffle_exceptions: bool,
    /// Log swallowed callee errors.
    pub trace_exceptions: bool,
}

/// Temporal dependency configuration.
#[derive(Debug, Clone)]
pub struct TemporalConfig {
    pub requirement: Requirement,
    pub timeout: Duration,
}

/// Per-handler configuration attached to a factory, keyed by handler ID.
#[derive(Clone)]
pub enum HandlerConfig {
    Properties,
    Provides(Vec<ProvidesConfig>),
    Requires(BTreeMap<String, Requirement>),
    RequiresBest(BTreeMap<String, Requirement>),
    RequiresMap(BTreeMap<String, MapConfig>),
    RequiresBroadcast(BTreeMap<String, BroadcastConfig>),
    RequiresVarFilter(BTreeMap<String, Requirement>),
    Temporal(BTreeMap<String, TemporalConfig>),
}

type Constructor = Box<dyn Fn() -> Box<dyn Component> + Send + Sync>;

/// A declarative component description: provided services, required
/// dependencies, default properties and a constructor.
pub struct ComponentFactory {
    context: Arc<FactoryContext>,
    constructor: Constructor,
}

impl ComponentFactory {
    pub fn builder(name: impl Into<String>) -> ComponentFactoryBuilder {
        ComponentFactoryBuilder {
            name: name.into(),
            properties: Properties::new(),
            hidden_properties: Properties::new(),
            provides: Vec::new(),
            requires: BTreeMap::new(),
            requires_best: BTreeMap::new(),
            requires_map: BTreeMap::new(),
            requires_broadcast: BTreeMap::new(),
            requires_var_filter: BTreeMap::new(),
            temporal: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    pub fn context(&self) -> &Arc<FactoryContext> {
        &self.context
    }

    pub(crate) fn construct(&self) -> Box<dyn Component> {
        (self.constructor)()
    }
}

impl std::fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentFactory")
            .field("name", &self.name())
            .finish()
    }
}

/// Builder collecting a factory's handler configuration.
pub struct ComponentFactoryBuilder {
    name: String,
    properties: Properties,
    hidden_properties: Properties,
    provides: Vec<ProvidesConfig>,
    requires: BTreeMap<String, Requirement>,
    requires_best: BTreeMap<String, Requirement>,
    requires_map: BTreeMap<String, MapConfig>,
    requires_broadcast: BTreeMap<String, BroadcastConfig>,
    requires_var_filter: BTreeMap<String, Requirement>,
    temporal: BTreeMap<String, TemporalConfig>,
}

impl ComponentFactoryBuilder {
    /// Publishes the component's service object under the given
    /// specifications while the component is valid.
    pub fn provides(mut self, specifications: &[&str]) -> Self {
        self.provides.push(ProvidesConfig {
            specifications: specifications.iter().map(|s| s.to_string()).collect(),
            controller: None,
        });
        self
    }

    /// Like [`Self::provides`], gated by a named controller.
    pub fn provides_controlled(mut self, specifications: &[&str], controller: &str) -> Self {
        self.provides.push(ProvidesConfig {
            specifications: specifications.iter().map(|s| s.to_string()).collect(),
            controller: Some(controller.to_string()),
        });
        self
    }

    /// Simple or aggregate dependency, per the requirement's flags.
    pub fn requires(mut self, field: &str, requirement: Requirement) -> Self {
        self.requires.insert(field.to_string(), requirement);
        self
    }

    /// Simple dependency that rebinds to a strictly better-ranked
    /// service when one appears.
    pub fn requires_best(mut self, field: &str, requirement: Requirement) -> Self {
        self.requires_best.insert(field.to_string(), requirement);
        self
    }

    /// Dependency injected as a map grouped by a service property.
    pub fn requires_map(
        mut self,
        field: &str,
        requirement: Requirement,
        key: &str,
        allow_none: bool,
    ) -> Self {
        self.requires_map.insert(
            field.to_string(),
            MapConfig {
                requirement,
                key: key.to_string(),
                allow_none,
            },
        );
        self
    }

    /// Dependency injected as a broadcasting proxy.
    pub fn requires_broadcast(
        mut self,
        field: &str,
        requirement: Requirement,
        muffle_exceptions: bool,
        trace_exceptions: bool,
    ) -> Self {
        self.requires_broadcast.insert(
            field.to_string(),
            BroadcastConfig {
                requirement,
                muffle_exceptions,
                trace_exceptions,
            },
        );
        self
    }

    /// Simple or aggregate dependency whose filter is templated from the
    /// component's own properties.
    pub fn requires_var_filter(mut self, field: &str, requirement: Requirement) -> Self {
        self.requires_var_filter.insert(field.to_string(), requirement);
        self
    }

    /// Dependency injected as a timeout proxy that rides out service
    /// swaps for up to `timeout`.
    pub fn temporal(mut self, field: &str, requirement: Requirement, timeout: Duration) -> Self {
        self.temporal.insert(
            field.to_string(),
            TemporalConfig {
                requirement,
                timeout,
            },
        );
        self
    }

    pub fn property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Hidden properties never appear in the public property map; an
    /// instance may fetch them exactly once.
    pub fn hidden_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.hidden_properties.insert(key, value);
        self
    }

    pub fn build(
        self,
        constructor: impl Fn() -> Box<dyn Component> + Send + Sync + 'static,
    ) -> ComponentFactory {
        let mut handler_configs = BTreeMap::new();
        handler_configs.insert(
            constants::HANDLER_PROPERTIES.to_string(),
            HandlerConfig::Properties,
        );
        if !self.provides.is_empty() {
            handler_configs.insert(
                constants::HANDLER_PROVIDES.to_string(),
                HandlerConfig::Provides(self.provides),
            );
        }
        if !self.requires.is_empty() {
            handler_configs.insert(
                constants::HANDLER_REQUIRES.to_string(),
                HandlerConfig::Requires(self.requires),
            );
        }
        if !self.requires_best.is_empty() {
            handler_configs.insert(
                constants::HANDLER_REQUIRES_BEST.to_string(),
                HandlerConfig::RequiresBest(self.requires_best),
            );
        }
        if !self.requires_map.is_empty() {
            handler_configs.insert(
                constants::HANDLER_REQUIRES_MAP.to_string(),
                HandlerConfig::RequiresMap(self.requires_map),
            );
        }
        if !self.requires_broadcast.is_empty() {
            handler_configs.insert(
                constants::HANDLER_REQUIRES_BROADCAST.to_string(),
                HandlerConfig::RequiresBroadcast(self.requires_broadcast),
            );
        }
        if !self.requires_var_filter.is_empty() {
            handler_configs.insert(
                constants::HANDLER_REQUIRES_VAR_FILTER.to_string(),
                HandlerConfig::RequiresVarFilter(self.requires_var_filter),
            );
        }
        if !self.temporal.is_empty() {
            handler_configs.insert(
                constants::HANDLER_TEMPORAL.to_string(),
                HandlerConfig::Temporal(self.temporal),
            );
        }

        ComponentFactory {
            context: Arc::new(FactoryContext::new(
                self.name,
                self.properties,
                self.hidden_properties,
                handler_configs,
            )),
            constructor: Box::new(constructor),
        }
    }
}
