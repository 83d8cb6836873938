use super::*;
use crate::factory::HandlerConfig;
use gantry_filter::{Criterion, Comparator, Filter};
use gantry_framework::keys;

/// Declarative constraint on a component dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    specification: String,
    aggregate: bool,
    optional: bool,
    immediate_rebind: bool,
    /// Extra filter source text, kept verbatim so variable-filter
    /// handlers can re-template it.
    extra_filter: Option<String>,
}

impl Requirement {
    pub fn new(specification: impl Into<String>) -> Result<Self> {
        let specification = specification.into();
        if specification.is_empty() {
            return Err(Error::InvalidRequirement(
                "no specification given".to_string(),
            ));
        }
        Ok(Self {
            specification,
            aggregate: false,
            optional: false,
            immediate_rebind: false,
            extra_filter: None,
        })
    }

    /// The dependency is a list of services rather than a single one.
    pub fn aggregate(mut self, aggregate: bool) -> Self {
        self.aggregate = aggregate;
        self
    }

    /// The component stays valid with no matching service.
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// On departure, look for a replacement before publishing the
    /// unbind, avoiding an invalidate/validate cycle.
    pub fn immediate_rebind(mut self, immediate_rebind: bool) -> Self {
        self.immediate_rebind = immediate_rebind;
        self
    }

    /// Narrows the dependency with an extra LDAP filter. The string is
    /// validated here; variable-filter handlers may re-interpret it.
    pub fn with_filter(mut self, filter: &str) -> Result<Self> {
        Filter::parse(filter)?;
        self.extra_filter = Some(filter.to_string());
        Ok(self)
    }

    /// Sets the filter without validating it, for templates that only
    /// become valid after substitution.
    pub fn with_filter_template(mut self, template: &str) -> Self {
        self.extra_filter = Some(template.to_string());
        self
    }

    /// Drops the extra filter (variable-filter handlers resolve the
    /// template out-of-band).
    pub fn without_filter(mut self) -> Self {
        self.extra_filter = None;
        self
    }

    pub fn specification(&self) -> &str {
        &self.specification
    }

    pub fn is_aggregate(&self) -> bool {
        self.aggregate
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn is_immediate_rebind(&self) -> bool {
        self.immediate_rebind
    }

    pub fn extra_filter(&self) -> Option<&str> {
        self.extra_filter.as_deref()
    }

    /// The full filter: the specification test joined with the extra
    /// filter.
    pub fn full_filter(&self) -> Result<Filter> {
        let spec_test =
            Criterion::new(keys::OBJECTCLASS, self.specification.as_str(), Comparator::Eq)?;

        let extra = match &self.extra_filter {
            None => None,
            Some(text) => Filter::parse(text)?,
        };

        Ok(Filter::combine(
            [Some(spec_test.into()), extra],
            gantry_filter::Operator::And,
        )
        .unwrap_or_else(|| unreachable!("the specification test is always present")))
    }

    /// Tests a service's properties against this requirement.
    pub fn matches(&self, properties: &Properties) -> bool {
        self.full_filter()
            .map(|filter| filter.matches(properties))
            .unwrap_or(false)
    }
}

/// Immutable description shared by every instance of a factory.
#[derive(Clone)]
pub struct FactoryContext {
    name: String,
    properties: Properties,
    hidden_properties: Properties,
    handler_configs: BTreeMap<String, HandlerConfig>,
}

impl FactoryContext {
    pub(crate) fn new(
        name: String,
        properties: Properties,
        hidden_properties: Properties,
        handler_configs: BTreeMap<String, HandlerConfig>,
    ) -> Self {
        Self {
            name,
            properties,
            hidden_properties,
            handler_configs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn handler_ids(&self) -> impl Iterator<Item = &str> {
        self.handler_configs.keys().map(String::as_str)
    }

    pub fn handler_config(&self, handler_id: &str) -> Option<&HandlerConfig> {
        self.handler_configs.get(handler_id)
    }

    pub(crate) fn hidden_properties(&self) -> &Properties {
        &self.hidden_properties
    }
}

/// Per-instance context: effective properties, hidden properties and a
/// handle back to the owning bundle.
pub struct ComponentContext {
    factory: Arc<FactoryContext>,
    name: String,
    properties: RwLock<Properties>,
    /// Hidden properties may be fetched exactly once.
    hidden_properties: Mutex<Option<Properties>>,
    bundle_context: BundleContext,
}

impl ComponentContext {
    pub(crate) fn new(
        factory: Arc<FactoryContext>,
        name: String,
        overrides: Properties,
        bundle_context: BundleContext,
    ) -> Self {
        let mut properties = factory.properties().clone();
        properties.merge(&overrides);

        let hidden = factory.hidden_properties().clone();

        Self {
            factory,
            name,
            properties: RwLock::new(properties),
            hidden_properties: Mutex::new(Some(hidden)),
            bundle_context,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn factory_name(&self) -> &str {
        self.factory.name()
    }

    pub fn factory_context(&self) -> &Arc<FactoryContext> {
        &self.factory
    }

    pub fn bundle_context(&self) -> &BundleContext {
        &self.bundle_context
    }

    /// A snapshot of the effective public properties.
    pub fn properties(&self) -> Properties {
        self.properties
            .read()
            .trace_expect("Failed to lock component properties")
            .clone()
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        self.properties
            .read()
            .trace_expect("Failed to lock component properties")
            .get(name)
            .cloned()
    }

    /// Takes the hidden properties; subsequent calls return `None`.
    pub fn grab_hidden_properties(&self) -> Option<Properties> {
        self.hidden_properties
            .lock()
            .trace_expect("Failed to lock hidden properties")
            .take()
    }

    /// Sets one property, returning the previous value.
    pub(crate) fn set_property(&self, name: &str, value: Value) -> Option<Value> {
        self.properties
            .write()
            .trace_expect("Failed to lock component properties")
            .insert(name, value)
    }

    /// Overlays a property update (used by erroneous retries).
    pub(crate) fn merge_properties(&self, update: &Properties) {
        self.properties
            .write()
            .trace_expect("Failed to lock component properties")
            .merge(update);
    }
}

impl std::fmt::Debug for ComponentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentContext")
            .field("name", &self.name)
            .field("factory", &self.factory.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_filter_composition() {
        let requirement = Requirement::new("spec.a").expect("Failed to build requirement");
        assert_eq!(
            requirement.full_filter().expect("No filter").to_string(),
            "(objectClass=spec.a)"
        );

        let requirement = Requirement::new("spec.a")
            .expect("Failed to build requirement")
            .with_filter("(mode=fast)")
            .expect("Failed to set filter");
        assert_eq!(
            requirement.full_filter().expect("No filter").to_string(),
            "(&(objectClass=spec.a)(mode=fast))"
        );
    }

    #[test]
    fn requirement_matching() {
        let requirement = Requirement::new("spec.a")
            .expect("Failed to build requirement")
            .with_filter("(mode=fast)")
            .expect("Failed to set filter");

        let mut props = Properties::from([("mode", "fast")]);
        props.insert(
            gantry_framework::keys::OBJECTCLASS,
            Value::from(vec!["spec.a"]),
        );
        assert!(requirement.matches(&props));

        props.insert("mode", "slow");
        assert!(!requirement.matches(&props));
    }

    #[test]
    fn invalid_filter_is_refused() {
        assert!(
            Requirement::new("spec.a")
                .expect("Failed to build requirement")
                .with_filter("(broken")
                .is_err()
        );
    }
}
