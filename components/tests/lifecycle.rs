//! Component lifecycle scenarios: binding order, controller gating,
//! erroneous retries, aggregate invalidation.

use gantry_components::handlers::register_core_handlers;
use gantry_components::{
    CallbackError, CallbackResult, Component, ComponentContext, ComponentCore, ComponentFactory,
    ComponentState, Injection, Requirement,
};
use gantry_framework::config::Config;
use gantry_framework::{Framework, Properties, ServiceObject, ServiceReference, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Log = Arc<Mutex<Vec<String>>>;

fn setup() -> (Arc<Framework>, Arc<ComponentCore>) {
    let framework = Framework::new(Config::default());
    let context = framework.context();
    register_core_handlers(&context).expect("Failed to register handlers");
    let core = ComponentCore::start(context).expect("Failed to start the core");
    (framework, core)
}

fn provider(framework: &Arc<Framework>, spec: &str, props: Properties) -> ServiceObject {
    let object: ServiceObject = Arc::new(format!("{spec}-provider"));
    framework
        .context()
        .register_service(&[spec], object.clone(), props)
        .expect("Failed to register provider");
    object
}

struct Probe {
    log: Log,
    fail_validation: Arc<AtomicBool>,
}

fn probe_factory(log: Log, fail: Arc<AtomicBool>) -> impl Fn() -> Box<dyn Component> + Send + Sync {
    move || {
        Box::new(Probe {
            log: log.clone(),
            fail_validation: fail.clone(),
        })
    }
}

impl Probe {
    fn push(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }
}

impl Component for Probe {
    fn set_binding(&mut self, field: &str, value: Injection) {
        self.push(format!("set:{field}:{value:?}"));
    }

    fn on_bind(&mut self, _service: &ServiceObject, _reference: &ServiceReference) {
        self.push("bind");
    }

    fn on_unbind(&mut self, _service: &ServiceObject, _reference: &ServiceReference) {
        self.push("unbind");
    }

    fn validate(&mut self, context: &ComponentContext) -> CallbackResult {
        if self.fail_validation.load(Ordering::SeqCst) {
            self.push("validate-failed");
            return Err(CallbackError::Failed("refusing to validate".to_string()));
        }
        if let Some(hidden) = context.grab_hidden_properties() {
            self.push(format!("hidden:{}", hidden.len()));
        }
        self.push("validate");
        Ok(())
    }

    fn invalidate(&mut self, _context: &ComponentContext) -> CallbackResult {
        self.push("invalidate");
        Ok(())
    }

    fn on_property_changed(&mut self, name: &str, _old: Option<&Value>, new: &Value) {
        self.push(format!("prop:{name}={new}"));
    }

    fn service(&self) -> Option<ServiceObject> {
        Some(Arc::new("probe-service".to_string()))
    }
}

fn log_of(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[test]
fn simple_dependency_lifecycle() {
    let (framework, core) = setup();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let fail = Arc::new(AtomicBool::new(false));

    core.register_factory(
        ComponentFactory::builder("probe.factory")
            .requires(
                "dep",
                Requirement::new("svc.a").expect("Bad requirement"),
            )
            .build(probe_factory(log.clone(), fail.clone())),
    )
    .expect("Failed to register factory");

    let instance = core
        .instantiate("probe.factory", "probe.1", Properties::new())
        .expect("Failed to instantiate");

    // No provider yet
    assert_eq!(instance.state(), ComponentState::Invalid);

    let registration = framework
        .context()
        .register_service(
            &["svc.a"],
            Arc::new("a".to_string()) as ServiceObject,
            Properties::new(),
        )
        .expect("Failed to register provider");
    assert_eq!(instance.state(), ComponentState::Valid);

    // Field assignment and bind precede the validation
    let entries = log_of(&log);
    let set_pos = entries.iter().position(|e| e.starts_with("set:dep")).unwrap();
    let bind_pos = entries.iter().position(|e| e == "bind").unwrap();
    let validate_pos = entries.iter().position(|e| e == "validate").unwrap();
    assert!(set_pos < bind_pos && bind_pos < validate_pos);

    // Losing the provider invalidates before the unbind callback runs
    registration.unregister().expect("Failed to unregister");
    assert_eq!(instance.state(), ComponentState::Invalid);

    let entries = log_of(&log);
    let invalidate_pos = entries.iter().position(|e| e == "invalidate").unwrap();
    let unbind_pos = entries.iter().position(|e| e == "unbind").unwrap();
    assert!(invalidate_pos < unbind_pos);
}

#[test]
fn optional_dependency_validates_immediately() {
    let (_framework, core) = setup();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let fail = Arc::new(AtomicBool::new(false));

    core.register_factory(
        ComponentFactory::builder("probe.optional")
            .requires(
                "dep",
                Requirement::new("svc.missing")
                    .expect("Bad requirement")
                    .optional(true),
            )
            .build(probe_factory(log.clone(), fail.clone())),
    )
    .expect("Failed to register factory");

    let instance = core
        .instantiate("probe.optional", "probe.opt", Properties::new())
        .expect("Failed to instantiate");
    assert_eq!(instance.state(), ComponentState::Valid);
}

#[test]
fn provides_with_controller_gating() {
    let (framework, core) = setup();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let fail = Arc::new(AtomicBool::new(false));

    core.register_factory(
        ComponentFactory::builder("probe.provider")
            .provides_controlled(&["probe.svc"], "gate")
            .property("flavour", "plain")
            .build(probe_factory(log.clone(), fail.clone())),
    )
    .expect("Failed to register factory");

    let instance = core
        .instantiate("probe.provider", "probe.p", Properties::new())
        .expect("Failed to instantiate");
    assert_eq!(instance.state(), ComponentState::Valid);

    let context = framework.context();
    let found = context
        .get_service_reference(Some("probe.svc"), None)
        .expect("Lookup failed");
    let reference = found.expect("The valid component must publish its service");
    assert_eq!(
        reference.property("flavour"),
        Some(Value::from("plain")),
        "Component properties flow into the published service"
    );

    // Controller off: the service goes away without invalidation
    instance.set_controller_state("gate", false);
    assert_eq!(instance.state(), ComponentState::Valid);
    assert!(
        context
            .get_service_reference(Some("probe.svc"), None)
            .expect("Lookup failed")
            .is_none()
    );

    // Controller back on: published again
    instance.set_controller_state("gate", true);
    assert!(
        context
            .get_service_reference(Some("probe.svc"), None)
            .expect("Lookup failed")
            .is_some()
    );

    // Killing unregisters for good
    core.kill("probe.p").expect("Failed to kill");
    assert!(
        context
            .get_service_reference(Some("probe.svc"), None)
            .expect("Lookup failed")
            .is_none()
    );
}

#[test]
fn component_property_updates_republish() {
    let (framework, core) = setup();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let fail = Arc::new(AtomicBool::new(false));

    core.register_factory(
        ComponentFactory::builder("probe.props")
            .provides(&["probe.props.svc"])
            .property("level", 1)
            .build(probe_factory(log.clone(), fail.clone())),
    )
    .expect("Failed to register factory");

    let instance = core
        .instantiate("probe.props", "probe.pp", Properties::new())
        .expect("Failed to instantiate");

    instance.set_property("level", 2);

    let reference = framework
        .context()
        .get_service_reference(Some("probe.props.svc"), None)
        .expect("Lookup failed")
        .expect("No service");
    assert_eq!(reference.property("level"), Some(Value::from(2)));

    // The component itself heard about it too
    assert!(log_of(&log).contains(&"prop:level=2".to_string()));
}

#[test]
fn erroneous_until_retried() {
    let (framework, core) = setup();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let fail = Arc::new(AtomicBool::new(true));

    provider(&framework, "svc.err", Properties::new());

    core.register_factory(
        ComponentFactory::builder("probe.err")
            .requires("dep", Requirement::new("svc.err").expect("Bad requirement"))
            .build(probe_factory(log.clone(), fail.clone())),
    )
    .expect("Failed to register factory");

    let instance = core
        .instantiate("probe.err", "probe.e", Properties::new())
        .expect("Failed to instantiate");
    assert_eq!(instance.state(), ComponentState::Erroneous);
    assert!(instance.error_trace().is_some());

    // New services never validate an erroneous component
    provider(&framework, "svc.err", Properties::new());
    assert_eq!(instance.state(), ComponentState::Erroneous);

    // An explicit retry does
    fail.store(false, Ordering::SeqCst);
    let state = core
        .retry_erroneous("probe.e", Some(&Properties::from([("fixed", true)])))
        .expect("Failed to retry");
    assert_eq!(state, ComponentState::Valid);
    assert!(instance.error_trace().is_none());
    assert_eq!(instance.context().property("fixed"), Some(Value::from(true)));
}

#[test]
fn killed_is_terminal() {
    let (framework, core) = setup();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let fail = Arc::new(AtomicBool::new(false));

    core.register_factory(
        ComponentFactory::builder("probe.kill")
            .requires("dep", Requirement::new("svc.k").expect("Bad requirement"))
            .build(probe_factory(log.clone(), fail.clone())),
    )
    .expect("Failed to register factory");

    provider(&framework, "svc.k", Properties::new());
    let instance = core
        .instantiate("probe.kill", "probe.k", Properties::new())
        .expect("Failed to instantiate");
    assert_eq!(instance.state(), ComponentState::Valid);

    core.kill("probe.k").expect("Failed to kill");
    assert_eq!(instance.state(), ComponentState::Killed);

    // Nothing brings it back
    provider(&framework, "svc.k", Properties::new());
    assert_eq!(instance.state(), ComponentState::Killed);
    assert_eq!(instance.retry_erroneous(None), ComponentState::Killed);

    // And the core has forgotten the name
    assert!(core.kill("probe.k").is_err());
}

/// Hidden properties stay out of the public map and can be fetched
/// exactly once.
#[test]
fn hidden_properties_fetched_once() {
    let (framework, core) = setup();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let fail = Arc::new(AtomicBool::new(false));

    core.register_factory(
        ComponentFactory::builder("probe.hidden")
            .requires("dep", Requirement::new("svc.h").expect("Bad requirement"))
            .property("visible", 1)
            .hidden_property("secret", 42)
            .build(probe_factory(log.clone(), fail.clone())),
    )
    .expect("Failed to register factory");

    let provider_reg = framework
        .context()
        .register_service(
            &["svc.h"],
            Arc::new(()) as ServiceObject,
            Properties::new(),
        )
        .expect("Failed to register provider");

    let instance = core
        .instantiate("probe.hidden", "probe.h", Properties::new())
        .expect("Failed to instantiate");
    assert_eq!(instance.state(), ComponentState::Valid);

    // The hidden key never shows in the public properties
    assert!(instance.context().property("secret").is_none());
    assert_eq!(instance.context().property("visible"), Some(Value::from(1)));

    // Cycle through invalidation and a fresh validation
    provider_reg.unregister().expect("Failed to unregister");
    assert_eq!(instance.state(), ComponentState::Invalid);
    framework
        .context()
        .register_service(&["svc.h"], Arc::new(()) as ServiceObject, Properties::new())
        .expect("Failed to register provider");
    assert_eq!(instance.state(), ComponentState::Valid);

    // The hidden map was handed out exactly once
    let hidden_entries = log_of(&log)
        .iter()
        .filter(|e| e.starts_with("hidden:"))
        .count();
    assert_eq!(hidden_entries, 1);
}

struct Saboteur;

impl Component for Saboteur {
    fn validate(&mut self, _context: &ComponentContext) -> CallbackResult {
        Err(CallbackError::FrameworkStop {
            message: "taking everything down".to_string(),
            stop_framework: true,
        })
    }
}

/// A framework-stop error from a validation callback kills the
/// component and stops the framework.
#[test]
fn framework_stop_request_kills_and_stops() {
    let (framework, core) = setup();

    core.register_factory(
        ComponentFactory::builder("probe.saboteur").build(|| Box::new(Saboteur)),
    )
    .expect("Failed to register factory");

    let instance = core
        .instantiate("probe.saboteur", "probe.s", Properties::new())
        .expect("Failed to instantiate");

    assert_eq!(instance.state(), ComponentState::Killed);
    assert!(core.get_instance("probe.s").is_none());
    assert!(framework.is_stopped());
}

/// S6: an aggregate dependency only invalidates when its last provider
/// leaves, and does so before that provider's unbind callback.
#[test]
fn aggregate_invalidation() {
    let (framework, core) = setup();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let fail = Arc::new(AtomicBool::new(false));

    core.register_factory(
        ComponentFactory::builder("probe.aggregate")
            .requires(
                "deps",
                Requirement::new("A").expect("Bad requirement").aggregate(true),
            )
            .build(probe_factory(log.clone(), fail.clone())),
    )
    .expect("Failed to register factory");

    let p1 = framework
        .context()
        .register_service(
            &["A"],
            Arc::new("p1".to_string()) as ServiceObject,
            Properties::new(),
        )
        .expect("register p1");
    let p2 = framework
        .context()
        .register_service(
            &["A"],
            Arc::new("p2".to_string()) as ServiceObject,
            Properties::new(),
        )
        .expect("register p2");

    let instance = core
        .instantiate("probe.aggregate", "probe.agg", Properties::new())
        .expect("Failed to instantiate");
    assert_eq!(instance.state(), ComponentState::Valid);
    assert!(log_of(&log).contains(&"set:deps:Services(2)".to_string()));

    // Losing one of two providers keeps the component valid
    p1.unregister().expect("unregister p1");
    assert_eq!(instance.state(), ComponentState::Valid);
    assert!(log_of(&log).contains(&"set:deps:Services(1)".to_string()));

    // Losing the last one invalidates, before p2's unbind callback
    p2.unregister().expect("unregister p2");
    assert_eq!(instance.state(), ComponentState::Invalid);

    let entries = log_of(&log);
    let invalidate_pos = entries.iter().rposition(|e| e == "invalidate").unwrap();
    let unbind_pos = entries.iter().rposition(|e| e == "unbind").unwrap();
    assert!(invalidate_pos < unbind_pos);
}
