//! Dependency handler behaviors: best-ranked reselection, map buckets,
//! broadcast fan-out and variable filters.

use gantry_components::handlers::broadcast::BroadcastProxy;
use gantry_components::handlers::register_core_handlers;
use gantry_components::{
    Component, ComponentCore, ComponentFactory, ComponentState, Injection, Requirement,
};
use gantry_framework::config::Config;
use gantry_framework::{
    Framework, Properties, ServiceObject, ServiceRegistration, Value, keys,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

type Slot<T> = Arc<Mutex<Option<T>>>;

fn setup() -> (Arc<Framework>, Arc<ComponentCore>) {
    let framework = Framework::new(Config::default());
    let context = framework.context();
    register_core_handlers(&context).expect("Failed to register handlers");
    let core = ComponentCore::start(context).expect("Failed to start the core");
    (framework, core)
}

fn register(
    framework: &Arc<Framework>,
    spec: &str,
    text: &str,
    props: Properties,
) -> ServiceRegistration {
    framework
        .context()
        .register_service(&[spec], Arc::new(text.to_string()) as ServiceObject, props)
        .expect("Failed to register provider")
}

fn text_of(service: &ServiceObject) -> String {
    service.downcast_ref::<String>().cloned().unwrap_or_default()
}

struct Sink {
    latest: Slot<Injection>,
}

impl Component for Sink {
    fn set_binding(&mut self, _field: &str, value: Injection) {
        *self.latest.lock().unwrap() = Some(value);
    }
}

fn latest_service(slot: &Slot<Injection>) -> Option<String> {
    match slot.lock().unwrap().as_ref() {
        Some(Injection::Service(svc)) => Some(text_of(svc)),
        _ => None,
    }
}

#[test]
fn best_dependency_reselects_on_ranking() {
    let (framework, core) = setup();
    let slot: Slot<Injection> = Arc::new(Mutex::new(None));

    let factory_slot = slot.clone();
    core.register_factory(
        ComponentFactory::builder("best.factory")
            .requires_best("dep", Requirement::new("B").expect("Bad requirement"))
            .build(move || {
                Box::new(Sink {
                    latest: factory_slot.clone(),
                })
            }),
    )
    .expect("Failed to register factory");

    register(
        &framework,
        "B",
        "low",
        Properties::from([(keys::SERVICE_RANKING, Value::from(1))]),
    );
    let instance = core
        .instantiate("best.factory", "best.1", Properties::new())
        .expect("Failed to instantiate");
    assert_eq!(instance.state(), ComponentState::Valid);
    assert_eq!(latest_service(&slot).as_deref(), Some("low"));

    // A strictly better-ranked service takes over
    register(
        &framework,
        "B",
        "high",
        Properties::from([(keys::SERVICE_RANKING, Value::from(10))]),
    );
    assert_eq!(instance.state(), ComponentState::Valid);
    assert_eq!(latest_service(&slot).as_deref(), Some("high"));

    // An equal or worse ranking does not
    register(
        &framework,
        "B",
        "same",
        Properties::from([(keys::SERVICE_RANKING, Value::from(10))]),
    );
    assert_eq!(latest_service(&slot).as_deref(), Some("high"));
}

#[test]
fn map_dependency_groups_by_key() {
    let (framework, core) = setup();
    let slot: Slot<Injection> = Arc::new(Mutex::new(None));

    let factory_slot = slot.clone();
    core.register_factory(
        ComponentFactory::builder("map.factory")
            .requires_map(
                "dep",
                Requirement::new("M").expect("Bad requirement"),
                "lane",
                false,
            )
            .build(move || {
                Box::new(Sink {
                    latest: factory_slot.clone(),
                })
            }),
    )
    .expect("Failed to register factory");

    let fast = register(
        &framework,
        "M",
        "fast-service",
        Properties::from([("lane", "fast")]),
    );
    register(
        &framework,
        "M",
        "slow-service",
        Properties::from([("lane", "slow")]),
    );
    // No key and no null bucket allowed: ignored
    register(&framework, "M", "keyless", Properties::new());

    let instance = core
        .instantiate("map.factory", "map.1", Properties::new())
        .expect("Failed to instantiate");
    assert_eq!(instance.state(), ComponentState::Valid);

    let buckets: BTreeMap<Option<String>, String> = match slot.lock().unwrap().as_ref() {
        Some(Injection::ServiceMap(map)) => map
            .iter()
            .map(|(k, v)| (k.clone(), text_of(v)))
            .collect(),
        other => panic!("Expected a service map, got {other:?}"),
    };
    assert_eq!(buckets.len(), 2);
    assert_eq!(
        buckets.get(&Some("fast".to_string())).map(String::as_str),
        Some("fast-service")
    );
    assert_eq!(
        buckets.get(&Some("slow".to_string())).map(String::as_str),
        Some("slow-service")
    );

    // A key change migrates the service between buckets
    fast.set_properties(Properties::from([("lane", "express")]))
        .expect("Failed to update");
    let buckets: Vec<Option<String>> = match slot.lock().unwrap().as_ref() {
        Some(Injection::ServiceMap(map)) => map.keys().cloned().collect(),
        other => panic!("Expected a service map, got {other:?}"),
    };
    assert!(buckets.contains(&Some("express".to_string())));
    assert!(!buckets.contains(&Some("fast".to_string())));
}

#[test]
fn broadcast_reaches_every_bound_service() {
    let (framework, core) = setup();
    let slot: Slot<Injection> = Arc::new(Mutex::new(None));

    let factory_slot = slot.clone();
    core.register_factory(
        ComponentFactory::builder("cast.factory")
            .requires_broadcast(
                "dep",
                Requirement::new("C").expect("Bad requirement").optional(true),
                true,
                false,
            )
            .build(move || {
                Box::new(Sink {
                    latest: factory_slot.clone(),
                })
            }),
    )
    .expect("Failed to register factory");

    let instance = core
        .instantiate("cast.factory", "cast.1", Properties::new())
        .expect("Failed to instantiate");
    assert_eq!(instance.state(), ComponentState::Valid);

    let proxy: BroadcastProxy = match slot.lock().unwrap().as_ref() {
        Some(Injection::Broadcast(proxy)) => proxy.clone(),
        other => panic!("Expected a broadcast proxy, got {other:?}"),
    };

    // Empty set: a broadcast reaches nobody but succeeds
    let results = proxy
        .invoke(|_, svc| Ok::<_, String>(text_of(svc)))
        .expect("Broadcast failed");
    assert!(results.is_empty());

    register(&framework, "C", "first", Properties::new());
    register(&framework, "C", "second", Properties::new());

    let results = proxy
        .invoke(|_, svc| Ok::<_, String>(text_of(svc)))
        .expect("Broadcast failed");
    assert_eq!(results, vec!["first".to_string(), "second".to_string()]);

    // Muffled errors do not stop the fan-out
    let results = proxy
        .invoke(|_, svc| {
            let text = text_of(svc);
            if text == "first" {
                Err("boom".to_string())
            } else {
                Ok(text)
            }
        })
        .expect("Muffled broadcast failed");
    assert_eq!(results, vec!["second".to_string()]);
}

#[test]
fn var_filter_follows_component_properties() {
    let (framework, core) = setup();
    let slot: Slot<Injection> = Arc::new(Mutex::new(None));

    let factory_slot = slot.clone();
    core.register_factory(
        ComponentFactory::builder("var.factory")
            .requires_var_filter(
                "dep",
                Requirement::new("V")
                    .expect("Bad requirement")
                    .with_filter_template("(lane={lane})"),
            )
            .property("lane", "fast")
            .build(move || {
                Box::new(Sink {
                    latest: factory_slot.clone(),
                })
            }),
    )
    .expect("Failed to register factory");

    register(
        &framework,
        "V",
        "fast-service",
        Properties::from([("lane", "fast")]),
    );
    register(
        &framework,
        "V",
        "slow-service",
        Properties::from([("lane", "slow")]),
    );

    let instance = core
        .instantiate("var.factory", "var.1", Properties::new())
        .expect("Failed to instantiate");
    assert_eq!(instance.state(), ComponentState::Valid);
    assert_eq!(latest_service(&slot).as_deref(), Some("fast-service"));

    // Retargeting the filter swaps the binding
    instance.set_property("lane", "slow");
    assert_eq!(instance.state(), ComponentState::Valid);
    assert_eq!(latest_service(&slot).as_deref(), Some("slow-service"));

    // A lane nobody serves invalidates the component
    instance.set_property("lane", "empty");
    assert_eq!(instance.state(), ComponentState::Invalid);
}
