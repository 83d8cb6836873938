//! Temporal dependency scenarios: grace periods, transparent
//! reconnection and timeouts.

use gantry_components::handlers::register_core_handlers;
use gantry_components::handlers::temporal::{TemporalError, TemporalProxy};
use gantry_components::{
    CallbackResult, Component, ComponentContext, ComponentCore, ComponentFactory, ComponentState,
    Injection, Requirement,
};
use gantry_framework::config::Config;
use gantry_framework::{Framework, Properties, ServiceObject};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Log = Arc<Mutex<Vec<String>>>;
type ProxySlot = Arc<Mutex<Option<TemporalProxy>>>;

struct TemporalProbe {
    log: Log,
    proxy: ProxySlot,
}

impl Component for TemporalProbe {
    fn set_binding(&mut self, _field: &str, value: Injection) {
        if let Injection::Temporal(proxy) = value {
            *self.proxy.lock().unwrap() = Some(proxy);
        }
    }

    fn validate(&mut self, _context: &ComponentContext) -> CallbackResult {
        self.log.lock().unwrap().push("validate".to_string());
        Ok(())
    }

    fn invalidate(&mut self, _context: &ComponentContext) -> CallbackResult {
        self.log.lock().unwrap().push("invalidate".to_string());
        Ok(())
    }
}

fn setup(
    timeout: Duration,
) -> (
    Arc<Framework>,
    Arc<ComponentCore>,
    Arc<gantry_components::StoredInstance>,
    Log,
    ProxySlot,
) {
    let framework = Framework::new(Config::default());
    let context = framework.context();
    register_core_handlers(&context).expect("Failed to register handlers");
    let core = ComponentCore::start(context).expect("Failed to start the core");

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let proxy: ProxySlot = Arc::new(Mutex::new(None));

    let factory_log = log.clone();
    let factory_proxy = proxy.clone();
    core.register_factory(
        ComponentFactory::builder("temporal.factory")
            .temporal(
                "t",
                Requirement::new("T").expect("Bad requirement"),
                timeout,
            )
            .build(move || {
                Box::new(TemporalProbe {
                    log: factory_log.clone(),
                    proxy: factory_proxy.clone(),
                })
            }),
    )
    .expect("Failed to register factory");

    let instance = core
        .instantiate("temporal.factory", "temporal.1", Properties::new())
        .expect("Failed to instantiate");

    (framework, core, instance, log, proxy)
}

fn register_provider(framework: &Arc<Framework>, text: &str) -> gantry_framework::ServiceRegistration {
    framework
        .context()
        .register_service(
            &["T"],
            Arc::new(text.to_string()) as ServiceObject,
            Properties::new(),
        )
        .expect("Failed to register provider")
}

fn read_through_proxy(proxy: &TemporalProxy) -> Result<String, TemporalError> {
    proxy.call(|svc| {
        svc.downcast_ref::<String>()
            .cloned()
            .unwrap_or_default()
    })
}

/// S4: the component stays valid while a replacement arrives within the
/// grace period; a call through the proxy blocks until it does.
#[test]
fn temporal_reconnect() {
    let (framework, _core, instance, log, proxy_slot) = setup(Duration::from_millis(500));

    let first = register_provider(&framework, "one");
    assert_eq!(instance.state(), ComponentState::Valid);

    let proxy = proxy_slot.lock().unwrap().clone().expect("No proxy injected");
    assert_eq!(read_through_proxy(&proxy).expect("call failed"), "one");

    // Lose the provider: the grace period starts
    first.unregister().expect("Failed to unregister");
    assert_eq!(instance.state(), ComponentState::Valid);

    // A call through the proxy now blocks until the replacement arrives
    let blocked = {
        let proxy = proxy.clone();
        std::thread::spawn(move || read_through_proxy(&proxy))
    };

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(instance.state(), ComponentState::Valid);
    register_provider(&framework, "two");

    let result = blocked.join().expect("The blocked call panicked");
    assert_eq!(result.expect("call failed"), "two");

    // No invalidation happened along the way
    assert_eq!(instance.state(), ComponentState::Valid);
    assert!(!log.lock().unwrap().contains(&"invalidate".to_string()));
}

/// When no replacement arrives, the grace timer expires, the component
/// invalidates and proxy calls report the timeout.
#[test]
fn temporal_timeout_invalidates() {
    let (framework, _core, instance, log, proxy_slot) = setup(Duration::from_millis(150));

    let provider = register_provider(&framework, "solo");
    assert_eq!(instance.state(), ComponentState::Valid);
    let proxy = proxy_slot.lock().unwrap().clone().expect("No proxy injected");

    provider.unregister().expect("Failed to unregister");
    assert_eq!(instance.state(), ComponentState::Valid);

    // Wait well past the grace period
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(instance.state(), ComponentState::Invalid);
    assert!(log.lock().unwrap().contains(&"invalidate".to_string()));

    assert!(matches!(
        read_through_proxy(&proxy),
        Err(TemporalError::Timeout)
    ));
}

/// An immediately available replacement swaps transparently, without a
/// grace timer.
#[test]
fn temporal_immediate_replacement() {
    let (framework, _core, instance, log, proxy_slot) = setup(Duration::from_millis(500));

    let first = register_provider(&framework, "one");
    let _second = register_provider(&framework, "two");
    assert_eq!(instance.state(), ComponentState::Valid);

    let proxy = proxy_slot.lock().unwrap().clone().expect("No proxy injected");
    assert_eq!(read_through_proxy(&proxy).expect("call failed"), "one");

    first.unregister().expect("Failed to unregister");
    assert_eq!(instance.state(), ComponentState::Valid);
    assert_eq!(read_through_proxy(&proxy).expect("call failed"), "two");
    assert!(!log.lock().unwrap().contains(&"invalidate".to_string()));
}
