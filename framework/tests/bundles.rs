//! Bundle lifecycle and listener hook scenarios.

use gantry_framework::bundle::{BundleActivator, BundleState};
use gantry_framework::config::Config;
use gantry_framework::context::BundleContext;
use gantry_framework::events::{
    BundleEvent, BundleEventKind, BundleListener, FrameworkStopListener, ServiceEvent,
    ServiceListener,
};
use gantry_framework::hooks::{EventListenerHook, ShrinkableListeners};
use gantry_framework::{Framework, Properties, ServiceObject, keys};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct BundleRecorder {
    events: Mutex<Vec<(BundleEventKind, u64)>>,
}

impl BundleListener for BundleRecorder {
    fn bundle_changed(&self, event: &BundleEvent) {
        self.events
            .lock()
            .unwrap()
            .push((event.kind(), event.bundle().id()));
    }
}

struct Activator {
    started: AtomicUsize,
    stopped: AtomicUsize,
}

impl BundleActivator for Activator {
    fn start(&self, context: &BundleContext) -> gantry_framework::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        context.register_service(
            &["activator.svc"],
            Arc::new(()) as ServiceObject,
            Properties::new(),
        )?;
        Ok(())
    }

    fn stop(&self, _context: &BundleContext) -> gantry_framework::Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn bundle_lifecycle_events() {
    let framework = Framework::new(Config::default());
    let recorder = Arc::new(BundleRecorder::default());
    framework
        .context()
        .add_bundle_listener(recorder.clone())
        .expect("Failed to subscribe");

    let activator = Arc::new(Activator {
        started: AtomicUsize::new(0),
        stopped: AtomicUsize::new(0),
    });
    let bundle = framework
        .install_bundle("demo", Some(activator.clone()))
        .expect("Failed to install");
    assert_eq!(bundle.state(), BundleState::Installed);

    bundle.start().expect("Failed to start");
    assert_eq!(bundle.state(), BundleState::Active);
    assert_eq!(activator.started.load(Ordering::SeqCst), 1);

    // The activator's service is up
    assert!(
        framework
            .context()
            .get_service_reference(Some("activator.svc"), None)
            .expect("Lookup failed")
            .is_some()
    );

    bundle.update().expect("Failed to update");
    assert_eq!(activator.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(activator.started.load(Ordering::SeqCst), 2);

    bundle.stop().expect("Failed to stop");
    assert_eq!(bundle.state(), BundleState::Resolved);

    // The activator's service went with it
    assert!(
        framework
            .context()
            .get_service_reference(Some("activator.svc"), None)
            .expect("Lookup failed")
            .is_none()
    );

    bundle.uninstall().expect("Failed to uninstall");
    assert_eq!(bundle.state(), BundleState::Uninstalled);
    assert!(framework.get_bundle(bundle.id()).is_none());

    let kinds: Vec<BundleEventKind> = recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, id)| *id == bundle.id())
        .map(|(kind, _)| *kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            BundleEventKind::Installed,
            BundleEventKind::Starting,
            BundleEventKind::Started,
            BundleEventKind::UpdateBegin,
            BundleEventKind::Stopping,
            BundleEventKind::StoppingPreclean,
            BundleEventKind::Stopped,
            BundleEventKind::Starting,
            BundleEventKind::Started,
            BundleEventKind::Updated,
            BundleEventKind::Stopping,
            BundleEventKind::StoppingPreclean,
            BundleEventKind::Stopped,
            BundleEventKind::Uninstalled,
        ]
    );
}

#[test]
fn stopping_a_bundle_removes_its_listeners() {
    let framework = Framework::new(Config::default());
    let observer = framework
        .install_bundle("observer", None)
        .expect("Failed to install");
    observer.start().expect("Failed to start");

    #[derive(Default)]
    struct Counter {
        seen: AtomicUsize,
    }
    impl ServiceListener for Counter {
        fn service_changed(&self, _event: &ServiceEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    let counter = Arc::new(Counter::default());
    observer
        .context()
        .add_service_listener(counter.clone(), None, None)
        .expect("Failed to subscribe");

    framework
        .context()
        .register_service(&["noisy"], Arc::new(()) as ServiceObject, Properties::new())
        .expect("Failed to register");
    assert_eq!(counter.seen.load(Ordering::SeqCst), 1);

    observer.stop().expect("Failed to stop");

    framework
        .context()
        .register_service(&["noisy"], Arc::new(()) as ServiceObject, Properties::new())
        .expect("Failed to register");
    assert_eq!(
        counter.seen.load(Ordering::SeqCst),
        1,
        "Listeners of a stopped bundle are removed automatically"
    );
}

struct MuzzleHook {
    muted_bundle: u64,
}

impl EventListenerHook for MuzzleHook {
    fn event(&self, _event: &ServiceEvent, listeners: &mut ShrinkableListeners) {
        listeners.remove_bundle(self.muted_bundle);
    }
}

#[test]
fn listener_hooks_shrink_delivery() {
    let framework = Framework::new(Config::default());
    let muted = framework
        .install_bundle("muted", None)
        .expect("Failed to install");
    muted.start().expect("Failed to start");

    #[derive(Default)]
    struct Counter {
        seen: AtomicUsize,
    }
    impl ServiceListener for Counter {
        fn service_changed(&self, _event: &ServiceEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    let heard = Arc::new(Counter::default());
    let silenced = Arc::new(Counter::default());
    framework
        .context()
        .add_service_listener(heard.clone(), Some("spec.hooked"), None)
        .expect("Failed to subscribe");
    muted
        .context()
        .add_service_listener(silenced.clone(), Some("spec.hooked"), None)
        .expect("Failed to subscribe");

    // Register the hook muting the 'muted' bundle
    let hook: Arc<dyn EventListenerHook> = Arc::new(MuzzleHook {
        muted_bundle: muted.id(),
    });
    framework
        .context()
        .register_service(
            &[keys::SERVICE_EVENT_LISTENER_HOOK],
            Arc::new(hook) as ServiceObject,
            Properties::new(),
        )
        .expect("Failed to register hook");

    framework
        .context()
        .register_service(
            &["spec.hooked"],
            Arc::new(()) as ServiceObject,
            Properties::new(),
        )
        .expect("Failed to register");

    assert_eq!(heard.seen.load(Ordering::SeqCst), 1);
    assert_eq!(silenced.seen.load(Ordering::SeqCst), 0);
}

#[test]
fn framework_stop_notifies_and_stops_bundles() {
    let framework = Framework::new(Config::default());

    #[derive(Default)]
    struct StopFlag {
        notified: AtomicUsize,
    }
    impl FrameworkStopListener for StopFlag {
        fn framework_stopping(&self) {
            self.notified.fetch_add(1, Ordering::SeqCst);
        }
    }

    let flag = Arc::new(StopFlag::default());
    framework
        .context()
        .add_framework_stop_listener(flag.clone())
        .expect("Failed to subscribe");

    let bundle = framework
        .install_bundle("doomed", None)
        .expect("Failed to install");
    bundle.start().expect("Failed to start");

    framework.stop();
    assert_eq!(flag.notified.load(Ordering::SeqCst), 1);
    assert_eq!(bundle.state(), BundleState::Resolved);
    assert!(framework.is_stopped());
    assert!(framework.install_bundle("late", None).is_err());
}
