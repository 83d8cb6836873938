use super::*;

/// Kind of a bundle lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BundleEventKind {
    Installed,
    Starting,
    Started,
    Stopping,
    /// The bundle has been deactivated, but some of its services may
    /// still remain.
    StoppingPreclean,
    Stopped,
    UpdateBegin,
    Updated,
    UpdateFailed,
    Uninstalled,
}

#[derive(Clone)]
pub struct BundleEvent {
    kind: BundleEventKind,
    bundle: Arc<bundle::Bundle>,
}

impl BundleEvent {
    pub(crate) fn new(kind: BundleEventKind, bundle: Arc<bundle::Bundle>) -> Self {
        Self { kind, bundle }
    }

    pub fn kind(&self) -> BundleEventKind {
        self.kind
    }

    pub fn bundle(&self) -> &Arc<bundle::Bundle> {
        &self.bundle
    }
}

impl std::fmt::Debug for BundleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleEvent")
            .field("kind", &self.kind)
            .field("bundle", &self.bundle.id())
            .finish()
    }
}

/// Kind of a service lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ServiceEventKind {
    Registered,
    /// The properties of a registered service have been modified.
    Modified,
    /// The properties of a registered service have been modified and no
    /// longer match a listener's filter. Synthesized per listener.
    ModifiedEndmatch,
    Unregistering,
}

#[derive(Clone)]
pub struct ServiceEvent {
    kind: ServiceEventKind,
    reference: ServiceReference,
    /// Previous property snapshot, for MODIFIED and MODIFIED_ENDMATCH.
    previous: Option<Properties>,
}

impl ServiceEvent {
    pub(crate) fn new(
        kind: ServiceEventKind,
        reference: ServiceReference,
        previous: Option<Properties>,
    ) -> Self {
        Self {
            kind,
            reference,
            previous,
        }
    }

    pub fn kind(&self) -> ServiceEventKind {
        self.kind
    }

    pub fn reference(&self) -> &ServiceReference {
        &self.reference
    }

    pub fn previous_properties(&self) -> Option<&Properties> {
        self.previous.as_ref()
    }

    pub(crate) fn as_endmatch(&self) -> ServiceEvent {
        ServiceEvent {
            kind: ServiceEventKind::ModifiedEndmatch,
            reference: self.reference.clone(),
            previous: self.previous.clone(),
        }
    }
}

impl std::fmt::Debug for ServiceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEvent")
            .field("kind", &self.kind)
            .field("service", &self.reference.service_id())
            .finish()
    }
}

pub trait ServiceListener: Send + Sync {
    fn service_changed(&self, event: &ServiceEvent);
}

pub trait BundleListener: Send + Sync {
    fn bundle_changed(&self, event: &BundleEvent);
}

/// Called back right before the framework stops.
pub trait FrameworkStopListener: Send + Sync {
    fn framework_stopping(&self);
}
