use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BundleState {
    Installed,
    Resolved,
    Starting,
    Active,
    Stopping,
    Uninstalled,
}

/// Start/stop hooks for a bundle. The context handed in stays valid for
/// the bundle's whole active phase.
pub trait BundleActivator: Send + Sync {
    fn start(&self, context: &context::BundleContext) -> Result<()>;
    fn stop(&self, context: &context::BundleContext) -> Result<()>;
}

/// A unit of code hosted by the framework, able to register and consume
/// services through its [`context::BundleContext`].
pub struct Bundle {
    id: u64,
    name: Box<str>,
    state: RwLock<BundleState>,
    activator: Option<Arc<dyn BundleActivator>>,
    framework: Weak<framework::Framework>,
}

impl Bundle {
    pub(crate) fn new(
        id: u64,
        name: &str,
        activator: Option<Arc<dyn BundleActivator>>,
        framework: Weak<framework::Framework>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            state: RwLock::new(BundleState::Installed),
            activator,
            framework,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn symbolic_name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BundleState {
        *self.state.read().trace_expect("Failed to lock bundle state")
    }

    pub(crate) fn set_state(&self, state: BundleState) {
        *self
            .state
            .write()
            .trace_expect("Failed to lock bundle state") = state;
    }

    pub(crate) fn activator(&self) -> Option<&Arc<dyn BundleActivator>> {
        self.activator.as_ref()
    }

    fn framework(&self) -> Result<Arc<framework::Framework>> {
        self.framework.upgrade().ok_or(Error::FrameworkStopped)
    }

    /// The context narrowing framework access to this bundle.
    pub fn context(self: &Arc<Self>) -> context::BundleContext {
        context::BundleContext::new(self.framework.clone(), self.clone())
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.framework()?.start_bundle(self)
    }

    pub fn stop(self: &Arc<Self>) -> Result<()> {
        self.framework()?.stop_bundle(self)
    }

    pub fn update(self: &Arc<Self>) -> Result<()> {
        self.framework()?.update_bundle(self)
    }

    pub fn uninstall(self: &Arc<Self>) -> Result<()> {
        self.framework()?.uninstall_bundle(self)
    }
}

impl PartialEq for Bundle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Bundle {}

impl PartialOrd for Bundle {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Bundle {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::hash::Hash for Bundle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Debug for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
