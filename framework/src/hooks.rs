//! Event listener hooks.
//!
//! A hook is a service registered under
//! [`keys::SERVICE_EVENT_LISTENER_HOOK`] (as an
//! `Arc<dyn EventListenerHook>` service object). Before a service event
//! is delivered, every hook may shrink the set of listeners that will
//! receive it — by bundle or listener — but can never add to it.

use super::*;
use crate::events::{ServiceEvent, ServiceListener};
use gantry_filter::Filter;

/// A registered service listener, as exposed to hooks.
#[derive(Clone)]
pub struct ListenerInfo {
    pub(crate) bundle_id: u64,
    pub(crate) listener: Arc<dyn ServiceListener>,
    pub(crate) specification: Option<String>,
    pub(crate) filter: Option<Filter>,
}

impl ListenerInfo {
    /// The bundle whose context registered the listener.
    pub fn bundle_id(&self) -> u64 {
        self.bundle_id
    }

    pub fn specification(&self) -> Option<&str> {
        self.specification.as_deref()
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }
}

impl std::fmt::Debug for ListenerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerInfo")
            .field("bundle", &self.bundle_id)
            .field("specification", &self.specification)
            .finish()
    }
}

/// Shrink-only view of the listeners about to receive an event.
///
/// Delivery order is the snapshot order; removals never reorder the
/// survivors.
pub struct ShrinkableListeners {
    entries: Vec<Option<ListenerInfo>>,
}

impl ShrinkableListeners {
    pub(crate) fn new(entries: Vec<ListenerInfo>) -> Self {
        Self {
            entries: entries.into_iter().map(Some).collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListenerInfo> {
        self.entries.iter().flatten()
    }

    /// Drops every listener registered through the given bundle.
    pub fn remove_bundle(&mut self, bundle_id: u64) {
        for entry in &mut self.entries {
            if entry.as_ref().is_some_and(|e| e.bundle_id == bundle_id) {
                *entry = None;
            }
        }
    }

    /// Keeps only the listeners for which the predicate holds.
    pub fn retain(&mut self, mut keep: impl FnMut(&ListenerInfo) -> bool) {
        for entry in &mut self.entries {
            if entry.as_ref().is_some_and(|e| !keep(e)) {
                *entry = None;
            }
        }
    }

    pub(crate) fn into_entries(self) -> Vec<ListenerInfo> {
        self.entries.into_iter().flatten().collect()
    }
}

/// Shrinks the candidate listener set of a service event before delivery.
pub trait EventListenerHook: Send + Sync {
    fn event(&self, event: &ServiceEvent, listeners: &mut ShrinkableListeners);
}
