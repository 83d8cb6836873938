//! Core of the Gantry modular service runtime.
//!
//! A [`Framework`] hosts bundles; each bundle owns a
//! [`context::BundleContext`] through which it registers, looks up and
//! tracks services. Services are indexed by specification and ordered by
//! `(−ranking, service id)`; lookups and listener subscriptions are
//! constrained with LDAP filters from [`gantry_filter`]. Service and
//! bundle events are delivered synchronously by an internal dispatcher.

mod dispatcher;

pub mod bundle;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod framework;
pub mod hooks;
pub mod keys;
pub mod registry;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use trace_err::*;
use tracing::{debug, info, warn};

pub use error::Error;
pub use framework::Framework;
pub use gantry_model::{Properties, Value};
pub use registry::{ServiceObject, ServiceReference, ServiceRegistration};

pub type Result<T> = std::result::Result<T, Error>;

/// Borrows the concrete type back out of a registered service object.
///
/// Services backed by a trait object are registered as an
/// `Arc<dyn Trait>` inside the [`ServiceObject`], and recovered with
/// `typed_service::<Arc<dyn Trait>>(&svc)`.
pub fn typed_service<T: std::any::Any + Send + Sync>(service: &ServiceObject) -> Option<&T> {
    service.downcast_ref::<T>()
}
