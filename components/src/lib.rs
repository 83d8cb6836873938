//! Declarative component model for the Gantry service runtime.
//!
//! A [`factory::ComponentFactory`] describes a component: the services it
//! provides, the dependencies it requires and its default properties. The
//! [`runtime::ComponentCore`] instantiates factories into lifecycle-managed
//! instances; pluggable [`handlers`] wire each instance to the service
//! registry, binding and unbinding dependencies as services come and go,
//! and publishing the component's own service while it is valid.

pub mod component;
pub mod constants;
pub mod contexts;
pub mod error;
pub mod factory;
pub mod handlers;
pub mod instance;
pub mod runtime;
pub mod waiting;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use trace_err::*;
use tracing::{debug, info, warn};

use gantry_framework::context::BundleContext;
use gantry_framework::events::{ServiceEvent, ServiceEventKind, ServiceListener};
use gantry_framework::{
    Properties, ServiceObject, ServiceReference, ServiceRegistration, Value, typed_service,
};

pub use component::{CallbackError, CallbackResult, Component, Injection};
pub use contexts::{ComponentContext, Requirement};
pub use error::Error;
pub use factory::ComponentFactory;
pub use instance::{ComponentState, StoredInstance};
pub use runtime::ComponentCore;

pub type Result<T> = std::result::Result<T, Error>;
