//! Shared data model for the Gantry service runtime.
//!
//! Services, filters and components all trade in [`Properties`]: ordered
//! maps from string keys to loosely-typed [`Value`]s. This crate holds
//! those two types and nothing else, so that the filter engine and the
//! framework can agree on them without depending on each other.

mod props;
mod value;

pub use props::Properties;
pub use value::Value;
