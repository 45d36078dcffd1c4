//! The plugin machinery shared by the interface (synchronous first fires)
//! and the workers (broker-driven fires): the `Plugin` trait, the registry
//! built before server start, and the single invoker both sides dispatch
//! through.

pub mod invoker;
pub mod plugin;
pub mod registry;

pub use invoker::{InvokeOutcome, Invoker};
pub use plugin::{ArgSpec, FastCacheStore, Plugin, PluginCall, PluginError, RESERVED_ARGUMENTS};
pub use registry::PluginRegistry;
