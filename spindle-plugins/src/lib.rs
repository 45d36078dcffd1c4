//! Built-in plugins.

pub mod feed;
pub mod site;

use spindle_core::SpindleError;
use spindle_plugin::PluginRegistry;
use std::sync::Arc;

/// Register all built-in plugins.
pub fn register_all(registry: &mut PluginRegistry) -> Result<(), SpindleError> {
    registry.register(Arc::new(feed::LatestPlugin))?;
    registry.register(Arc::new(site::MonitorPlugin))?;
    Ok(())
}
