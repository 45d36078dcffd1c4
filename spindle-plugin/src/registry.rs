use crate::plugin::{Plugin, RESERVED_ARGUMENTS};
use spindle_core::SpindleError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// The plugin registry.
///
/// Built once before server start, immutable thereafter; scheduler,
/// worker, and interface share an `Arc<PluginRegistry>`. The service
/// remapping table lives here so legacy function names are rewritten in
/// exactly one place — `resolve` — no matter which component is asking.
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
    service_mapping: HashMap<String, String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
            service_mapping: HashMap::new(),
        }
    }

    pub fn with_service_mapping(mut self, mapping: HashMap<String, String>) -> Self {
        self.service_mapping = mapping;
        self
    }

    /// Register a plugin. Names are lowercased; reserved argument names and
    /// duplicate registrations are rejected.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), SpindleError> {
        let name = plugin.name().to_lowercase();
        let spec = plugin.arg_spec();
        for argument in spec.all_arguments() {
            if RESERVED_ARGUMENTS.contains(&argument) {
                return Err(SpindleError::ReservedArgument {
                    function: name,
                    argument: argument.to_string(),
                });
            }
        }
        if self.plugins.contains_key(&name) {
            return Err(SpindleError::DuplicateFunction(name));
        }
        info!(function = %name, interval = plugin.interval(), "Function registered");
        self.plugins.insert(name, plugin);
        Ok(())
    }

    /// Resolve a function name to its plugin, applying the service
    /// remapping first. Returns the resolved name alongside the plugin.
    pub fn resolve(&self, function_name: &str) -> Option<(String, Arc<dyn Plugin>)> {
        let lowered = function_name.to_lowercase();
        let resolved = self
            .service_mapping
            .get(&lowered)
            .cloned()
            .unwrap_or(lowered);
        self.plugins
            .get(&resolved)
            .map(|plugin| (resolved, Arc::clone(plugin)))
    }

    /// Fire interval for a function name, through the remapping.
    pub fn interval(&self, function_name: &str) -> Option<u64> {
        self.resolve(function_name).map(|(_, plugin)| plugin.interval())
    }

    /// Direct lookup without remapping.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(name)
    }

    /// All registered function names.
    pub fn list(&self) -> Vec<&str> {
        self.plugins.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
