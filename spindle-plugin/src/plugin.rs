use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use spindle_core::ReservationId;
use spindle_fetch::PageGetter;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Argument names the platform owns; plugins may not declare them.
pub const RESERVED_ARGUMENTS: &[&str] = &[
    "reservation_function_name",
    "reservation_created",
    "reservation_next_request",
    "reservation_error",
];

/// A plugin's argument contract, declared at registration time.
///
/// `wants_uuid` and `wants_fast_cache` are explicit capability flags: a
/// plugin that opts in receives the firing reservation's UUID and its
/// per-reservation fast-cache blob on each call.
#[derive(Debug, Clone, Default)]
pub struct ArgSpec {
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub wants_uuid: bool,
    pub wants_fast_cache: bool,
}

impl ArgSpec {
    pub fn required(mut self, names: &[&str]) -> Self {
        self.required = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn optional(mut self, names: &[&str]) -> Self {
        self.optional = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn wants_uuid(mut self) -> Self {
        self.wants_uuid = true;
        self
    }

    pub fn wants_fast_cache(mut self) -> Self {
        self.wants_fast_cache = true;
        self
    }

    /// All declared argument names, required first.
    pub fn all_arguments(&self) -> impl Iterator<Item = &str> {
        self.required
            .iter()
            .chain(self.optional.iter())
            .map(|s| s.as_str())
    }
}

/// Control-flow signals out of a plugin. `DeleteReservation` tells the
/// invoker the firing UUID is terminally invalid.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("reservation deleted at the plugin's request")]
    DeleteReservation,

    #[error("{0}")]
    Failed(String),
}

/// Per-reservation blobs plugins carry across fires without a catalog
/// round-trip.
#[derive(Clone, Default)]
pub struct FastCacheStore {
    inner: Arc<DashMap<ReservationId, Bytes>>,
}

impl FastCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uuid: &ReservationId) -> Option<Bytes> {
        self.inner.get(uuid).map(|v| v.value().clone())
    }

    pub fn set(&self, uuid: ReservationId, data: impl Into<Bytes>) {
        self.inner.insert(uuid, data.into());
    }

    pub fn remove(&self, uuid: &ReservationId) {
        self.inner.remove(uuid);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// One plugin invocation: resolved arguments plus the platform services a
/// plugin body may use.
pub struct PluginCall {
    pub args: HashMap<String, String>,
    /// The firing reservation; populated only when the plugin opted in.
    pub reservation_uuid: Option<ReservationId>,
    /// The reservation's fast-cache blob; populated only when the plugin
    /// opted in and a blob exists.
    pub fast_cache: Option<Bytes>,
    /// The caching fetcher plugins crawl through.
    pub fetcher: Arc<PageGetter>,
    /// Write side of the fast cache.
    pub fast_caches: FastCacheStore,
}

impl PluginCall {
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).map(|v| v.as_str())
    }

    /// Persist a fast-cache blob for the firing reservation.
    pub fn set_fast_cache(&self, data: impl Into<Bytes>) {
        if let Some(uuid) = self.reservation_uuid {
            self.fast_caches.set(uuid, data);
        }
    }
}

/// A registered, invokable function.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin path, lowercase, usually `service/function`.
    fn name(&self) -> &str;

    /// Fire interval in seconds; 0 means one-shot.
    fn interval(&self) -> u64 {
        0
    }

    /// Argument contract.
    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::default()
    }

    /// Execute one fire. `Ok(Some(value))` is persisted to the result
    /// bucket for recurring fires; `Ok(None)` stores nothing.
    async fn call(&self, call: PluginCall) -> Result<Option<Value>, PluginError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_spec_builder() {
        let spec = ArgSpec::default()
            .required(&["feed_url"])
            .optional(&["limit"])
            .wants_uuid();
        assert_eq!(spec.required, vec!["feed_url"]);
        assert_eq!(spec.optional, vec!["limit"]);
        assert!(spec.wants_uuid);
        assert!(!spec.wants_fast_cache);
        let all: Vec<&str> = spec.all_arguments().collect();
        assert_eq!(all, vec!["feed_url", "limit"]);
    }

    #[test]
    fn test_fast_cache_store() {
        let store = FastCacheStore::new();
        let uuid = ReservationId::generate();
        assert!(store.get(&uuid).is_none());

        store.set(uuid, "state-v1");
        assert_eq!(store.get(&uuid).unwrap(), Bytes::from_static(b"state-v1"));
        assert_eq!(store.len(), 1);

        store.remove(&uuid);
        assert!(store.is_empty());
    }
}
