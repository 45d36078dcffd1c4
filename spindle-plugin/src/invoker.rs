use crate::plugin::{FastCacheStore, Plugin, PluginCall, PluginError};
use crate::registry::PluginRegistry;
use dashmap::DashMap;
use serde_json::Value;
use spindle_core::{ReservationId, SpindleError};
use spindle_fetch::PageGetter;
use spindle_store::blob::{BlobObject, BlobStore};
use spindle_store::catalog::Catalog;
use spindle_store::codec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What became of one plugin invocation.
#[derive(Debug)]
pub enum InvokeOutcome {
    /// The plugin completed; `Some` results were persisted for recurring
    /// fires.
    Completed(Option<Value>),
    /// The plugin signalled that the reservation is terminally invalid;
    /// catalog row and stored result are gone.
    Deleted,
    /// The plugin failed; already logged.
    Failed(String),
}

/// The single choke point both the interface's synchronous first fires and
/// the worker's broker-driven fires dispatch through.
pub struct Invoker {
    registry: Arc<PluginRegistry>,
    fetcher: Arc<PageGetter>,
    store: Arc<dyn BlobStore>,
    catalog: Arc<dyn Catalog>,
    results_bucket: Option<String>,
    fast_caches: FastCacheStore,
    active: DashMap<ReservationId, ()>,
    completed: AtomicU64,
}

impl Invoker {
    pub fn new(
        registry: Arc<PluginRegistry>,
        fetcher: Arc<PageGetter>,
        store: Arc<dyn BlobStore>,
        catalog: Arc<dyn Catalog>,
        results_bucket: Option<String>,
    ) -> Self {
        Self {
            registry,
            fetcher,
            store,
            catalog,
            results_bucket,
            fast_caches: FastCacheStore::new(),
            active: DashMap::new(),
            completed: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn fast_caches(&self) -> &FastCacheStore {
        &self.fast_caches
    }

    /// Number of plugin executions currently in flight through this invoker.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// True while a fire for this reservation is running here.
    pub fn is_active(&self, uuid: &ReservationId) -> bool {
        self.active.contains_key(uuid)
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Execute one fire.
    ///
    /// With a UUID this is a recurring fire: the active-job set suppresses
    /// a second dispatch of the same reservation in this process, and a
    /// non-`None` result is persisted under the UUID. Without a UUID it is
    /// a one-shot: the value is returned, nothing is stored.
    pub async fn invoke(
        &self,
        function_name: &str,
        args: HashMap<String, String>,
        uuid: Option<ReservationId>,
    ) -> InvokeOutcome {
        let Some((resolved, plugin)) = self.registry.resolve(function_name) else {
            warn!(function = %function_name, "Unknown function, dropping invocation");
            return InvokeOutcome::Failed(format!("unknown function {}", function_name));
        };

        if let Some(uuid) = uuid {
            if self.active.insert(uuid, ()).is_some() {
                warn!(function = %resolved, uuid = %uuid, "Fire already active, suppressing duplicate");
                return InvokeOutcome::Failed(format!("{} already active", uuid));
            }
        }

        let outcome = self.run(&resolved, plugin, args, uuid).await;

        if let Some(uuid) = uuid {
            self.active.remove(&uuid);
        }
        if matches!(outcome, InvokeOutcome::Completed(_)) {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    async fn run(
        &self,
        function_name: &str,
        plugin: Arc<dyn Plugin>,
        args: HashMap<String, String>,
        uuid: Option<ReservationId>,
    ) -> InvokeOutcome {
        let spec = plugin.arg_spec();
        let call = PluginCall {
            args,
            reservation_uuid: if spec.wants_uuid { uuid } else { None },
            fast_cache: if spec.wants_fast_cache {
                uuid.and_then(|u| self.fast_caches.get(&u))
            } else {
                None
            },
            fetcher: Arc::clone(&self.fetcher),
            fast_caches: self.fast_caches.clone(),
        };

        match plugin.call(call).await {
            Ok(None) => {
                debug!(function = %function_name, "Function returned successfully with no result");
                InvokeOutcome::Completed(None)
            }
            Ok(Some(value)) => {
                debug!(function = %function_name, "Function returned successfully");
                if let (Some(uuid), Some(bucket)) = (uuid, self.results_bucket.as_deref()) {
                    self.persist_result(function_name, &uuid, bucket, &value).await;
                }
                InvokeOutcome::Completed(Some(value))
            }
            Err(PluginError::DeleteReservation) => {
                if let Some(uuid) = uuid {
                    info!(function = %function_name, uuid = %uuid, "Reservation deleted at request of the function");
                    if let Err(e) = self.delete_reservation(&uuid).await {
                        error!(uuid = %uuid, error = %e, "Reservation cleanup failed");
                    }
                }
                InvokeOutcome::Deleted
            }
            Err(PluginError::Failed(message)) => {
                match uuid {
                    Some(uuid) => error!(function = %function_name, uuid = %uuid, error = %message, "Function failed"),
                    None => error!(function = %function_name, error = %message, "Function failed"),
                }
                InvokeOutcome::Failed(message)
            }
        }
    }

    /// Serialize, gzip, and store a plugin result under the UUID key. A
    /// write failure loses the result, not the fire.
    async fn persist_result(
        &self,
        function_name: &str,
        uuid: &ReservationId,
        bucket: &str,
        value: &Value,
    ) {
        let serialized = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(function = %function_name, uuid = %uuid, error = %e, "Could not serialize result");
                return;
            }
        };
        let object = match codec::compress_object(BlobObject::new(serialized, "application/json")) {
            Ok(object) => object,
            Err(e) => {
                error!(function = %function_name, uuid = %uuid, error = %e, "Could not compress result");
                return;
            }
        };
        if let Err(e) = self.store.put(bucket, &uuid.to_hex(), object).await {
            error!(function = %function_name, uuid = %uuid, error = %e, "Could not store result");
        }
    }

    /// Remove a reservation: catalog row plus any stored result.
    pub async fn delete_reservation(&self, uuid: &ReservationId) -> Result<(), SpindleError> {
        let hex = uuid.to_hex();
        self.catalog
            .delete_reservation(&hex)
            .await
            .map_err(|e| SpindleError::Catalog(e.to_string()))?;
        if let Some(bucket) = self.results_bucket.as_deref() {
            self.store
                .delete(bucket, &hex)
                .await
                .map_err(|e| SpindleError::Store(e.to_string()))?;
        }
        self.fast_caches.remove(uuid);
        info!(uuid = %hex, "Reservation deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{ArgSpec, Plugin};
    use async_trait::async_trait;
    use spindle_core::config::FetchConfig;
    use spindle_fetch::{FetchError, PageRequest, PageResponse, RequestQueuer, Transport};
    use spindle_store::catalog::{CatalogRow, MemoryCatalog};
    use spindle_store::MemoryBlobStore;

    struct NoopTransport;

    #[async_trait]
    impl Transport for NoopTransport {
        async fn fetch(&self, _request: &PageRequest) -> Result<PageResponse, FetchError> {
            Err(FetchError::Transport("no network in tests".to_string()))
        }
    }

    struct EchoPlugin;

    #[async_trait]
    impl Plugin for EchoPlugin {
        fn name(&self) -> &str {
            "svc/echo"
        }
        fn interval(&self) -> u64 {
            60
        }
        fn arg_spec(&self) -> ArgSpec {
            ArgSpec::default().required(&["message"])
        }
        async fn call(&self, call: PluginCall) -> Result<Option<Value>, PluginError> {
            Ok(Some(serde_json::json!({ "echo": call.arg("message") })))
        }
    }

    struct SilentPlugin;

    #[async_trait]
    impl Plugin for SilentPlugin {
        fn name(&self) -> &str {
            "svc/silent"
        }
        async fn call(&self, _call: PluginCall) -> Result<Option<Value>, PluginError> {
            Ok(None)
        }
    }

    struct DeletingPlugin;

    #[async_trait]
    impl Plugin for DeletingPlugin {
        fn name(&self) -> &str {
            "svc/expired"
        }
        fn interval(&self) -> u64 {
            60
        }
        async fn call(&self, _call: PluginCall) -> Result<Option<Value>, PluginError> {
            Err(PluginError::DeleteReservation)
        }
    }

    struct StatefulPlugin;

    #[async_trait]
    impl Plugin for StatefulPlugin {
        fn name(&self) -> &str {
            "svc/stateful"
        }
        fn interval(&self) -> u64 {
            60
        }
        fn arg_spec(&self) -> ArgSpec {
            ArgSpec::default().wants_uuid().wants_fast_cache()
        }
        async fn call(&self, call: PluginCall) -> Result<Option<Value>, PluginError> {
            let previous = call
                .fast_cache
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).to_string());
            call.set_fast_cache("seen");
            Ok(Some(serde_json::json!({ "previous": previous })))
        }
    }

    fn build_invoker() -> (Invoker, Arc<MemoryBlobStore>, Arc<MemoryCatalog>) {
        let mut registry = PluginRegistry::new();
        registry.register(Arc::new(EchoPlugin)).unwrap();
        registry.register(Arc::new(SilentPlugin)).unwrap();
        registry.register(Arc::new(DeletingPlugin)).unwrap();
        registry.register(Arc::new(StatefulPlugin)).unwrap();

        let store = Arc::new(MemoryBlobStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let rq = RequestQueuer::new(Arc::new(NoopTransport), &FetchConfig::default());
        let fetcher = Arc::new(PageGetter::new(
            rq,
            Arc::clone(&store) as Arc<dyn BlobStore>,
            "http-cache",
            0,
        ));
        let invoker = Invoker::new(
            Arc::new(registry),
            fetcher,
            Arc::clone(&store) as Arc<dyn BlobStore>,
            Arc::clone(&catalog) as Arc<dyn Catalog>,
            Some("results".to_string()),
        );
        (invoker, store, catalog)
    }

    fn args(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_recurring_fire_persists_gzipped_result() {
        let (invoker, store, _) = build_invoker();
        let uuid = ReservationId::generate();

        let outcome = invoker
            .invoke("svc/echo", args(&[("message", "hi")]), Some(uuid))
            .await;
        let InvokeOutcome::Completed(Some(value)) = outcome else {
            panic!("expected completed outcome");
        };
        assert_eq!(value["echo"], "hi");

        let object = store.get("results", &uuid.to_hex()).await.unwrap().unwrap();
        let restored = codec::decompress_object(object).unwrap();
        let stored: Value = serde_json::from_slice(&restored.body).unwrap();
        assert_eq!(stored["echo"], "hi");
        assert_eq!(invoker.completed_count(), 1);
    }

    #[tokio::test]
    async fn test_one_shot_fire_stores_nothing() {
        let (invoker, store, _) = build_invoker();
        let outcome = invoker
            .invoke("svc/echo", args(&[("message", "hi")]), None)
            .await;
        assert!(matches!(outcome, InvokeOutcome::Completed(Some(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_none_result_stores_nothing() {
        let (invoker, store, _) = build_invoker();
        let uuid = ReservationId::generate();
        let outcome = invoker.invoke("svc/silent", HashMap::new(), Some(uuid)).await;
        assert!(matches!(outcome, InvokeOutcome::Completed(None)));
        assert!(store.get("results", &uuid.to_hex()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_function_fails() {
        let (invoker, _, _) = build_invoker();
        let outcome = invoker.invoke("svc/nope", HashMap::new(), None).await;
        assert!(matches!(outcome, InvokeOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_delete_signal_removes_catalog_row_and_result() {
        let (invoker, store, catalog) = build_invoker();
        let uuid = ReservationId::generate();
        catalog
            .insert_reservation(CatalogRow {
                uuid: uuid.to_hex(),
                function_name: "svc/expired".to_string(),
                account_id: 1,
            })
            .await;
        store
            .put("results", &uuid.to_hex(), BlobObject::new("old", "application/json"))
            .await
            .unwrap();

        let outcome = invoker.invoke("svc/expired", HashMap::new(), Some(uuid)).await;
        assert!(matches!(outcome, InvokeOutcome::Deleted));
        assert!(catalog.reservation(&uuid.to_hex()).await.unwrap().is_none());
        assert!(store.get("results", &uuid.to_hex()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fast_cache_round_trip_across_fires() {
        let (invoker, _, _) = build_invoker();
        let uuid = ReservationId::generate();

        let InvokeOutcome::Completed(Some(first)) =
            invoker.invoke("svc/stateful", HashMap::new(), Some(uuid)).await
        else {
            panic!("expected completed outcome");
        };
        assert!(first["previous"].is_null());

        let InvokeOutcome::Completed(Some(second)) =
            invoker.invoke("svc/stateful", HashMap::new(), Some(uuid)).await
        else {
            panic!("expected completed outcome");
        };
        assert_eq!(second["previous"], "seen");
    }

    #[tokio::test]
    async fn test_active_set_clears_after_fire() {
        let (invoker, _, _) = build_invoker();
        let uuid = ReservationId::generate();
        assert!(!invoker.is_active(&uuid));
        invoker
            .invoke("svc/echo", args(&[("message", "x")]), Some(uuid))
            .await;
        assert!(!invoker.is_active(&uuid));
        assert_eq!(invoker.active_count(), 0);
    }
}
