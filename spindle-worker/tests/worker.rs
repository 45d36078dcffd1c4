use async_trait::async_trait;
use serde_json::Value;
use spindle_broker::{JobBroker, MemoryBroker};
use spindle_core::config::{FetchConfig, WorkerConfig};
use spindle_core::ReservationId;
use spindle_fetch::{FetchError, PageGetter, PageRequest, PageResponse, RequestQueuer, Transport};
use spindle_plugin::{ArgSpec, Invoker, Plugin, PluginCall, PluginError, PluginRegistry};
use spindle_store::blob::BlobStore;
use spindle_store::catalog::{Catalog, CatalogRow, MemoryCatalog};
use spindle_store::kv::KvCache;
use spindle_store::{MemoryBlobStore, MemoryKv};
use spindle_worker::WorkerServer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

struct NoopTransport;

#[async_trait]
impl Transport for NoopTransport {
    async fn fetch(&self, _request: &PageRequest) -> Result<PageResponse, FetchError> {
        Err(FetchError::Transport("no network in tests".to_string()))
    }
}

/// Records the kwargs of every invocation.
struct RecordingPlugin {
    calls: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn name(&self) -> &str {
        "svc/foo"
    }
    fn interval(&self) -> u64 {
        60
    }
    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::default().required(&["bar"]).optional(&["extra"])
    }
    async fn call(&self, call: PluginCall) -> Result<Option<Value>, PluginError> {
        self.calls.lock().unwrap().push(call.args.clone());
        Ok(Some(serde_json::json!({ "ok": true })))
    }
}

/// Blocks until released, so tests can observe mid-flight state.
struct BlockingPlugin {
    release: Arc<Notify>,
}

#[async_trait]
impl Plugin for BlockingPlugin {
    fn name(&self) -> &str {
        "svc/slow"
    }
    fn interval(&self) -> u64 {
        60
    }
    async fn call(&self, _call: PluginCall) -> Result<Option<Value>, PluginError> {
        self.release.notified().await;
        Ok(None)
    }
}

/// Dies on every fire, standing in for a worker crash mid-plugin.
struct CrashingPlugin;

#[async_trait]
impl Plugin for CrashingPlugin {
    fn name(&self) -> &str {
        "svc/crash"
    }
    fn interval(&self) -> u64 {
        60
    }
    async fn call(&self, _call: PluginCall) -> Result<Option<Value>, PluginError> {
        Err(PluginError::Failed("simulated crash".to_string()))
    }
}

struct SelfDeletingPlugin;

#[async_trait]
impl Plugin for SelfDeletingPlugin {
    fn name(&self) -> &str {
        "svc/done"
    }
    fn interval(&self) -> u64 {
        60
    }
    async fn call(&self, _call: PluginCall) -> Result<Option<Value>, PluginError> {
        Err(PluginError::DeleteReservation)
    }
}

struct Fixture {
    worker: WorkerServer,
    broker: Arc<MemoryBroker>,
    catalog: Arc<MemoryCatalog>,
    store: Arc<MemoryBlobStore>,
    calls: Arc<Mutex<Vec<HashMap<String, String>>>>,
    release: Arc<Notify>,
}

fn fixture(args_mapping: HashMap<String, HashMap<String, String>>) -> Fixture {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let release = Arc::new(Notify::new());

    let mut registry = PluginRegistry::new();
    registry
        .register(Arc::new(RecordingPlugin {
            calls: Arc::clone(&calls),
        }))
        .unwrap();
    registry
        .register(Arc::new(BlockingPlugin {
            release: Arc::clone(&release),
        }))
        .unwrap();
    registry.register(Arc::new(CrashingPlugin)).unwrap();
    registry.register(Arc::new(SelfDeletingPlugin)).unwrap();

    let store = Arc::new(MemoryBlobStore::new());
    let catalog = Arc::new(MemoryCatalog::new());
    let broker = Arc::new(MemoryBroker::new());

    let rq = RequestQueuer::new(Arc::new(NoopTransport), &FetchConfig::default());
    let fetcher = Arc::new(PageGetter::new(
        rq,
        Arc::clone(&store) as Arc<dyn BlobStore>,
        "http-cache",
        0,
    ));
    let invoker = Arc::new(Invoker::new(
        Arc::new(registry),
        fetcher,
        Arc::clone(&store) as Arc<dyn BlobStore>,
        Arc::clone(&catalog) as Arc<dyn Catalog>,
        Some("results".to_string()),
    ));

    let worker = WorkerServer::new(
        Arc::clone(&broker) as Arc<dyn JobBroker>,
        Arc::clone(&catalog) as Arc<dyn Catalog>,
        invoker,
        Arc::new(MemoryKv::new()) as Arc<dyn KvCache>,
        &WorkerConfig::default(),
        args_mapping,
    );

    Fixture {
        worker,
        broker,
        catalog,
        store,
        calls,
        release,
    }
}

async fn seed(fixture: &Fixture, function_name: &str, account: &[(&str, &str)]) -> ReservationId {
    let uuid = ReservationId::generate();
    fixture
        .catalog
        .insert_reservation(CatalogRow {
            uuid: uuid.to_hex(),
            function_name: function_name.to_string(),
            account_id: 7,
        })
        .await;
    fixture.catalog.insert_account(
        spindle_core::reservation::service_of(function_name),
        7,
        account
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    uuid
}

#[tokio::test]
async fn argument_mapping_renames_account_columns() {
    // Plugin svc/foo requires [bar]; account row carries {baz: v}; the
    // service mapping renames baz → bar.
    let mut renames = HashMap::new();
    renames.insert("baz".to_string(), "bar".to_string());
    let mut args_mapping = HashMap::new();
    args_mapping.insert("svc".to_string(), renames);

    let fixture = fixture(args_mapping);
    let uuid = seed(&fixture, "svc/foo", &[("baz", "v")]).await;

    fixture.broker.publish(uuid.as_bytes()).await.unwrap();
    fixture.worker.process_next().await.unwrap();
    fixture.worker.drain().await;

    let calls = fixture.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].get("bar").map(|s| s.as_str()), Some("v"));
    assert!(!calls[0].contains_key("baz"));
}

#[tokio::test]
async fn optional_arguments_copied_when_present() {
    let fixture = fixture(HashMap::new());
    let uuid = seed(&fixture, "svc/foo", &[("bar", "v"), ("extra", "e"), ("noise", "n")]).await;

    fixture.broker.publish(uuid.as_bytes()).await.unwrap();
    fixture.worker.process_next().await.unwrap();
    fixture.worker.drain().await;

    let calls = fixture.calls.lock().unwrap();
    assert_eq!(calls[0].get("extra").map(|s| s.as_str()), Some("e"));
    // Undeclared account fields never reach the plugin.
    assert!(!calls[0].contains_key("noise"));
}

#[tokio::test]
async fn missing_required_argument_drops_and_acks() {
    let fixture = fixture(HashMap::new());
    let uuid = seed(&fixture, "svc/foo", &[("unrelated", "v")]).await;

    fixture.broker.publish(uuid.as_bytes()).await.unwrap();
    fixture.worker.process_next().await.unwrap();
    fixture.worker.drain().await;

    assert!(fixture.calls.lock().unwrap().is_empty());
    // Acked despite the drop.
    assert_eq!(fixture.broker.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn ack_precedes_dispatch() {
    let fixture = fixture(HashMap::new());
    let uuid = seed(&fixture, "svc/slow", &[]).await;

    fixture.broker.publish(uuid.as_bytes()).await.unwrap();
    fixture.worker.process_next().await.unwrap();

    // The plugin is still blocked mid-fire, yet the message is acked.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(fixture.worker.status().active, 1);
    assert_eq!(fixture.broker.queue_depth().await.unwrap(), 0);

    fixture.release.notify_one();
    fixture.worker.drain().await;
    assert_eq!(fixture.worker.status().active, 0);
}

#[tokio::test]
async fn crashed_plugin_is_not_redelivered() {
    let fixture = fixture(HashMap::new());
    let uuid = seed(&fixture, "svc/crash", &[]).await;

    fixture.broker.publish(uuid.as_bytes()).await.unwrap();
    fixture.worker.process_next().await.unwrap();
    fixture.worker.drain().await;

    // Acked before the crash: nothing left to redeliver.
    assert_eq!(fixture.broker.queue_depth().await.unwrap(), 0);
    let next = tokio::time::timeout(
        std::time::Duration::from_millis(50),
        fixture.broker.next(),
    )
    .await;
    assert!(next.is_err(), "no redelivery expected");
}

#[tokio::test]
async fn delete_signal_removes_catalog_and_result() {
    let fixture = fixture(HashMap::new());
    let uuid = seed(&fixture, "svc/done", &[]).await;
    fixture
        .store
        .put(
            "results",
            &uuid.to_hex(),
            spindle_store::blob::BlobObject::new("old", "application/json"),
        )
        .await
        .unwrap();

    fixture.broker.publish(uuid.as_bytes()).await.unwrap();
    fixture.worker.process_next().await.unwrap();
    fixture.worker.drain().await;

    assert!(fixture
        .catalog
        .reservation(&uuid.to_hex())
        .await
        .unwrap()
        .is_none());
    assert!(fixture
        .store
        .get("results", &uuid.to_hex())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn unknown_function_dropped_without_retry() {
    let fixture = fixture(HashMap::new());
    let uuid = seed(&fixture, "svc/vanished", &[]).await;

    fixture.broker.publish(uuid.as_bytes()).await.unwrap();
    fixture.worker.process_next().await.unwrap();
    assert_eq!(fixture.broker.queue_depth().await.unwrap(), 0);
    assert_eq!(fixture.worker.status().completed, 0);
}

#[tokio::test]
async fn malformed_body_dropped() {
    let fixture = fixture(HashMap::new());
    fixture.broker.publish(b"short").await.unwrap();
    fixture.worker.process_next().await.unwrap();
    assert_eq!(fixture.broker.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn result_persisted_under_uuid() {
    let fixture = fixture(HashMap::new());
    let uuid = seed(&fixture, "svc/foo", &[("bar", "v")]).await;

    fixture.broker.publish(uuid.as_bytes()).await.unwrap();
    fixture.worker.process_next().await.unwrap();
    fixture.worker.drain().await;

    let object = fixture
        .store
        .get("results", &uuid.to_hex())
        .await
        .unwrap()
        .unwrap();
    let restored = spindle_store::codec::decompress_object(object).unwrap();
    let value: Value = serde_json::from_slice(&restored.body).unwrap();
    assert_eq!(value["ok"], true);
    assert_eq!(fixture.worker.status().completed, 1);
}

#[tokio::test]
async fn account_cache_survives_catalog_loss() {
    let fixture = fixture(HashMap::new());
    let uuid = seed(&fixture, "svc/foo", &[("bar", "v")]).await;

    // First resolution populates the cache.
    let job = fixture.worker.get_job(&uuid).await.unwrap().unwrap();
    assert_eq!(job.account["bar"], "v");

    // Catalog row disappears; the memoized job still resolves.
    fixture.catalog.delete_reservation(&uuid.to_hex()).await.unwrap();
    let job = fixture.worker.get_job(&uuid).await.unwrap().unwrap();
    assert_eq!(job.function_name, "svc/foo");
}

#[tokio::test]
async fn unknown_reservation_resolves_to_none() {
    let fixture = fixture(HashMap::new());
    let uuid = ReservationId::generate();
    assert!(fixture.worker.get_job(&uuid).await.unwrap().is_none());
}
