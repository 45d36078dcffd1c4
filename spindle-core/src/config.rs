use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Top-level configuration for the Spindle platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpindleConfig {
    /// Node ID (auto-generated if not set)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Outbound HTTP client limits
    #[serde(default)]
    pub fetch: FetchConfig,

    /// HTTP cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Plugin result storage
    #[serde(default)]
    pub results: ResultsConfig,

    /// Message broker configuration
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Interface configuration
    #[serde(default)]
    pub interface: InterfaceConfig,

    /// Rewrites a reservation's function name at resolution time
    /// (legacy plugin name → replacement).
    #[serde(default)]
    pub service_mapping: HashMap<String, String>,

    /// Per-service account-column → plugin-argument renames, applied by the
    /// worker before argument copy.
    #[serde(default)]
    pub service_args_mapping: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum simultaneous requests across all hosts (0 = effectively unlimited)
    #[serde(default = "default_max_simultaneous")]
    pub max_simultaneous: usize,

    /// Maximum requests per host per second (0 = unlimited rate)
    #[serde(default = "default_requests_per_host_per_second")]
    pub max_requests_per_host_per_second: f64,

    /// Maximum simultaneous requests per host (0 = global max)
    #[serde(default = "default_max_simultaneous_per_host")]
    pub max_simultaneous_per_host: usize,

    /// Default request timeout (seconds)
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,

    /// Default user agent
    #[serde(default = "default_agent")]
    pub agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Blob bucket holding the HTTP cache
    #[serde(default = "default_cache_bucket")]
    pub bucket: String,

    /// Await cache writes before completing a fetch
    #[serde(default)]
    pub confirm_writes: bool,

    /// Offset applied to failure/change timestamps (seconds)
    #[serde(default)]
    pub time_offset_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    /// Blob bucket for plugin results; when unset, results are discarded
    #[serde(default = "default_results_bucket")]
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// AMQP URI; when unset, the in-process broker is used
    #[serde(default)]
    pub uri: Option<String>,

    /// Queue name (durable, non-exclusive, non-auto-delete)
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Fanout exchange name
    #[serde(default = "default_exchange")]
    pub exchange: String,

    /// Per-consumer unacked prefetch bound
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,

    /// Queue depth above which the scheduler pauses publishing
    #[serde(default = "default_high_water")]
    pub high_water: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Live-add / status listener address
    #[serde(default = "default_scheduler_addr")]
    pub addr: SocketAddr,

    /// Enqueue tick period (milliseconds)
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Maximum reservations published per tick
    #[serde(default = "default_max_per_tick")]
    pub max_per_tick: usize,

    /// Queue-depth probe refresh period (seconds)
    #[serde(default = "default_depth_refresh")]
    pub depth_refresh_secs: u64,

    /// Catalog scan chunk size at startup
    #[serde(default = "default_catalog_chunk")]
    pub catalog_chunk: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Status listener address
    #[serde(default = "default_worker_addr")]
    pub addr: SocketAddr,

    /// Maximum concurrent plugin executions per worker process
    #[serde(default = "default_simultaneous_jobs")]
    pub simultaneous_jobs: usize,

    /// Account cache entry TTL (seconds)
    #[serde(default = "default_account_cache_ttl")]
    pub account_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// createReservation listener address
    #[serde(default = "default_interface_addr")]
    pub addr: SocketAddr,

    /// Scheduler peer base URL for remoteaddtoheap notifications
    #[serde(default = "default_scheduler_url")]
    pub scheduler_url: String,
}

impl SpindleConfig {
    /// Load configuration from a YAML file + environment variables.
    pub fn load(config_path: Option<&str>) -> Result<Self, figment::Error> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["spindle.yaml", "/etc/spindle/spindle.yaml", "config/spindle.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        // Environment variables override: SPINDLE_WORKER__SIMULTANEOUS_JOBS, etc.
        figment = figment.merge(Env::prefixed("SPINDLE_").split("__"));

        figment.extract()
    }

    /// Argument renames for a service, if any.
    pub fn args_mapping(&self, service: &str) -> Option<&HashMap<String, String>> {
        self.service_args_mapping.get(service)
    }
}

// Default implementations

impl Default for SpindleConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            fetch: FetchConfig::default(),
            cache: CacheConfig::default(),
            results: ResultsConfig::default(),
            broker: BrokerConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            interface: InterfaceConfig::default(),
            service_mapping: HashMap::new(),
            service_args_mapping: HashMap::new(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_simultaneous: default_max_simultaneous(),
            max_requests_per_host_per_second: default_requests_per_host_per_second(),
            max_simultaneous_per_host: default_max_simultaneous_per_host(),
            timeout_secs: default_fetch_timeout(),
            agent: default_agent(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            bucket: default_cache_bucket(),
            confirm_writes: false,
            time_offset_secs: 0,
        }
    }
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            bucket: default_results_bucket(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: None,
            queue: default_queue(),
            exchange: default_exchange(),
            prefetch: default_prefetch(),
            high_water: default_high_water(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            addr: default_scheduler_addr(),
            tick_ms: default_tick_ms(),
            max_per_tick: default_max_per_tick(),
            depth_refresh_secs: default_depth_refresh(),
            catalog_chunk: default_catalog_chunk(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            addr: default_worker_addr(),
            simultaneous_jobs: default_simultaneous_jobs(),
            account_cache_ttl_secs: default_account_cache_ttl(),
        }
    }
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            addr: default_interface_addr(),
            scheduler_url: default_scheduler_url(),
        }
    }
}

// Serde default functions

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_max_simultaneous() -> usize {
    50
}

fn default_requests_per_host_per_second() -> f64 {
    1.0
}

fn default_max_simultaneous_per_host() -> usize {
    5
}

fn default_fetch_timeout() -> u64 {
    60
}

fn default_agent() -> String {
    "Spindle".to_string()
}

fn default_cache_bucket() -> String {
    "spindle-http-cache".to_string()
}

fn default_results_bucket() -> Option<String> {
    Some("spindle-results".to_string())
}

fn default_queue() -> String {
    "spindle".to_string()
}

fn default_exchange() -> String {
    "spindle".to_string()
}

fn default_prefetch() -> u16 {
    1000
}

fn default_high_water() -> u64 {
    100_000
}

fn default_scheduler_addr() -> SocketAddr {
    "0.0.0.0:5004".parse().unwrap()
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_max_per_tick() -> usize {
    1000
}

fn default_depth_refresh() -> u64 {
    60
}

fn default_catalog_chunk() -> u64 {
    10_000
}

fn default_worker_addr() -> SocketAddr {
    "0.0.0.0:5005".parse().unwrap()
}

fn default_simultaneous_jobs() -> usize {
    20
}

fn default_account_cache_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_interface_addr() -> SocketAddr {
    "0.0.0.0:5000".parse().unwrap()
}

fn default_scheduler_url() -> String {
    "http://127.0.0.1:5004".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = SpindleConfig::default();
        assert_eq!(cfg.fetch.max_simultaneous, 50);
        assert_eq!(cfg.fetch.max_requests_per_host_per_second, 1.0);
        assert_eq!(cfg.fetch.max_simultaneous_per_host, 5);
        assert_eq!(cfg.broker.high_water, 100_000);
        assert_eq!(cfg.broker.prefetch, 1000);
        assert_eq!(cfg.scheduler.max_per_tick, 1000);
        assert_eq!(cfg.scheduler.catalog_chunk, 10_000);
        assert_eq!(cfg.worker.simultaneous_jobs, 20);
        assert_eq!(cfg.worker.account_cache_ttl_secs, 604_800);
        assert!(cfg.broker.uri.is_none());
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
fetch:
  max_simultaneous: 100
  max_requests_per_host_per_second: 0
worker:
  simultaneous_jobs: 5
service_mapping:
  legacy/feed: feed/latest
service_args_mapping:
  svc:
    baz: bar
"#;
        let cfg: SpindleConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.fetch.max_simultaneous, 100);
        assert_eq!(cfg.fetch.max_requests_per_host_per_second, 0.0);
        assert_eq!(cfg.worker.simultaneous_jobs, 5);
        assert_eq!(cfg.service_mapping["legacy/feed"], "feed/latest");
        assert_eq!(cfg.args_mapping("svc").unwrap()["baz"], "bar");
        assert!(cfg.args_mapping("other").is_none());
        // Untouched sections keep defaults.
        assert_eq!(cfg.scheduler.tick_ms, 1000);
    }
}
