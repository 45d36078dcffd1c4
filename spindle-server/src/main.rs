// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Spindle — distributed recurring-job execution platform
//
//  Roles:      scheduler (heap → broker), worker (broker → plugins),
//              interface (createReservation HTTP)
//  Broker:     AMQP when configured, in-process otherwise
//  Config:     YAML file + SPINDLE_* environment overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use spindle_broker::{AmqpBroker, JobBroker, MemoryBroker};
use spindle_core::SpindleConfig;
use spindle_fetch::{HttpTransport, PageGetter, RequestQueuer};
use spindle_interface::InterfaceServer;
use spindle_plugin::{Invoker, PluginRegistry};
use spindle_scheduler::SchedulerServer;
use spindle_store::blob::BlobStore;
use spindle_store::catalog::Catalog;
use spindle_store::kv::KvCache;
use spindle_store::{MemoryBlobStore, MemoryCatalog, MemoryKv};
use spindle_worker::WorkerServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// Scheduler, worker, and interface in one process.
    All,
    Scheduler,
    Worker,
    Interface,
}

#[derive(Parser, Debug)]
#[command(name = "spindle", version, about = "Spindle — recurring-job execution platform")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Which role(s) this process runs
    #[arg(long, value_enum, default_value = "all")]
    role: Role,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), role = ?cli.role, "Spindle starting");

    // ── Config ──
    let config_path = cli.config.as_ref().and_then(|p| p.to_str());
    let config = SpindleConfig::load(config_path).context("loading configuration")?;

    // ── Plugin registry ──
    let mut registry =
        PluginRegistry::new().with_service_mapping(config.service_mapping.clone());
    spindle_plugins::register_all(&mut registry).context("registering plugins")?;
    info!(plugins = registry.len(), "Plugins registered");
    let registry = Arc::new(registry);

    // ── Stores ──
    // The in-memory drivers back the standalone deployment; production
    // wire drivers implement the same traits outside this tree.
    let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    let kv: Arc<dyn KvCache> = Arc::new(MemoryKv::new());
    let catalog: Arc<dyn Catalog> = Arc::new(MemoryCatalog::new());

    // ── Broker ──
    let broker: Arc<dyn JobBroker> = match &config.broker.uri {
        Some(uri) => {
            let amqp = AmqpBroker::connect(uri, &config.broker)
                .await
                .context("connecting to broker")?;
            info!(queue = %config.broker.queue, "AMQP broker connected");
            Arc::new(amqp)
        }
        None => {
            info!("No broker URI configured, using in-process broker");
            Arc::new(MemoryBroker::new())
        }
    };

    // ── Outbound HTTP ──
    let rq = RequestQueuer::new(Arc::new(HttpTransport::new()), &config.fetch);
    let fetcher = Arc::new(PageGetter::new(
        rq.clone(),
        Arc::clone(&blob),
        &config.cache.bucket,
        config.cache.time_offset_secs,
    ));

    // ── Shared invoker ──
    let invoker = Arc::new(Invoker::new(
        Arc::clone(&registry),
        fetcher,
        Arc::clone(&blob),
        Arc::clone(&catalog),
        config.results.bucket.clone(),
    ));

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
    let mut worker: Option<Arc<WorkerServer>> = None;

    // ── Scheduler role ──
    if matches!(cli.role, Role::All | Role::Scheduler) {
        let scheduler = Arc::new(SchedulerServer::new(
            Arc::clone(&registry),
            Arc::clone(&catalog),
            Arc::clone(&broker),
            config.scheduler.clone(),
            config.broker.high_water,
        ));
        let seeded = scheduler.load_catalog().await.context("seeding heap")?;
        info!(reservations = seeded, addr = %config.scheduler.addr, "Scheduler ready");

        let http = Arc::clone(&scheduler);
        let addr = config.scheduler.addr;
        tasks.spawn(async move { spindle_scheduler::http::serve(http, addr).await });
        tasks.spawn(async move { Ok(scheduler.run().await?) });
    }

    // ── Worker role ──
    if matches!(cli.role, Role::All | Role::Worker) {
        let server = Arc::new(WorkerServer::new(
            Arc::clone(&broker),
            Arc::clone(&catalog),
            Arc::clone(&invoker),
            Arc::clone(&kv),
            &config.worker,
            config.service_args_mapping.clone(),
        ));
        info!(addr = %config.worker.addr, "Worker ready");

        let http = Arc::clone(&server);
        let addr = config.worker.addr;
        tasks.spawn(async move { spindle_worker::http::serve(http, addr).await });
        let consume = Arc::clone(&server);
        tasks.spawn(async move { Ok(consume.run().await?) });
        worker = Some(server);
    }

    // ── Interface role ──
    if matches!(cli.role, Role::All | Role::Interface) {
        let interface = Arc::new(InterfaceServer::new(
            Arc::clone(&invoker),
            rq.clone(),
            config.interface.scheduler_url.clone(),
        ));
        info!(addr = %config.interface.addr, scheduler = %config.interface.scheduler_url, "Interface ready");

        let probe = Arc::clone(&interface);
        tokio::spawn(async move { probe.probe_scheduler().await });
        let addr = config.interface.addr;
        tasks.spawn(async move { spindle_interface::http::serve(interface, addr).await });
    }

    // ── Run until a signal or a fatal task error ──
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
        }
        Some(finished) = tasks.join_next() => {
            match finished {
                Ok(Ok(())) => warn!("A server task exited"),
                Ok(Err(e)) => error!(error = %e, "Server task failed"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Let in-flight plugins finish before tearing the process down.
    if let Some(worker) = worker {
        worker.drain().await;
    }
    tasks.shutdown().await;

    info!("Spindle stopped");
    Ok(())
}
