use crate::heap::{HeapEntry, ReservationHeap};
use chrono::Utc;
use serde::Serialize;
use spindle_broker::JobBroker;
use spindle_core::config::SchedulerConfig;
use spindle_core::{ReservationId, SpindleError};
use spindle_plugin::PluginRegistry;
use spindle_store::catalog::Catalog;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A live addition waiting to join the heap.
struct LiveAdd {
    uuid: String,
    function_name: String,
}

/// Telemetry snapshot for the status endpoint.
#[derive(Debug, Serialize)]
pub struct SchedulerStatus {
    pub heap_size: usize,
    pub queue_depth: u64,
    pub published: u64,
    pub next_fire: Option<i64>,
}

/// The scheduler: catalog-seeded heap, broker publisher, live-add intake.
pub struct SchedulerServer {
    registry: Arc<PluginRegistry>,
    catalog: Arc<dyn Catalog>,
    broker: Arc<dyn JobBroker>,
    heap: Mutex<ReservationHeap>,
    intake_tx: mpsc::UnboundedSender<LiveAdd>,
    intake_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<LiveAdd>>,
    config: SchedulerConfig,
    high_water: u64,
    cached_depth: AtomicU64,
    depth_probed_at: Mutex<Option<Instant>>,
    published: AtomicU64,
}

impl SchedulerServer {
    pub fn new(
        registry: Arc<PluginRegistry>,
        catalog: Arc<dyn Catalog>,
        broker: Arc<dyn JobBroker>,
        config: SchedulerConfig,
        high_water: u64,
    ) -> Self {
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            catalog,
            broker,
            heap: Mutex::new(ReservationHeap::new()),
            intake_tx,
            intake_rx: tokio::sync::Mutex::new(intake_rx),
            config,
            high_water,
            cached_depth: AtomicU64::new(0),
            depth_probed_at: Mutex::new(None),
            published: AtomicU64::new(0),
        }
    }

    /// Seed the heap from the catalog in chunks. A catalog failure aborts
    /// startup; unknown function names are skipped.
    pub async fn load_catalog(&self) -> Result<usize, SpindleError> {
        let chunk_size = self.config.catalog_chunk;
        let mut offset = 0u64;
        let mut added = 0usize;
        loop {
            let rows = self
                .catalog
                .reservation_chunk(offset, chunk_size)
                .await
                .map_err(|e| SpindleError::Catalog(e.to_string()))?;
            let count = rows.len() as u64;
            let now = Utc::now().timestamp();
            for row in rows {
                if self.add_to_heap(&row.uuid, &row.function_name, now) {
                    added += 1;
                }
            }
            if count < chunk_size {
                break;
            }
            offset += chunk_size;
        }
        info!(reservations = added, "Heap seeded from catalog");
        Ok(added)
    }

    /// Insert one reservation, resolving its plugin for the interval.
    /// Returns false (logged) when the UUID or function name is unusable.
    pub fn add_to_heap(&self, uuid: &str, function_name: &str, now: i64) -> bool {
        let Some(interval) = self.registry.interval(function_name) else {
            warn!(function = %function_name, uuid = %uuid, "No interval for function, skipping reservation");
            return false;
        };
        let Ok(id) = ReservationId::from_hex(uuid) else {
            error!(uuid = %uuid, "Could not decode reservation UUID");
            return false;
        };
        let next_fire = now + interval as i64;
        debug!(uuid = %uuid, next_fire, interval, "Adding reservation to heap");
        self.heap.lock().unwrap().push(HeapEntry {
            next_fire,
            uuid: *id.as_bytes(),
            interval,
        });
        true
    }

    /// Accept a live addition from the HTTP surface. Validation failures
    /// are logged, never surfaced to the caller.
    pub fn live_add(&self, uuid: &str, function_name: &str) {
        debug!(uuid = %uuid, function = %function_name, "Live addition received");
        let _ = self.intake_tx.send(LiveAdd {
            uuid: uuid.to_string(),
            function_name: function_name.to_string(),
        });
    }

    fn drain_intake(&self, intake: &mut mpsc::UnboundedReceiver<LiveAdd>, now: i64) {
        while let Ok(add) = intake.try_recv() {
            self.add_to_heap(&add.uuid, &add.function_name, now);
        }
    }

    /// Queue depth, probed at most every `depth_refresh_secs`.
    async fn queue_depth(&self) -> u64 {
        let refresh = Duration::from_secs(self.config.depth_refresh_secs);
        let stale = {
            let probed = self.depth_probed_at.lock().unwrap();
            probed.map(|at| at.elapsed() >= refresh).unwrap_or(true)
        };
        if stale {
            match self.broker.queue_depth().await {
                Ok(depth) => {
                    self.cached_depth.store(depth, Ordering::Relaxed);
                    *self.depth_probed_at.lock().unwrap() = Some(Instant::now());
                }
                Err(e) => {
                    warn!(error = %e, "Queue depth probe failed, reusing cached value");
                }
            }
        }
        self.cached_depth.load(Ordering::Relaxed)
    }

    /// One enqueue tick: drain live additions, then publish every due
    /// reservation (bounded per tick) unless the queue is over the
    /// high-water mark. Publish order mirrors heap order. A publish
    /// failure aborts the tick; the scheduler would rather lose forward
    /// progress than silently drop fires.
    pub async fn tick(&self, now: i64) -> Result<usize, SpindleError> {
        {
            let mut intake = self.intake_rx.lock().await;
            self.drain_intake(&mut intake, now);
        }

        let depth = self.queue_depth().await;
        if depth >= self.high_water {
            warn!(
                depth,
                high_water = self.high_water,
                "Queue at or beyond high-water mark, pausing publishing"
            );
            return Ok(0);
        }

        let due = self
            .heap
            .lock()
            .unwrap()
            .pop_due(now, self.config.max_per_tick);
        if due.is_empty() {
            return Ok(0);
        }

        info!(count = due.len(), "Publishing due reservations");
        for entry in &due {
            if let Err(e) = self.broker.publish(&entry.uuid).await {
                error!(error = %e, "Broker publish failed");
                return Err(SpindleError::Broker(e.to_string()));
            }
            self.heap.lock().unwrap().push(HeapEntry {
                next_fire: now + entry.interval as i64,
                ..*entry
            });
        }
        let count = due.len();
        self.published.fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }

    /// The enqueue loop. Runs until a publish failure.
    pub async fn run(&self) -> Result<(), SpindleError> {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick(Utc::now().timestamp()).await?;
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let heap = self.heap.lock().unwrap();
        SchedulerStatus {
            heap_size: heap.len(),
            queue_depth: self.cached_depth.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            next_fire: heap.next_fire(),
        }
    }

    pub fn heap_size(&self) -> usize {
        self.heap.lock().unwrap().len()
    }
}
