use crate::account_cache::AccountCache;
use serde::Serialize;
use spindle_broker::{JobBroker, JobDelivery};
use spindle_core::config::WorkerConfig;
use spindle_core::reservation::service_of;
use spindle_core::{Job, ReservationId, SpindleError};
use spindle_plugin::{ArgSpec, Invoker};
use spindle_store::catalog::Catalog;
use spindle_store::kv::KvCache;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Status counters exposed over HTTP.
#[derive(Debug, Serialize)]
pub struct WorkerStatus {
    pub completed: u64,
    pub queued: usize,
    pub active: usize,
}

/// The worker process: broker consumer, job resolver, plugin dispatcher.
pub struct WorkerServer {
    broker: Arc<dyn JobBroker>,
    catalog: Arc<dyn Catalog>,
    invoker: Arc<Invoker>,
    accounts: AccountCache,
    args_mapping: HashMap<String, HashMap<String, String>>,
    semaphore: Arc<Semaphore>,
    simultaneous_jobs: usize,
    queued: AtomicUsize,
}

impl WorkerServer {
    pub fn new(
        broker: Arc<dyn JobBroker>,
        catalog: Arc<dyn Catalog>,
        invoker: Arc<Invoker>,
        kv: Arc<dyn KvCache>,
        config: &WorkerConfig,
        args_mapping: HashMap<String, HashMap<String, String>>,
    ) -> Self {
        Self {
            broker,
            catalog,
            invoker,
            accounts: AccountCache::new(kv, Duration::from_secs(config.account_cache_ttl_secs)),
            args_mapping,
            semaphore: Arc::new(Semaphore::new(config.simultaneous_jobs)),
            simultaneous_jobs: config.simultaneous_jobs,
            queued: AtomicUsize::new(0),
        }
    }

    pub fn invoker(&self) -> &Arc<Invoker> {
        &self.invoker
    }

    /// The consume loop: runs until the broker closes the consumer.
    pub async fn run(&self) -> Result<(), SpindleError> {
        info!(simultaneous_jobs = self.simultaneous_jobs, "Worker consuming");
        while self.process_next().await? {}
        info!("Broker consumer closed, worker stopping");
        Ok(())
    }

    /// Consume and dispatch one message. Returns false when the consumer
    /// is closed.
    pub async fn process_next(&self) -> Result<bool, SpindleError> {
        let Some(delivery) = self
            .broker
            .next()
            .await
            .map_err(|e| SpindleError::Broker(e.to_string()))?
        else {
            return Ok(false);
        };
        self.handle_delivery(delivery).await;
        Ok(true)
    }

    /// Resolve, acknowledge, dispatch. Every drop path still acks: a
    /// message this worker cannot run is not a message worth redelivering.
    async fn handle_delivery(&self, delivery: JobDelivery) {
        let uuid = match ReservationId::from_slice(&delivery.body) {
            Ok(uuid) => uuid,
            Err(_) => {
                warn!(bytes = delivery.body.len(), "Dropping message with malformed UUID body");
                Self::ack(delivery).await;
                return;
            }
        };
        debug!(uuid = %uuid, "Received reservation");

        let job = match self.get_job(&uuid).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                Self::ack(delivery).await;
                return;
            }
            Err(e) => {
                error!(uuid = %uuid, error = %e, "Job resolution failed, dropping");
                Self::ack(delivery).await;
                return;
            }
        };

        let Some((function_name, plugin)) = self.invoker.registry().resolve(&job.function_name)
        else {
            warn!(uuid = %uuid, function = %job.function_name, "Unknown function, dropping without retry");
            Self::ack(delivery).await;
            return;
        };

        let kwargs = match self.build_kwargs(&job, &plugin.arg_spec()) {
            Ok(kwargs) => kwargs,
            Err(e) => {
                warn!(uuid = %uuid, function = %function_name, error = %e, "Dropping job");
                Self::ack(delivery).await;
                return;
            }
        };

        if self.invoker.is_active(&uuid) {
            debug!(uuid = %uuid, "Fire already active in this worker, dropping duplicate");
            Self::ack(delivery).await;
            return;
        }

        // At-most-once: the ack goes out before the plugin runs. A crash
        // mid-plugin costs this fire; the reservation re-fires on its next
        // interval.
        Self::ack(delivery).await;

        self.queued.fetch_add(1, Ordering::Relaxed);
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("worker semaphore is never closed");
        self.queued.fetch_sub(1, Ordering::Relaxed);

        let invoker = Arc::clone(&self.invoker);
        tokio::spawn(async move {
            let outcome = invoker.invoke(&function_name, kwargs, Some(uuid)).await;
            debug!(uuid = %uuid, outcome = ?outcome, "Fire finished");
            drop(permit);
        });
    }

    async fn ack(delivery: JobDelivery) {
        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "Message acknowledgement failed");
        }
    }

    /// Resolve a reservation UUID into a job: account cache first, catalog
    /// on a miss, write-back on success. `Ok(None)` means the reservation
    /// cannot run (logged) and the message should be dropped.
    pub async fn get_job(&self, uuid: &ReservationId) -> Result<Option<Job>, SpindleError> {
        if let Some(job) = self.accounts.get(uuid).await {
            return Ok(Some(job));
        }

        let hex = uuid.to_hex();
        let Some(row) = self
            .catalog
            .reservation(&hex)
            .await
            .map_err(|e| SpindleError::Catalog(e.to_string()))?
        else {
            warn!(uuid = %hex, "No catalog row for reservation, dropping");
            return Ok(None);
        };

        let service = service_of(&row.function_name).to_string();
        let Some(account) = self
            .catalog
            .account(&service, row.account_id)
            .await
            .map_err(|e| SpindleError::Catalog(e.to_string()))?
        else {
            warn!(uuid = %hex, service = %service, account_id = row.account_id, "No account row, dropping");
            return Ok(None);
        };

        let job = Job {
            function_name: row.function_name,
            uuid: *uuid,
            account,
        };
        self.accounts.put(&job).await;
        Ok(Some(job))
    }

    /// Map account fields onto plugin arguments: per-service column renames
    /// first, then a copy of every declared argument the account carries.
    /// A missing required argument fails the job.
    pub fn build_kwargs(
        &self,
        job: &Job,
        spec: &ArgSpec,
    ) -> Result<HashMap<String, String>, SpindleError> {
        let mut fields = job.account.clone();
        if let Some(renames) = self.args_mapping.get(job.service()) {
            for (from, to) in renames {
                if let Some(value) = fields.remove(from) {
                    fields.insert(to.clone(), value);
                }
            }
        }

        let mut kwargs = HashMap::new();
        for name in &spec.required {
            match fields.get(name) {
                Some(value) => {
                    kwargs.insert(name.clone(), value.clone());
                }
                None => {
                    return Err(SpindleError::MissingArgument {
                        function: job.function_name.clone(),
                        argument: name.clone(),
                    });
                }
            }
        }
        for name in &spec.optional {
            if let Some(value) = fields.get(name) {
                kwargs.insert(name.clone(), value.clone());
            }
        }
        Ok(kwargs)
    }

    /// Wait for every in-flight plugin to finish.
    pub async fn drain(&self) {
        let _all = self
            .semaphore
            .acquire_many(self.simultaneous_jobs as u32)
            .await
            .expect("worker semaphore is never closed");
        info!("In-flight plugins drained");
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            completed: self.invoker.completed_count(),
            queued: self.queued.load(Ordering::Relaxed),
            active: self.invoker.active_count(),
        }
    }
}
