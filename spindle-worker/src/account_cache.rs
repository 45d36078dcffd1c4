use bytes::Bytes;
use spindle_core::{Job, ReservationId};
use spindle_store::kv::KvCache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Memoized reservation → job mapping backed by the KV service.
///
/// Entries carry the resolved `{function_name, uuid, account}` document and
/// expire after about a week; a miss falls back to the catalog.
pub struct AccountCache {
    kv: Arc<dyn KvCache>,
    ttl: Duration,
}

impl AccountCache {
    pub fn new(kv: Arc<dyn KvCache>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    fn key(uuid: &ReservationId) -> String {
        format!("reservation:{}", uuid.to_hex())
    }

    pub async fn get(&self, uuid: &ReservationId) -> Option<Job> {
        let value = match self.kv.get(&Self::key(uuid)).await {
            Ok(value) => value?,
            Err(e) => {
                warn!(uuid = %uuid, error = %e, "Account cache read failed");
                return None;
            }
        };
        match serde_json::from_slice(&value) {
            Ok(job) => {
                debug!(uuid = %uuid, "Account cache hit");
                Some(job)
            }
            Err(e) => {
                warn!(uuid = %uuid, error = %e, "Discarding undecodable account cache entry");
                None
            }
        }
    }

    pub async fn put(&self, job: &Job) {
        let document = match serde_json::to_vec(job) {
            Ok(document) => document,
            Err(e) => {
                warn!(uuid = %job.uuid, error = %e, "Could not serialize job for account cache");
                return;
            }
        };
        if let Err(e) = self
            .kv
            .set(&Self::key(&job.uuid), Bytes::from(document), self.ttl)
            .await
        {
            warn!(uuid = %job.uuid, error = %e, "Account cache write failed");
        }
    }

    pub async fn invalidate(&self, uuid: &ReservationId) {
        if let Err(e) = self.kv.delete(&Self::key(uuid)).await {
            warn!(uuid = %uuid, error = %e, "Account cache invalidation failed");
        }
    }
}
