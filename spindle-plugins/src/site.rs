use async_trait::async_trait;
use serde_json::Value;
use spindle_fetch::{CacheMode, FetchError, GetOptions, PageRequest};
use spindle_plugin::{ArgSpec, Plugin, PluginCall, PluginError};
use tracing::{debug, info};

/// `site/monitor` — watch a page for content changes.
///
/// Carries the last observed body SHA-1 in the reservation's fast cache
/// and hands it to the fetcher, so an unchanged page costs a stale-content
/// short-circuit instead of a stored result. An account flagged
/// `disabled=true` deletes its own reservation.
pub struct MonitorPlugin;

#[async_trait]
impl Plugin for MonitorPlugin {
    fn name(&self) -> &str {
        "site/monitor"
    }

    fn interval(&self) -> u64 {
        // Hourly checks.
        3600
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::default()
            .required(&["site_url"])
            .optional(&["disabled"])
            .wants_uuid()
            .wants_fast_cache()
    }

    async fn call(&self, call: PluginCall) -> Result<Option<Value>, PluginError> {
        if call.arg("disabled") == Some("true") {
            return Err(PluginError::DeleteReservation);
        }
        let site_url = call
            .arg("site_url")
            .ok_or_else(|| PluginError::Failed("site_url missing".to_string()))?
            .to_string();

        let last_sha1 = call
            .fast_cache
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).to_string());

        let mut options = GetOptions::new(PageRequest::get(&site_url));
        options.cache = CacheMode::Revalidate;
        options.content_sha1 = last_sha1.clone();

        match call.fetcher.get_page(options).await {
            Ok(page) => {
                call.set_fast_cache(page.content_sha1.clone());
                let changed = last_sha1.is_some();
                if changed {
                    info!(url = %site_url, sha1 = %page.content_sha1, "Monitored site changed");
                }
                Ok(Some(serde_json::json!({
                    "url": site_url,
                    "content_sha1": page.content_sha1,
                    "changed": changed,
                    "previous_sha1": last_sha1,
                })))
            }
            // Unchanged since the last fire: nothing to store.
            Err(FetchError::StaleContent(sha1)) => {
                debug!(url = %site_url, sha1 = %sha1, "Monitored site unchanged");
                Ok(None)
            }
            Err(e) => Err(PluginError::Failed(format!(
                "fetch of {} failed: {}",
                site_url, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use spindle_core::config::FetchConfig;
    use spindle_core::ReservationId;
    use spindle_fetch::{PageGetter, PageResponse, RequestQueuer, Transport};
    use spindle_plugin::FastCacheStore;
    use spindle_store::blob::BlobStore;
    use spindle_store::MemoryBlobStore;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct FixedTransport {
        body: &'static str,
    }

    #[async_trait]
    impl Transport for FixedTransport {
        async fn fetch(&self, _request: &PageRequest) -> Result<PageResponse, FetchError> {
            Ok(PageResponse {
                body: Bytes::from_static(self.body.as_bytes()),
                headers: HashMap::new(),
                status: 200,
                message: "OK".to_string(),
            })
        }
    }

    fn call_for(
        transport: FixedTransport,
        fast_caches: FastCacheStore,
        uuid: ReservationId,
        args: &[(&str, &str)],
    ) -> PluginCall {
        let store = Arc::new(MemoryBlobStore::new());
        let rq = RequestQueuer::new(Arc::new(transport), &FetchConfig::default());
        let fetcher = Arc::new(PageGetter::new(
            rq,
            store as Arc<dyn BlobStore>,
            "http-cache",
            0,
        ));
        let fast_cache = fast_caches.get(&uuid);
        PluginCall {
            args: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            reservation_uuid: Some(uuid),
            fast_cache,
            fetcher,
            fast_caches,
        }
    }

    #[tokio::test]
    async fn test_first_fire_records_sha1() {
        let fast_caches = FastCacheStore::new();
        let uuid = ReservationId::generate();
        let call = call_for(
            FixedTransport { body: "PAGE" },
            fast_caches.clone(),
            uuid,
            &[("site_url", "http://example.com/")],
        );

        let value = MonitorPlugin.call(call).await.unwrap().unwrap();
        assert_eq!(value["changed"], false);
        let stored = fast_caches.get(&uuid).unwrap();
        assert_eq!(
            String::from_utf8_lossy(&stored),
            spindle_fetch::pagegetter::sha1_hex(b"PAGE")
        );
    }

    #[tokio::test]
    async fn test_unchanged_site_returns_nothing() {
        let fast_caches = FastCacheStore::new();
        let uuid = ReservationId::generate();
        fast_caches.set(uuid, spindle_fetch::pagegetter::sha1_hex(b"PAGE"));
        let call = call_for(
            FixedTransport { body: "PAGE" },
            fast_caches.clone(),
            uuid,
            &[("site_url", "http://example.com/")],
        );

        let result = MonitorPlugin.call(call).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_changed_site_reports_change() {
        let fast_caches = FastCacheStore::new();
        let uuid = ReservationId::generate();
        fast_caches.set(uuid, spindle_fetch::pagegetter::sha1_hex(b"OLD"));
        let call = call_for(
            FixedTransport { body: "NEW" },
            fast_caches.clone(),
            uuid,
            &[("site_url", "http://example.com/")],
        );

        let value = MonitorPlugin.call(call).await.unwrap().unwrap();
        assert_eq!(value["changed"], true);
        assert_eq!(
            value["previous_sha1"],
            spindle_fetch::pagegetter::sha1_hex(b"OLD")
        );
    }

    #[tokio::test]
    async fn test_disabled_account_deletes_reservation() {
        let fast_caches = FastCacheStore::new();
        let uuid = ReservationId::generate();
        let call = call_for(
            FixedTransport { body: "PAGE" },
            fast_caches,
            uuid,
            &[("site_url", "http://example.com/"), ("disabled", "true")],
        );

        let err = MonitorPlugin.call(call).await.unwrap_err();
        assert!(matches!(err, PluginError::DeleteReservation));
    }
}
