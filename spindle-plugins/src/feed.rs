use async_trait::async_trait;
use serde_json::Value;
use spindle_fetch::{CacheMode, GetOptions, PageRequest};
use spindle_plugin::{ArgSpec, Plugin, PluginCall, PluginError};
use tracing::debug;

/// `feed/latest` — fetch a feed URL through the caching fetcher and report
/// what came back.
///
/// Required: `feed_url`. Optional: `max_bytes` caps how much of the body is
/// summarized.
pub struct LatestPlugin;

#[async_trait]
impl Plugin for LatestPlugin {
    fn name(&self) -> &str {
        "feed/latest"
    }

    fn interval(&self) -> u64 {
        // 5 minutes between fires.
        300
    }

    fn arg_spec(&self) -> ArgSpec {
        ArgSpec::default()
            .required(&["feed_url"])
            .optional(&["max_bytes"])
    }

    async fn call(&self, call: PluginCall) -> Result<Option<Value>, PluginError> {
        let feed_url = call
            .arg("feed_url")
            .ok_or_else(|| PluginError::Failed("feed_url missing".to_string()))?
            .to_string();
        let max_bytes: usize = call
            .arg("max_bytes")
            .and_then(|v| v.parse().ok())
            .unwrap_or(4096);

        let mut options = GetOptions::new(PageRequest::get(&feed_url));
        options.cache = CacheMode::Revalidate;
        let page = call
            .fetcher
            .get_page(options)
            .await
            .map_err(|e| PluginError::Failed(format!("fetch of {} failed: {}", feed_url, e)))?;

        debug!(url = %feed_url, cache_hit = page.cache_hit, "Feed fetched");
        let preview_len = page.response.body.len().min(max_bytes);
        Ok(Some(serde_json::json!({
            "url": feed_url,
            "status": page.response.status,
            "content_sha1": page.content_sha1,
            "length": page.response.body.len(),
            "cache_hit": page.cache_hit,
            "preview": String::from_utf8_lossy(&page.response.body[..preview_len]),
        })))
    }
}
