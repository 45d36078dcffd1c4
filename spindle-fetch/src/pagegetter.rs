use crate::client::{PageRequest, PageResponse};
use crate::queuer::RequestQueuer;
use crate::FetchError;
use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};
use spindle_store::blob::{BlobObject, BlobStore};
use spindle_store::codec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Side-channel metadata keys carried with every cache entry.
const CONTENT_SHA1: &str = "content-sha1";
const CACHE_EXPIRES: &str = "cache-expires";
const CACHE_ETAG: &str = "cache-etag";
const CACHE_LAST_MODIFIED: &str = "cache-last-modified";
const CONTENT_CHANGES: &str = "content-changes";
const REQUEST_FAILURES: &str = "request-failures";

/// Retention bounds for the side-channel histories.
const MAX_CONTENT_CHANGES: usize = 10;
const MAX_REQUEST_FAILURES: usize = 3;

/// Cache behavior for a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Ignore the cache on read; still write through on success.
    Bypass,
    /// Serve unexpired entries; revalidate expired ones with a
    /// conditional GET.
    #[default]
    Revalidate,
    /// Serve the cache immediately if an entry exists.
    CacheFirst,
}

impl CacheMode {
    /// The wire encoding: −1 bypass, 0 revalidate, 1 cache-first.
    pub fn from_int(mode: i64) -> Option<Self> {
        match mode {
            -1 => Some(CacheMode::Bypass),
            0 => Some(CacheMode::Revalidate),
            1 => Some(CacheMode::CacheFirst),
            _ => None,
        }
    }
}

/// Options for a cached fetch.
#[derive(Debug, Clone)]
pub struct GetOptions {
    pub request: PageRequest,
    /// Alias URL for cache-key derivation, letting callers coalesce
    /// equivalent URLs.
    pub hash_url: Option<String>,
    pub cache: CacheMode,
    /// SHA-1 the caller already holds; a response hashing to this value
    /// fails with `StaleContent` instead of returning the body again.
    pub content_sha1: Option<String>,
    /// Await the cache write before completing.
    pub confirm_cache_write: bool,
}

impl GetOptions {
    pub fn new(request: PageRequest) -> Self {
        Self {
            request,
            hash_url: None,
            cache: CacheMode::default(),
            content_sha1: None,
            confirm_cache_write: false,
        }
    }
}

/// A fetch result: the response plus the cache's view of it.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub response: PageResponse,
    /// SHA-1 of the returned body, always present.
    pub content_sha1: String,
    pub cache_hit: bool,
}

/// Parsed side-channel state of a cache entry.
#[derive(Debug, Clone, Default)]
struct CacheMeta {
    content_sha1: Option<String>,
    expires: Option<String>,
    etag: Option<String>,
    last_modified: Option<String>,
    content_changes: Vec<String>,
    request_failures: Vec<String>,
}

impl CacheMeta {
    fn from_headers(headers: &HashMap<String, String>) -> Self {
        let split = |key: &str| -> Vec<String> {
            headers
                .get(key)
                .map(|v| {
                    v.split(',')
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            content_sha1: headers.get(CONTENT_SHA1).cloned(),
            expires: headers.get(CACHE_EXPIRES).cloned(),
            etag: headers.get(CACHE_ETAG).cloned(),
            last_modified: headers.get(CACHE_LAST_MODIFIED).cloned(),
            content_changes: split(CONTENT_CHANGES),
            request_failures: split(REQUEST_FAILURES),
        }
    }

    fn to_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        if let Some(ref sha1) = self.content_sha1 {
            headers.insert(CONTENT_SHA1.to_string(), sha1.clone());
        }
        if let Some(ref expires) = self.expires {
            headers.insert(CACHE_EXPIRES.to_string(), expires.clone());
        }
        if let Some(ref etag) = self.etag {
            headers.insert(CACHE_ETAG.to_string(), etag.clone());
        }
        if let Some(ref last_modified) = self.last_modified {
            headers.insert(CACHE_LAST_MODIFIED.to_string(), last_modified.clone());
        }
        if !self.content_changes.is_empty() {
            headers.insert(CONTENT_CHANGES.to_string(), self.content_changes.join(","));
        }
        if !self.request_failures.is_empty() {
            headers.insert(REQUEST_FAILURES.to_string(), self.request_failures.join(","));
        }
        headers
    }

    /// True when the entry carries an expiry that is still in the future.
    fn fresh_until_expiry(&self) -> bool {
        self.expires
            .as_deref()
            .and_then(parse_http_date)
            .map(|expires| expires > Utc::now())
            .unwrap_or(false)
    }
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Conditional HTTP cache persisted in the blob store.
///
/// Cache entries are keyed by SHA-1 over (url-or-hash_url, headers, agent,
/// cookies). Each entry carries the body SHA-1, the upstream's caching
/// headers, the last content-change timestamps and the last failure
/// timestamps as side-channel metadata.
pub struct PageGetter {
    rq: RequestQueuer,
    store: Arc<dyn BlobStore>,
    bucket: String,
    time_offset: i64,
}

impl PageGetter {
    pub fn new(rq: RequestQueuer, store: Arc<dyn BlobStore>, bucket: &str, time_offset: i64) -> Self {
        Self {
            rq,
            store,
            bucket: bucket.to_string(),
            time_offset,
        }
    }

    /// The underlying request queuer, for uncached calls.
    pub fn queuer(&self) -> &RequestQueuer {
        &self.rq
    }

    /// Empty the cache bucket.
    pub async fn clear_cache(&self) -> Result<(), FetchError> {
        Ok(self.store.clear_bucket(&self.bucket).await?)
    }

    /// Make a cached HTTP request.
    pub async fn get_page(&self, opts: GetOptions) -> Result<FetchedPage, FetchError> {
        let key = request_hash(&opts);

        // Non-GET methods pass straight through; only the stale post-check
        // applies.
        if opts.request.method.to_ascii_uppercase() != "GET" {
            let response = self.rq.get_page(opts.request.clone()).await?;
            let content_sha1 = sha1_hex(&response.body);
            check_stale(opts.content_sha1.as_deref(), &content_sha1)?;
            return Ok(FetchedPage {
                response,
                content_sha1,
                cache_hit: false,
            });
        }

        match opts.cache {
            CacheMode::Bypass => {
                debug!(key = %key, url = %opts.request.url, "Cache bypass fetch");
                // The read side is bypassed; the side-channel histories are
                // still carried forward on the write side.
                let history = self
                    .store
                    .head(&self.bucket, &key)
                    .await?
                    .map(|headers| CacheMeta::from_headers(&headers));
                self.fetch_and_store(&opts, &key, history).await
            }
            CacheMode::CacheFirst => match self.store.get(&self.bucket, &key).await? {
                Some(object) if !object.body.is_empty() => self.serve_cached(object, &opts),
                existing => {
                    debug!(key = %key, url = %opts.request.url, "Cache miss, fetching");
                    let history = existing.map(|o| CacheMeta::from_headers(&o.metadata));
                    self.fetch_and_store(&opts, &key, history).await
                }
            },
            CacheMode::Revalidate => match self.store.head(&self.bucket, &key).await? {
                Some(headers) => self.revalidate(&opts, &key, headers).await,
                None => {
                    debug!(key = %key, url = %opts.request.url, "No cache entry, fetching");
                    self.fetch_and_store(&opts, &key, None).await
                }
            },
        }
    }

    /// Revalidate an existing entry: serve it while unexpired, otherwise
    /// issue a conditional GET with the stored validators.
    async fn revalidate(
        &self,
        opts: &GetOptions,
        key: &str,
        headers: HashMap<String, String>,
    ) -> Result<FetchedPage, FetchError> {
        let meta = CacheMeta::from_headers(&headers);

        if meta.fresh_until_expiry() {
            if let (Some(requested), Some(stored)) = (&opts.content_sha1, &meta.content_sha1) {
                if requested == stored {
                    debug!(key = %key, "Unexpired entry matches caller's SHA-1");
                    return Err(FetchError::StaleContent(stored.clone()));
                }
            }
            match self.store.get(&self.bucket, key).await? {
                Some(object) if !object.body.is_empty() => {
                    return self.serve_cached(object, opts);
                }
                // Head said yes but the body is gone; eventual consistency.
                _ => return self.fetch_and_store(opts, key, Some(meta)).await,
            }
        }

        let mut conditional = opts.request.clone();
        conditional.etag = meta.etag.clone();
        conditional.last_modified = meta.last_modified.clone();

        match self.rq.get_page(conditional).await {
            Ok(response) => self.store_fresh(response, key, opts, Some(meta)).await,
            Err(FetchError::Http { status: 304, .. }) => {
                if let (Some(requested), Some(stored)) = (&opts.content_sha1, &meta.content_sha1) {
                    if requested == stored {
                        debug!(key = %key, "304 confirms caller's SHA-1 is current");
                        return Err(FetchError::StaleContent(stored.clone()));
                    }
                }
                debug!(key = %key, "Not modified upstream, serving cache");
                match self.store.get(&self.bucket, key).await? {
                    Some(object) if !object.body.is_empty() => self.serve_cached(object, opts),
                    _ => self.fetch_and_store(opts, key, Some(meta)).await,
                }
            }
            Err(error) => {
                self.record_failure(key, Some(meta), opts.confirm_cache_write)
                    .await;
                Err(error)
            }
        }
    }

    /// Plain fetch with write-through on success and failure-history
    /// recording on error.
    async fn fetch_and_store(
        &self,
        opts: &GetOptions,
        key: &str,
        history: Option<CacheMeta>,
    ) -> Result<FetchedPage, FetchError> {
        match self.rq.get_page(opts.request.clone()).await {
            Ok(response) => self.store_fresh(response, key, opts, history).await,
            Err(error) => {
                error!(key = %key, url = %opts.request.url, error = %error, "Fetch failed");
                self.record_failure(key, history, opts.confirm_cache_write)
                    .await;
                Err(error)
            }
        }
    }

    /// Hash, change-detect, and persist a fresh response.
    async fn store_fresh(
        &self,
        response: PageResponse,
        key: &str,
        opts: &GetOptions,
        history: Option<CacheMeta>,
    ) -> Result<FetchedPage, FetchError> {
        let content_sha1 = sha1_hex(&response.body);
        let prior_sha1 = history.as_ref().and_then(|h| h.content_sha1.clone());

        // Unchanged body: nothing to rewrite.
        if prior_sha1.as_deref() == Some(content_sha1.as_str()) {
            check_stale(opts.content_sha1.as_deref(), &content_sha1)?;
            return Ok(FetchedPage {
                response,
                content_sha1,
                cache_hit: false,
            });
        }

        let no_cache = response
            .header("cache-control")
            .map(|v| v.contains("no-cache"))
            .unwrap_or(false);

        if !no_cache && !response.body.is_empty() {
            let mut meta = history.unwrap_or_default();
            if prior_sha1.is_some() {
                meta.content_changes.push(self.now_ts().to_string());
                let excess = meta.content_changes.len().saturating_sub(MAX_CONTENT_CHANGES);
                meta.content_changes.drain(..excess);
            }
            meta.content_sha1 = Some(content_sha1.clone());
            meta.expires = response.header("expires").map(|v| v.to_string());
            meta.etag = response.header("etag").map(|v| v.to_string());
            meta.last_modified = response.header("last-modified").map(|v| v.to_string());

            let content_type = response
                .header("content-type")
                .unwrap_or("text/plain")
                .to_string();
            let object = BlobObject::new(response.body.clone(), &content_type)
                .with_metadata(meta.to_headers());
            self.write_entry(key, object, opts.confirm_cache_write).await;
        }

        check_stale(opts.content_sha1.as_deref(), &content_sha1)?;
        Ok(FetchedPage {
            response,
            content_sha1,
            cache_hit: false,
        })
    }

    /// Return a cached body, remapping side-channel keys back onto the
    /// standard header names.
    fn serve_cached(&self, object: BlobObject, opts: &GetOptions) -> Result<FetchedPage, FetchError> {
        let object = codec::decompress_object(object)?;
        let meta = CacheMeta::from_headers(&object.metadata);
        let content_sha1 = meta
            .content_sha1
            .clone()
            .unwrap_or_else(|| sha1_hex(&object.body));
        check_stale(opts.content_sha1.as_deref(), &content_sha1)?;

        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), object.content_type.clone());
        if let Some(expires) = meta.expires {
            headers.insert("expires".to_string(), expires);
        }
        if let Some(etag) = meta.etag {
            headers.insert("etag".to_string(), etag);
        }
        if let Some(last_modified) = meta.last_modified {
            headers.insert("last-modified".to_string(), last_modified);
        }

        Ok(FetchedPage {
            response: PageResponse {
                body: object.body,
                headers,
                status: 304,
                message: "Not Modified".to_string(),
            },
            content_sha1,
            cache_hit: true,
        })
    }

    /// Append a failure timestamp (last 3 retained) so subsequent calls see
    /// the failure history even when no body was ever cached.
    async fn record_failure(&self, key: &str, history: Option<CacheMeta>, confirm: bool) {
        let mut meta = history.unwrap_or_default();
        meta.request_failures.push(self.now_ts().to_string());
        let excess = meta
            .request_failures
            .len()
            .saturating_sub(MAX_REQUEST_FAILURES);
        meta.request_failures.drain(..excess);

        debug!(key = %key, failures = meta.request_failures.len(), "Recording request failure");
        let stub = BlobObject::new("", "text/plain").with_metadata(meta.to_headers());
        self.write_entry(key, stub, confirm).await;
    }

    /// Persist a cache entry, gzipped; synchronously when the caller asked
    /// to confirm the write, otherwise in the background.
    async fn write_entry(&self, key: &str, object: BlobObject, confirm: bool) {
        let object = if object.body.is_empty() {
            object
        } else {
            match codec::compress_object(object) {
                Ok(compressed) => compressed,
                Err(e) => {
                    error!(key = %key, error = %e, "Could not compress cache entry");
                    return;
                }
            }
        };

        if confirm {
            if let Err(e) = self.store.put(&self.bucket, key, object).await {
                error!(key = %key, error = %e, "Cache write failed");
            }
        } else {
            let store = Arc::clone(&self.store);
            let bucket = self.bucket.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                if let Err(e) = store.put(&bucket, &key, object).await {
                    error!(key = %key, error = %e, "Cache write failed");
                }
            });
        }
    }

    fn now_ts(&self) -> i64 {
        Utc::now().timestamp() + self.time_offset
    }
}

/// Cache key: SHA-1 over the canonical serialization of the request
/// identity. `hash_url` substitutes for the URL so equivalent resources
/// share an entry.
fn request_hash(opts: &GetOptions) -> String {
    let key_url = opts.hash_url.as_deref().unwrap_or(&opts.request.url);
    let serialized = serde_json::to_vec(&(
        key_url,
        &opts.request.headers,
        &opts.request.agent,
        &opts.request.cookies,
    ))
    .expect("string maps always serialize");
    sha1_hex(&serialized)
}

fn check_stale(requested: Option<&str>, actual: &str) -> Result<(), FetchError> {
    if requested == Some(actual) {
        return Err(FetchError::StaleContent(actual.to_string()));
    }
    Ok(())
}
