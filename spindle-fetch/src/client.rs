use crate::FetchError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// An outbound HTTP request as plugins describe it.
///
/// Headers and cookies are ordered maps so cache-key serialization is
/// deterministic.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub url: String,
    pub method: String,
    pub postdata: Option<BTreeMap<String, String>>,
    pub headers: BTreeMap<String, String>,
    pub agent: String,
    pub timeout: Duration,
    pub cookies: BTreeMap<String, String>,
    pub follow_redirect: bool,
    /// Jump to the head of the host bucket instead of the tail.
    pub prioritize: bool,
    /// Sent as `If-Modified-Since`.
    pub last_modified: Option<String>,
    /// Sent as `If-None-Match`.
    pub etag: Option<String>,
}

impl PageRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            postdata: None,
            headers: BTreeMap::new(),
            agent: "Spindle".to_string(),
            timeout: Duration::from_secs(60),
            cookies: BTreeMap::new(),
            follow_redirect: true,
            prioritize: false,
            last_modified: None,
            etag: None,
        }
    }

    pub fn post(url: impl Into<String>, postdata: BTreeMap<String, String>) -> Self {
        let mut req = Self::get(url);
        req.method = "POST".to_string();
        req.postdata = Some(postdata);
        req
    }

    /// The host component used for rate-limit bucketing.
    pub fn host(&self) -> Result<String, FetchError> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| FetchError::Transport(format!("invalid url {}: {}", self.url, e)))?;
        parsed
            .host_str()
            .map(|h| h.to_string())
            .ok_or_else(|| FetchError::Transport(format!("url has no host: {}", self.url)))
    }
}

/// A completed HTTP response.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub body: Bytes,
    pub headers: HashMap<String, String>,
    pub status: u16,
    pub message: String,
}

impl PageResponse {
    /// Response header lookup, lowercase keys.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }
}

/// The wire seam under the request queuer. Production uses reqwest; tests
/// substitute recording fakes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: &PageRequest) -> Result<PageResponse, FetchError>;
}

/// reqwest-backed transport.
///
/// Redirect policy is a client-level setting in reqwest, so two clients are
/// held and picked per request.
pub struct HttpTransport {
    following: reqwest::Client,
    direct: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            following: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::limited(10))
                .build()
                .expect("reqwest client construction cannot fail with static options"),
            direct: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client construction cannot fail with static options"),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &PageRequest) -> Result<PageResponse, FetchError> {
        let client = if request.follow_redirect {
            &self.following
        } else {
            &self.direct
        };

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| FetchError::Transport(format!("bad method {}: {}", request.method, e)))?;

        let mut builder = client
            .request(method, &request.url)
            .timeout(request.timeout)
            .header(reqwest::header::USER_AGENT, &request.agent);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.cookies.is_empty() {
            let cookie = request
                .cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header(reqwest::header::COOKIE, cookie);
        }
        if let Some(ref last_modified) = request.last_modified {
            builder = builder.header(reqwest::header::IF_MODIFIED_SINCE, last_modified);
        }
        if let Some(ref etag) = request.etag {
            builder = builder.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(ref postdata) = request.postdata {
            builder = builder.form(postdata);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        let message = status
            .canonical_reason()
            .unwrap_or("Unknown")
            .to_string();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();

        // The queuer does not interpret status; 2xx completes, anything
        // else surfaces as an error the caller can pattern-match (the page
        // getter treats 304 as cache-valid).
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                message,
                headers,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        Ok(PageResponse {
            body,
            headers,
            status: status.as_u16(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_extraction() {
        assert_eq!(
            PageRequest::get("http://example.com/path?q=1").host().unwrap(),
            "example.com"
        );
        assert_eq!(
            PageRequest::get("https://sub.example.com:8443/").host().unwrap(),
            "sub.example.com"
        );
        assert!(PageRequest::get("not a url").host().is_err());
    }

    #[test]
    fn test_response_header_lookup_is_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("etag".to_string(), "\"e1\"".to_string());
        let response = PageResponse {
            body: Bytes::from_static(b""),
            headers,
            status: 200,
            message: "OK".to_string(),
        };
        assert_eq!(response.header("ETag"), Some("\"e1\""));
        assert_eq!(response.header("Missing"), None);
    }

    #[test]
    fn test_request_defaults() {
        let req = PageRequest::get("http://example.com/");
        assert_eq!(req.method, "GET");
        assert_eq!(req.timeout, Duration::from_secs(60));
        assert!(req.follow_redirect);
        assert!(!req.prioritize);
    }
}
