use crate::client::{PageRequest, PageResponse, Transport};
use crate::FetchError;
use spindle_core::config::FetchConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

/// Backoff between dispatch passes when hosts are pending but none is
/// currently dispatchable.
const DISPATCH_BACKOFF: Duration = Duration::from_millis(100);

/// Idle wait granularity; bounds how long the dispatch task outlives the
/// last queuer handle.
const IDLE_POLL: Duration = Duration::from_secs(1);

struct PendingRequest {
    request: PageRequest,
    completion: oneshot::Sender<Result<PageResponse, FetchError>>,
}

#[derive(Default)]
struct QueueState {
    /// Ordered pending requests, by host. Buckets that empty are reaped.
    pending: HashMap<String, VecDeque<PendingRequest>>,
    /// In-flight request counts, by host.
    active: HashMap<String, usize>,
    /// Timestamp of the last dispatch, by host.
    last_dispatch: HashMap<String, Instant>,
    total_active: usize,
    /// Per-host minimum-interval overrides.
    intervals: HashMap<String, Duration>,
    /// Per-host simultaneity overrides.
    host_caps: HashMap<String, usize>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    state: Mutex<QueueState>,
    notify: Arc<Notify>,
    max_simultaneous: usize,
    default_interval: Duration,
    default_host_cap: usize,
}

/// Per-host rate-limited, concurrency-capped HTTP client.
///
/// Every outbound request in the platform funnels through one of these.
/// Within a host bucket requests are FIFO; `prioritize` head-inserts
/// without preempting anything already dispatched.
#[derive(Clone)]
pub struct RequestQueuer {
    inner: Arc<Inner>,
}

impl RequestQueuer {
    /// Build a queuer over the given transport.
    ///
    /// A zero `max_simultaneous` means effectively unlimited; a zero
    /// per-host rate disables pacing; a zero per-host simultaneity cap
    /// falls back to the global cap. Loopback traffic is never throttled.
    pub fn new(transport: Arc<dyn Transport>, config: &FetchConfig) -> Self {
        let max_simultaneous = if config.max_simultaneous == 0 {
            100_000
        } else {
            config.max_simultaneous
        };
        let default_interval = if config.max_requests_per_host_per_second == 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / config.max_requests_per_host_per_second)
        };
        let default_host_cap = if config.max_simultaneous_per_host == 0 {
            max_simultaneous
        } else {
            config.max_simultaneous_per_host
        };

        let mut state = QueueState::default();
        state.intervals.insert("127.0.0.1".to_string(), Duration::ZERO);
        state.host_caps.insert("127.0.0.1".to_string(), usize::MAX);

        let inner = Arc::new(Inner {
            transport,
            state: Mutex::new(state),
            notify: Arc::new(Notify::new()),
            max_simultaneous,
            default_interval,
            default_host_cap,
        });

        tokio::spawn(dispatch_loop(
            Arc::downgrade(&inner),
            Arc::clone(&inner.notify),
        ));

        Self { inner }
    }

    /// Queue an HTTP request and wait for its completion.
    pub async fn get_page(&self, request: PageRequest) -> Result<PageResponse, FetchError> {
        let host = request.host()?;
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().unwrap();
            let bucket = state.pending.entry(host).or_default();
            let pending = PendingRequest {
                request,
                completion: tx,
            };
            if pending.request.prioritize {
                bucket.push_front(pending);
            } else {
                bucket.push_back(pending);
            }
        }
        self.inner.notify.notify_one();

        rx.await
            .unwrap_or_else(|_| Err(FetchError::Transport("request dropped".to_string())))
    }

    /// Override the maximum request rate for a host (0 = unlimited).
    pub fn set_host_max_requests_per_second(&self, host: &str, max_per_second: f64) {
        let interval = if max_per_second == 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / max_per_second)
        };
        self.inner
            .state
            .lock()
            .unwrap()
            .intervals
            .insert(host.to_string(), interval);
    }

    /// Override the maximum simultaneous requests for a host (0 = global max).
    pub fn set_host_max_simultaneous_requests(&self, host: &str, max_simultaneous: usize) {
        let cap = if max_simultaneous == 0 {
            self.inner.max_simultaneous
        } else {
            max_simultaneous
        };
        self.inner
            .state
            .lock()
            .unwrap()
            .host_caps
            .insert(host.to_string(), cap);
    }

    /// Number of queued, not-yet-dispatched requests.
    pub fn pending(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.pending.values().map(|q| q.len()).sum()
    }

    /// Number of in-flight requests.
    pub fn active(&self) -> usize {
        self.inner.state.lock().unwrap().total_active
    }

    /// In-flight request counts by host.
    pub fn active_by_host(&self) -> HashMap<String, usize> {
        self.inner.state.lock().unwrap().active.clone()
    }

    /// Queued request counts by host.
    pub fn pending_by_host(&self) -> HashMap<String, usize> {
        let state = self.inner.state.lock().unwrap();
        state
            .pending
            .iter()
            .map(|(host, q)| (host.clone(), q.len()))
            .collect()
    }
}

impl Inner {
    fn interval_for(&self, state: &QueueState, host: &str) -> Duration {
        state
            .intervals
            .get(host)
            .copied()
            .unwrap_or(self.default_interval)
    }

    fn cap_for(&self, state: &QueueState, host: &str) -> usize {
        state
            .host_caps
            .get(host)
            .copied()
            .unwrap_or(self.default_host_cap)
    }

    fn host_dispatchable(&self, state: &QueueState, host: &str, now: Instant) -> bool {
        if let Some(last) = state.last_dispatch.get(host) {
            if now.duration_since(*last) < self.interval_for(state, host) {
                return false;
            }
        }
        state.active.get(host).copied().unwrap_or(0) < self.cap_for(state, host)
    }

    /// Pop one dispatchable request, updating the accounting tables.
    fn take_dispatchable(&self) -> Option<(String, PendingRequest)> {
        let mut state = self.state.lock().unwrap();
        if state.total_active >= self.max_simultaneous {
            return None;
        }
        let now = Instant::now();
        // Reap empty buckets as we scan.
        state.pending.retain(|_, q| !q.is_empty());
        let host = state
            .pending
            .keys()
            .find(|host| self.host_dispatchable(&state, host.as_str(), now))
            .cloned()?;
        let pending = state.pending.get_mut(&host)?.pop_front()?;
        state.last_dispatch.insert(host.clone(), now);
        *state.active.entry(host.clone()).or_insert(0) += 1;
        state.total_active += 1;
        Some((host, pending))
    }

    fn has_pending(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.pending.values().any(|q| !q.is_empty())
    }

    fn complete(&self, host: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.active.get_mut(host) {
            *count -= 1;
            if *count == 0 {
                state.active.remove(host);
            }
        }
        state.total_active -= 1;
    }
}

/// The dispatch loop. Holds only a weak handle so dropping the last queuer
/// lets the task unwind.
async fn dispatch_loop(inner: Weak<Inner>, notify: Arc<Notify>) {
    loop {
        let blocked = {
            let Some(inner) = inner.upgrade() else { break };
            // Dispatch every currently-eligible request in this pass.
            while let Some((host, pending)) = inner.take_dispatchable() {
                debug!(host = %host, url = %pending.request.url, "Dispatching request");
                let task_inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    let result = task_inner.transport.fetch(&pending.request).await;
                    task_inner.complete(&host);
                    task_inner.notify.notify_one();
                    if pending.completion.send(result).is_err() {
                        warn!(host = %host, "Request completed after caller went away");
                    }
                });
            }
            inner.has_pending()
        };

        if blocked {
            // Hosts are waiting on their interval or a concurrency slot.
            tokio::time::sleep(DISPATCH_BACKOFF).await;
        } else {
            let _ = tokio::time::timeout(IDLE_POLL, notify.notified()).await;
        }
    }
}
