use crate::error::GatewayError;
use gateway_cache::{CacheKey, CachePolicy, CacheStore, CachedEntry, Freshness, ResourceRequest};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Caller-supplied check deciding whether a fetched body may be cached.
/// Must be pure: it runs once per caller on every successful fetch, including
/// callers that joined another caller's in-flight fetch.
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

type Outcome = Result<Fetched, GatewayError>;

/// What the leading caller hands to callers that joined its fetch: the parsed
/// body, before any caller's validity check has been applied to it.
#[derive(Debug, Clone)]
struct Shared {
    body: Arc<Value>,
    size: usize,
    /// The leader wrote this body to the store.
    stored: bool,
}

type SharedOutcome = Result<Shared, GatewayError>;

/// Why a successfully fetched body was not written to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InvalidPayload,
    TooLarge,
    NoStore,
}

/// Where the returned body came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Hit,
    Stale,
    Network,
    NotCached(SkipReason),
}

impl FetchSource {
    /// Value for the `X-Cache` response header.
    pub fn header_value(&self) -> &'static str {
        match self {
            FetchSource::Hit => "HIT",
            FetchSource::Stale => "STALE",
            FetchSource::Network => "MISS",
            FetchSource::NotCached(_) => "BYPASS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub body: Arc<Value>,
    pub source: FetchSource,
    pub fetched_at: Instant,
}

impl Fetched {
    fn from_entry(entry: &CachedEntry, source: FetchSource) -> Self {
        Self {
            body: Arc::clone(&entry.body),
            source,
            fetched_at: entry.fetched_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// First segment of every key this gateway reads or writes.
    pub namespace: String,
    pub timeout: Duration,
    pub max_body_size: usize,
    /// Serve stale entries immediately and refresh them in a background task.
    pub background_revalidation: bool,
}

/// Cached fetch gateway.
///
/// Cloning is cheap; clones share the HTTP client, the store handle and the
/// table of in-flight fetches. The store itself is shared with whatever else
/// in the process uses it.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn CacheStore>,
    http: reqwest::Client,
    settings: GatewaySettings,
    in_flight: Mutex<HashMap<CacheKey, broadcast::Sender<SharedOutcome>>>,
}

enum Role {
    Leader(broadcast::Sender<SharedOutcome>),
    Follower(broadcast::Receiver<SharedOutcome>),
}

impl Gateway {
    pub fn new(
        store: Arc<dyn CacheStore>,
        settings: GatewaySettings,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("review-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                GatewayError::Configuration(format!("failed to build HTTP client: {e}"))
            })?;

        tracing::info!(
            namespace = %settings.namespace,
            store = store.name(),
            timeout_ms = settings.timeout.as_millis() as u64,
            background_revalidation = settings.background_revalidation,
            "gateway initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                http,
                settings,
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.inner.settings.namespace
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.inner.store
    }

    /// Deterministic key for a request under this gateway's namespace.
    pub fn key_for(&self, request: &ResourceRequest) -> CacheKey {
        CacheKey::for_request(self.namespace(), request)
    }

    /// Return the body for `key`, from the store when the policy says it is
    /// fresh, otherwise from the network.
    ///
    /// Makes at most one outbound request and at most one store write. A body
    /// is only written when `is_valid` accepts it. When the fetch fails and the
    /// policy permits it, a stale cached copy is returned instead of the error.
    pub async fn get_resource(
        &self,
        key: CacheKey,
        request: &ResourceRequest,
        policy: &CachePolicy,
        is_valid: &Validator,
        cancel: &CancellationToken,
    ) -> Result<Fetched, GatewayError> {
        let start = Instant::now();

        if key.namespace() != self.namespace() {
            return Err(GatewayError::ForeignNamespace {
                expected: self.namespace().to_string(),
                found: key.namespace().to_string(),
            });
        }

        if !policy.is_storable() {
            metrics::counter!("gateway_lookups_total", "outcome" => "bypass").increment(1);
            return self
                .fetch_and_store(&key, request, policy, is_valid, cancel)
                .await;
        }

        let cached = self.inner.store.get(&key);

        if let Some(entry) = &cached {
            match policy.freshness(entry.age()) {
                Freshness::Fresh => {
                    metrics::counter!("gateway_lookups_total", "outcome" => "hit").increment(1);
                    tracing::debug!(
                        key = %key,
                        latency_us = start.elapsed().as_micros() as u64,
                        "cache HIT"
                    );
                    return Ok(Fetched::from_entry(entry, FetchSource::Hit));
                }
                Freshness::Stale if self.inner.settings.background_revalidation => {
                    metrics::counter!("gateway_lookups_total", "outcome" => "stale").increment(1);
                    tracing::debug!(key = %key, "cache STALE, revalidating in background");
                    self.spawn_revalidation(key, request.clone(), *policy, Arc::clone(is_valid));
                    return Ok(Fetched::from_entry(entry, FetchSource::Stale));
                }
                _ => {}
            }
        }

        metrics::counter!("gateway_lookups_total", "outcome" => "miss").increment(1);

        match self
            .fetch_coalesced(&key, request, policy, is_valid, cancel)
            .await
        {
            Ok(fetched) => Ok(fetched),
            Err(err) if err.allows_stale_fallback() => {
                let fallback = cached.filter(|entry| {
                    policy.allows_stale() && policy.freshness(entry.age()) != Freshness::Expired
                });
                match fallback {
                    Some(entry) => {
                        tracing::warn!(
                            key = %key,
                            error = %err,
                            age_secs = entry.age().as_secs(),
                            "upstream failed, serving stale entry"
                        );
                        Ok(Fetched::from_entry(&entry, FetchSource::Stale))
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    fn spawn_revalidation(
        &self,
        key: CacheKey,
        request: ResourceRequest,
        policy: CachePolicy,
        is_valid: Validator,
    ) {
        let gateway = self.clone();
        tokio::spawn(async move {
            // Detached from the caller: an abandoned page render must not abort the refresh.
            let cancel = CancellationToken::new();
            if let Err(err) = gateway
                .fetch_coalesced(&key, &request, &policy, &is_valid, &cancel)
                .await
            {
                tracing::warn!(key = %key, error = %err, "background revalidation failed");
            }
        });
    }

    /// Join an in-flight fetch for `key` if there is one, otherwise lead one.
    ///
    /// Only the network round trip is shared. Every caller applies its own
    /// validity check to the shared body.
    async fn fetch_coalesced(
        &self,
        key: &CacheKey,
        request: &ResourceRequest,
        policy: &CachePolicy,
        is_valid: &Validator,
        cancel: &CancellationToken,
    ) -> Outcome {
        let role = {
            let mut table = self.inner.in_flight.lock();
            match table.get(key) {
                Some(tx) => Role::Follower(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    table.insert(key.clone(), tx.clone());
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                tracing::debug!(key = %key, "joining in-flight fetch");
                let joined = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    joined = rx.recv() => joined,
                };
                match joined {
                    Ok(Ok(shared)) => Ok(self.admit(
                        key,
                        shared.body,
                        shared.size,
                        policy,
                        is_valid,
                        shared.stored,
                    )),
                    Ok(Err(err)) => Err(err),
                    // Leader was dropped before finishing.
                    Err(_) => {
                        self.fetch_and_store(key, request, policy, is_valid, cancel)
                            .await
                    }
                }
            }
            Role::Leader(tx) => {
                let slot = InFlight {
                    table: &self.inner.in_flight,
                    key,
                    tx: Some(tx),
                };
                match self.fetch(key, request, cancel).await {
                    Ok((body, size)) => {
                        let fetched =
                            self.admit(key, Arc::clone(&body), size, policy, is_valid, false);
                        slot.finish(Ok(Shared {
                            body,
                            size,
                            stored: fetched.source == FetchSource::Network,
                        }));
                        Ok(fetched)
                    }
                    // Only this caller gave up; waiting callers fetch for themselves.
                    Err(GatewayError::Cancelled) => {
                        drop(slot);
                        Err(GatewayError::Cancelled)
                    }
                    Err(err) => {
                        slot.finish(Err(err.clone()));
                        Err(err)
                    }
                }
            }
        }
    }

    async fn fetch_and_store(
        &self,
        key: &CacheKey,
        request: &ResourceRequest,
        policy: &CachePolicy,
        is_valid: &Validator,
        cancel: &CancellationToken,
    ) -> Outcome {
        let (body, size) = self.fetch(key, request, cancel).await?;
        Ok(self.admit(key, body, size, policy, is_valid, false))
    }

    /// One upstream round trip, bounded by the configured timeout and the
    /// caller's cancellation.
    async fn fetch(
        &self,
        key: &CacheKey,
        request: &ResourceRequest,
        cancel: &CancellationToken,
    ) -> Result<(Arc<Value>, usize), GatewayError> {
        let start = Instant::now();
        let timeout = self.inner.settings.timeout;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            res = tokio::time::timeout(timeout, self.fetch_json(request)) => {
                res.unwrap_or_else(|_| {
                    Err(GatewayError::fetch(
                        &request.url,
                        None,
                        format!("timed out after {}ms", timeout.as_millis()),
                    ))
                })
            }
        };

        match result {
            Ok((body, size)) => {
                metrics::counter!("gateway_fetches_total", "result" => "ok").increment(1);
                tracing::debug!(
                    key = %key,
                    size,
                    latency_us = start.elapsed().as_micros() as u64,
                    "upstream fetch complete"
                );
                Ok((Arc::new(body), size))
            }
            Err(GatewayError::Cancelled) => {
                metrics::counter!("gateway_fetches_total", "result" => "cancelled").increment(1);
                tracing::debug!(key = %key, "fetch cancelled by caller");
                Err(GatewayError::Cancelled)
            }
            Err(err) => {
                metrics::counter!("gateway_fetches_total", "result" => "error").increment(1);
                tracing::warn!(key = %key, error = %err, "upstream fetch failed");
                Err(err)
            }
        }
    }

    /// Run the caller's validity check on a fetched body and write it to the
    /// store when it passes and fits. `stored` is set when another caller
    /// already wrote this exact body.
    fn admit(
        &self,
        key: &CacheKey,
        body: Arc<Value>,
        size: usize,
        policy: &CachePolicy,
        is_valid: &Validator,
        stored: bool,
    ) -> Fetched {
        let source = if !is_valid(&*body) {
            tracing::warn!(key = %key, "upstream body rejected by validity check, not caching");
            FetchSource::NotCached(SkipReason::InvalidPayload)
        } else if stored {
            FetchSource::Network
        } else if size > self.inner.settings.max_body_size {
            tracing::warn!(
                key = %key,
                size,
                limit = self.inner.settings.max_body_size,
                "upstream body too large, not caching"
            );
            FetchSource::NotCached(SkipReason::TooLarge)
        } else if !policy.is_storable() {
            FetchSource::NotCached(SkipReason::NoStore)
        } else {
            self.inner
                .store
                .set(CachedEntry::new(key.clone(), Arc::clone(&body), *policy));
            metrics::counter!("gateway_store_writes_total").increment(1);
            FetchSource::Network
        };

        tracing::debug!(key = %key, cached = source == FetchSource::Network, "cache MISS");

        Fetched {
            body,
            source,
            fetched_at: Instant::now(),
        }
    }

    async fn fetch_json(&self, request: &ResourceRequest) -> Result<(Value, usize), GatewayError> {
        let url = request.url.as_str();
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| GatewayError::fetch(url, None, e))?;

        let mut builder = self.inner.http.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| GatewayError::fetch(url, None, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::fetch(
                url,
                Some(status.as_u16()),
                status.canonical_reason().unwrap_or("non-success status"),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::fetch(url, Some(status.as_u16()), e))?;

        let body = serde_json::from_slice(&bytes).map_err(|e| GatewayError::InvalidPayload {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        Ok((body, bytes.len()))
    }
}

/// Pending-request slot owned by the leading caller. Dropping it without
/// `finish` (the leader was cancelled) releases waiting callers, who then
/// fetch on their own.
struct InFlight<'a> {
    table: &'a Mutex<HashMap<CacheKey, broadcast::Sender<SharedOutcome>>>,
    key: &'a CacheKey,
    tx: Option<broadcast::Sender<SharedOutcome>>,
}

impl InFlight<'_> {
    fn finish(mut self, outcome: SharedOutcome) {
        self.table.lock().remove(self.key);
        if let Some(tx) = self.tx.take() {
            // No receivers is fine.
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.table.lock().remove(self.key);
        }
    }
}
