//! The process-wide middleware context.
//!
//! A [`Gateway`] owns every piece of shared resilience state: the named
//! caches, the metrics ring, the rate buckets, and the per-endpoint circuit
//! breakers and bulkheads. Outbound calls go through [`Gateway::execute`],
//! which applies the full pipeline:
//!
//! ```text
//! cache probe -> rate limit -> bulkhead -> circuit -> retry(timeout(call)) -> cache insert
//! ```
//!
//! A cache hit short-circuits everything else. The middleware only sees a
//! narrow callable (endpoint key plus an async operation), so transports
//! and the LLM client stay ordinary callees with no knowledge of it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::cache::CacheManager;
use crate::cache::CacheName;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::metrics::CallSample;
use crate::metrics::MetricsCollector;
use crate::rate_limit::RateLimiter;
use crate::resilience::CircuitBreaker;
use crate::resilience::CircuitConfig;
use crate::resilience::RetryPolicy;

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(120);

/// Bounded-concurrency classes. Limits follow the load profile of each
/// endpoint family rather than individual endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Llm,
    Embedding,
    Tool,
}

impl EndpointClass {
    pub fn name(self) -> &'static str {
        match self {
            EndpointClass::Llm => "llm",
            EndpointClass::Embedding => "embedding",
            EndpointClass::Tool => "tool",
        }
    }

    fn default_limit(self) -> usize {
        match self {
            EndpointClass::Llm => 10,
            EndpointClass::Embedding => 5,
            EndpointClass::Tool => 8,
        }
    }
}

/// Optional cache participation of one call. The key must be a pure
/// function of the call's inputs.
#[derive(Debug, Clone)]
pub struct CacheSlot {
    pub cache: CacheName,
    pub key: String,
    pub ttl: Option<Duration>,
}

/// How one logical call is treated by the pipeline.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub endpoint: String,
    pub class: EndpointClass,
    pub client_id: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub cache: Option<CacheSlot>,
}

impl CallPolicy {
    pub fn tool(server: &str, tool: &str) -> Self {
        Self {
            endpoint: format!("tool:{server}.{tool}"),
            class: EndpointClass::Tool,
            client_id: "local".to_string(),
            timeout: DEFAULT_TOOL_TIMEOUT,
            retry: RetryPolicy::default(),
            cache: None,
        }
    }

    pub fn llm(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            class: EndpointClass::Llm,
            client_id: "local".to_string(),
            timeout: DEFAULT_LLM_TIMEOUT,
            retry: RetryPolicy::default(),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: CacheName, key: String) -> Self {
        self.cache = Some(CacheSlot {
            cache,
            key,
            ttl: None,
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Tunables the gateway is constructed with. Tests shorten the circuit
/// windows; production uses the config-derived defaults.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub cache: crate::config::CacheSettings,
    pub limits: crate::config::RateLimitSettings,
    pub circuit: CircuitConfig,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            cache: crate::config::CacheSettings::default(),
            limits: crate::config::RateLimitSettings::default(),
            circuit: CircuitConfig::default(),
        }
    }
}

impl From<&GatewayConfig> for GatewayOptions {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            cache: config.cache.clone(),
            limits: config.limits.clone(),
            circuit: CircuitConfig::default(),
        }
    }
}

pub struct Gateway {
    caches: CacheManager,
    metrics: MetricsCollector,
    rate: RateLimiter,
    circuit_config: CircuitConfig,
    circuits: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    llm_slots: Arc<Semaphore>,
    embedding_slots: Arc<Semaphore>,
    tool_slots: Arc<Semaphore>,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(options: GatewayOptions) -> Arc<Self> {
        Arc::new(Self {
            caches: CacheManager::new(&options.cache),
            metrics: MetricsCollector::default(),
            rate: RateLimiter::new(&options.limits),
            circuit_config: options.circuit,
            circuits: Mutex::new(HashMap::new()),
            llm_slots: Arc::new(Semaphore::new(EndpointClass::Llm.default_limit())),
            embedding_slots: Arc::new(Semaphore::new(EndpointClass::Embedding.default_limit())),
            tool_slots: Arc::new(Semaphore::new(EndpointClass::Tool.default_limit())),
            sweep_interval: Duration::from_secs(options.cache.sweep_interval_secs.max(1)),
            sweeper: Mutex::new(None),
        })
    }

    pub fn caches(&self) -> &CacheManager {
        &self.caches
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate
    }

    /// The circuit breaker for an endpoint, created on first use.
    pub fn circuit(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut circuits = self.circuits.lock().unwrap();
        circuits
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.circuit_config.clone())))
            .clone()
    }

    fn bulkhead(&self, class: EndpointClass) -> Arc<Semaphore> {
        match class {
            EndpointClass::Llm => Arc::clone(&self.llm_slots),
            EndpointClass::Embedding => Arc::clone(&self.embedding_slots),
            EndpointClass::Tool => Arc::clone(&self.tool_slots),
        }
    }

    /// Start the background task that sweeps expired cache entries.
    pub fn start_cache_sweeper(gateway: &Arc<Gateway>) {
        let mut sweeper = gateway.sweeper.lock().unwrap();
        if sweeper.is_some() {
            return;
        }
        let interval = gateway.sweep_interval;
        let gateway = Arc::clone(gateway);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = gateway.caches.sweep_all();
                if removed > 0 {
                    debug!("cache sweep removed {removed} expired entries");
                }
            }
        }));
    }

    pub fn stop_cache_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Run one outbound call through the full pipeline.
    pub async fn execute<T, F, Fut>(&self, policy: &CallPolicy, op: F) -> Result<T, GatewayError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let started = Instant::now();

        // Happy-path fast return: a cache hit bypasses every other layer.
        if let Some(slot) = &policy.cache {
            if let Some(hit) = self.caches.get(slot.cache, &slot.key) {
                match serde_json::from_value::<T>(hit) {
                    Ok(value) => {
                        self.record(policy, started, true, None, true, 0);
                        return Ok(value);
                    }
                    Err(err) => {
                        warn!(
                            endpoint = %policy.endpoint,
                            "discarding unreadable cache entry: {err}"
                        );
                        self.caches.cache(slot.cache).remove(&slot.key);
                    }
                }
            }
        }

        if let Err(retry_after) = self.rate.try_acquire(&policy.endpoint, &policy.client_id) {
            let err = GatewayError::RateLimited { retry_after };
            self.record(policy, started, false, Some(err.kind()), false, 0);
            return Err(err);
        }

        // Bulkhead slot, bounded by the call's own deadline.
        let permit = match tokio::time::timeout(
            policy.timeout,
            self.bulkhead(policy.class).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                let err = GatewayError::ResourceExhausted {
                    class: policy.class.name(),
                };
                self.record(policy, started, false, Some(err.kind()), false, 0);
                return Err(err);
            }
        };

        let circuit = self.circuit(&policy.endpoint);
        if circuit.try_acquire().is_err() {
            drop(permit);
            let err = GatewayError::CircuitOpen {
                endpoint: policy.endpoint.clone(),
            };
            self.record(policy, started, false, Some(err.kind()), false, 0);
            return Err(err);
        }

        let mut attempt: u32 = 0;
        let outcome = loop {
            attempt += 1;
            let result = match tokio::time::timeout(policy.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout),
            };
            match result {
                Ok(value) => break Ok(value),
                Err(err) => {
                    if attempt >= policy.retry.max_attempts || !policy.retry.should_retry(&err) {
                        break Err(err);
                    }
                    let delay = policy.retry.delay_for_attempt(attempt);
                    debug!(
                        endpoint = %policy.endpoint,
                        attempt,
                        kind = err.kind(),
                        "retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };
        drop(permit);

        let retries = attempt - 1;
        match &outcome {
            Ok(_) => circuit.record_success(),
            Err(_) => circuit.record_failure(),
        }

        match outcome {
            Ok(value) => {
                self.record(policy, started, true, None, false, retries);
                if let Some(slot) = &policy.cache {
                    match serde_json::to_value(&value) {
                        Ok(encoded) => self.caches.insert(
                            slot.cache,
                            slot.key.clone(),
                            encoded,
                            slot.ttl,
                        ),
                        Err(err) => warn!(
                            endpoint = %policy.endpoint,
                            "result not cacheable: {err}"
                        ),
                    }
                }
                Ok(value)
            }
            Err(err) => {
                self.record(policy, started, false, Some(err.kind()), false, retries);
                Err(err)
            }
        }
    }

    fn record(
        &self,
        policy: &CallPolicy,
        started: Instant,
        success: bool,
        error_kind: Option<&'static str>,
        cache_hit: bool,
        retries: u32,
    ) {
        self.metrics.record(CallSample {
            endpoint: policy.endpoint.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            success,
            error_kind,
            cache_hit,
            retries,
        });
    }
}
