//! Per-call instrumentation.
//!
//! Every pipeline completion records one sample into a bounded ring; the
//! reducer aggregates per-endpoint counts and latency percentiles on
//! demand. Samples are plain data so the shutdown chain can dump a summary
//! without touching the middleware.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

const DEFAULT_RING_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Serialize)]
pub struct CallSample {
    pub endpoint: String,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    pub cache_hit: bool,
    pub retries: u32,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct EndpointSummary {
    pub calls: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub retries: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub endpoints: BTreeMap<String, EndpointSummary>,
}

pub struct MetricsCollector {
    capacity: usize,
    samples: Mutex<VecDeque<CallSample>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl MetricsCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn record(&self, sample: CallSample) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<CallSample> {
        self.samples.lock().unwrap().iter().cloned().collect()
    }

    pub fn summary(&self) -> MetricsSummary {
        let samples = self.snapshot();
        let mut durations: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        let mut endpoints: BTreeMap<String, EndpointSummary> = BTreeMap::new();

        for sample in &samples {
            let entry = endpoints.entry(sample.endpoint.clone()).or_default();
            entry.calls += 1;
            if !sample.success {
                entry.errors += 1;
            }
            if sample.cache_hit {
                entry.cache_hits += 1;
            }
            entry.retries += u64::from(sample.retries);
            durations
                .entry(sample.endpoint.clone())
                .or_default()
                .push(sample.duration_ms);
        }

        for (endpoint, mut values) in durations {
            values.sort_unstable();
            if let Some(entry) = endpoints.get_mut(&endpoint) {
                entry.p50_ms = percentile(&values, 0.50);
                entry.p95_ms = percentile(&values, 0.95);
                entry.p99_ms = percentile(&values, 0.99);
            }
        }

        MetricsSummary { endpoints }
    }
}

fn percentile(sorted: &[u64], fraction: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64 - 1.0) * fraction).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}
