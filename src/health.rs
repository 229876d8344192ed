use crate::cache::ConfigCache;
use crate::types::{Backend, BackendHealth};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PROBES_PER_CYCLE: usize = 3;
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// In-process health map: written through one narrow setter (the probe loop
/// here, or an external prober via the ops endpoint), read by every request
/// task. DashMap keeps readers off the writer's back.
#[derive(Clone, Default)]
pub struct HealthStore {
    inner: Arc<DashMap<String, BackendHealth>>,
}

impl HealthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full replacement; the prober owns the record.
    pub fn set(&self, health: BackendHealth) {
        self.inner.insert(health.backend_id.clone(), health);
    }

    pub fn get(&self, backend_id: &str) -> Option<BackendHealth> {
        self.inner.get(backend_id).map(|entry| entry.clone())
    }

    /// Unknown backends count as healthy: a cache miss must not take
    /// traffic away from a backend the prober has not reached yet.
    pub fn is_healthy(&self, backend_id: &str) -> bool {
        self.get(backend_id).map(|h| h.healthy).unwrap_or(true)
    }

    pub fn p95(&self, backend_id: &str) -> Option<f64> {
        self.get(backend_id).and_then(|h| h.latency_p95)
    }

    pub fn all(&self) -> Vec<BackendHealth> {
        self.inner.iter().map(|entry| entry.clone()).collect()
    }
}

fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    Some(sorted[rank - 1])
}

/// Probe every backend the config cache currently knows about and write the
/// per-backend summary through the store's setter.
pub struct Prober {
    client: reqwest::Client,
    cache: Arc<ConfigCache>,
    store: HealthStore,
    interval: Duration,
}

impl Prober {
    pub fn new(
        client: reqwest::Client,
        cache: Arc<ConfigCache>,
        store: HealthStore,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            cache,
            store,
            interval,
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for backend in self.cache.cached_backends() {
                    if !backend.enabled {
                        continue;
                    }
                    let summary = self.probe_backend(&backend).await;
                    self.store.set(summary);
                }
            }
        });
    }

    async fn probe_backend(&self, backend: &Backend) -> BackendHealth {
        let url = format!(
            "{}{}",
            backend.url.trim_end_matches('/'),
            backend.health_endpoint
        );

        let mut latencies = Vec::with_capacity(PROBES_PER_CYCLE);
        let mut failures = 0usize;
        for _ in 0..PROBES_PER_CYCLE {
            let started = Instant::now();
            match self
                .client
                .get(&url)
                .timeout(PROBE_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    latencies.push(started.elapsed().as_secs_f64() * 1_000.0);
                }
                Ok(_) | Err(_) => failures += 1,
            }
        }

        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let healthy = !latencies.is_empty();
        let consecutive_failures = if healthy {
            0
        } else {
            self.store
                .get(&backend.id)
                .map(|h| h.consecutive_failures + 1)
                .unwrap_or(1)
        };

        if !healthy {
            tracing::warn!(backend = %backend.id, consecutive_failures, "health probe cycle failed");
        }

        BackendHealth {
            backend_id: backend.id.clone(),
            healthy,
            last_check: Utc::now(),
            latency_p50: percentile(&latencies, 0.50),
            latency_p95: percentile(&latencies, 0.95),
            latency_p99: percentile(&latencies, 0.99),
            error_rate: Some(failures as f64 / PROBES_PER_CYCLE as f64),
            consecutive_failures,
        }
    }
}
