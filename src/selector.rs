use crate::health::HealthStore;
use crate::types::{Backend, RouteStrategy, Selection, StickyConfig};
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Latency assumed for a backend the prober has not measured yet.
const UNKNOWN_P95_MS: f64 = 1_000.0;
const LATENCY_POOL: usize = 3;

/// Strategy dispatch over the candidate backends. Per-policy round-robin
/// counters are process-local; across replicas the distribution is only
/// approximately weighted, which is acceptable.
pub struct RouteSelector {
    rr_counters: DashMap<String, AtomicU64>,
}

impl Default for RouteSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteSelector {
    pub fn new() -> Self {
        Self {
            rr_counters: DashMap::new(),
        }
    }

    /// Pick one backend. `sticky_value` is the inbound affinity hint already
    /// pulled from the cookie or header named by `sticky`.
    pub fn select(
        &self,
        backends: &[Backend],
        strategy: RouteStrategy,
        policy_id: &str,
        health: &HealthStore,
        sticky: Option<&StickyConfig>,
        sticky_value: Option<&str>,
    ) -> Option<Selection> {
        let enabled: Vec<&Backend> = backends.iter().filter(|b| b.enabled).collect();
        if enabled.is_empty() {
            return None;
        }

        let needs_health = matches!(
            strategy,
            RouteStrategy::HealthAware | RouteStrategy::LatencyAware
        );
        let mut candidates: Vec<&Backend> = if needs_health {
            enabled
                .iter()
                .copied()
                .filter(|b| health.is_healthy(&b.id))
                .collect()
        } else {
            enabled.clone()
        };
        // all unhealthy: fail open to the enabled set rather than 503
        let mut failed_open = false;
        if candidates.is_empty() {
            candidates = enabled.clone();
            failed_open = true;
        }

        let candidates_count = candidates.len();
        let mut selection = match strategy {
            RouteStrategy::WeightedRoundRobin => self.weighted_round_robin(&candidates, policy_id),
            RouteStrategy::LatencyAware => latency_aware(&candidates, health),
            RouteStrategy::HealthAware => Selection {
                backend: weighted_pick(&candidates).clone(),
                strategy,
                candidates_count,
                selection_reason: "weighted over healthy set".into(),
                latency_estimate: None,
                new_sticky_assignment: false,
            },
            RouteStrategy::Sticky => sticky_select(&candidates, health, sticky, sticky_value),
            RouteStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                Selection {
                    backend: candidates[idx].clone(),
                    strategy,
                    candidates_count,
                    selection_reason: "uniform random".into(),
                    latency_estimate: None,
                    new_sticky_assignment: false,
                }
            }
        };
        selection.strategy = strategy;
        selection.candidates_count = candidates_count;
        if failed_open {
            selection.selection_reason = format!("{} (all unhealthy)", selection.selection_reason);
        }
        Some(selection)
    }

    fn weighted_round_robin(&self, candidates: &[&Backend], policy_id: &str) -> Selection {
        let mut slots: Vec<usize> = Vec::new();
        for (idx, backend) in candidates.iter().enumerate() {
            let count = (backend.weight as usize).max(1);
            slots.extend(std::iter::repeat(idx).take(count));
        }
        let counter = self
            .rr_counters
            .entry(policy_id.to_string())
            .or_insert_with(|| AtomicU64::new(0));
        let tick = counter.fetch_add(1, Ordering::Relaxed);
        let backend = candidates[slots[(tick % slots.len() as u64) as usize]];
        Selection {
            backend: backend.clone(),
            strategy: RouteStrategy::WeightedRoundRobin,
            candidates_count: candidates.len(),
            selection_reason: format!("round-robin slot {}", tick % slots.len() as u64),
            latency_estimate: None,
            new_sticky_assignment: false,
        }
    }
}

fn latency_aware(candidates: &[&Backend], health: &HealthStore) -> Selection {
    let mut ranked: Vec<(&Backend, f64)> = candidates
        .iter()
        .map(|b| (*b, health.p95(&b.id).unwrap_or(f64::INFINITY)))
        .collect();
    ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(LATENCY_POOL);

    // invert latency into weight: the slowest of the pool still gets one unit
    let max_p95 = ranked
        .iter()
        .map(|(_, p95)| if p95.is_finite() { *p95 } else { UNKNOWN_P95_MS })
        .fold(0.0_f64, f64::max);
    let weights: Vec<f64> = ranked
        .iter()
        .map(|(_, p95)| {
            let p95 = if p95.is_finite() { *p95 } else { UNKNOWN_P95_MS };
            max_p95 - p95 + 1.0
        })
        .collect();

    let total: f64 = weights.iter().sum();
    let mut roll = rand::thread_rng().gen_range(0.0..total);
    let mut chosen = ranked.len() - 1;
    for (idx, weight) in weights.iter().enumerate() {
        if roll < *weight {
            chosen = idx;
            break;
        }
        roll -= weight;
    }

    let (backend, p95) = ranked[chosen];
    Selection {
        backend: backend.clone(),
        strategy: RouteStrategy::LatencyAware,
        candidates_count: candidates.len(),
        selection_reason: "lowest-latency pool".into(),
        latency_estimate: p95.is_finite().then_some(p95),
        new_sticky_assignment: false,
    }
}

fn sticky_select(
    candidates: &[&Backend],
    health: &HealthStore,
    sticky: Option<&StickyConfig>,
    sticky_value: Option<&str>,
) -> Selection {
    if let Some(wanted) = sticky_value {
        if let Some(existing) = candidates.iter().find(|b| b.id == wanted) {
            if health.is_healthy(&existing.id) {
                return Selection {
                    backend: (*existing).clone(),
                    strategy: RouteStrategy::Sticky,
                    candidates_count: candidates.len(),
                    selection_reason: "existing assignment".into(),
                    latency_estimate: None,
                    new_sticky_assignment: false,
                };
            }
        }
    }

    // re-assign over the healthy subset so a client bounced off a dead
    // backend does not land straight back on it
    let healthy: Vec<&Backend> = candidates
        .iter()
        .copied()
        .filter(|b| health.is_healthy(&b.id))
        .collect();
    let pool: &[&Backend] = if healthy.is_empty() { candidates } else { &healthy };

    let kind = sticky.map(|s| s.kind);
    tracing::debug!(?kind, "issuing new sticky assignment");
    Selection {
        backend: weighted_pick(pool).clone(),
        strategy: RouteStrategy::Sticky,
        candidates_count: candidates.len(),
        selection_reason: "new assignment".into(),
        latency_estimate: None,
        new_sticky_assignment: true,
    }
}

/// Uniform sample in [0, total weight), walking the cumulative distribution.
/// A zero-weight set degrades to a uniform pick.
fn weighted_pick<'a>(candidates: &[&'a Backend]) -> &'a Backend {
    let total: u64 = candidates.iter().map(|b| b.weight as u64).sum();
    if total == 0 {
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        return candidates[idx];
    }
    let mut roll = rand::thread_rng().gen_range(0..total);
    for backend in candidates {
        let weight = backend.weight as u64;
        if roll < weight {
            return backend;
        }
        roll -= weight;
    }
    candidates[candidates.len() - 1]
}
