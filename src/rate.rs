use crate::kv::KvStore;
use crate::types::{RateKeyType, RateLimitConfig, RateLimitOutcome, RequestFeatures};
use chrono::{Duration, Utc};
use std::sync::Arc;

/// Fixed-window limiter over the shared KV store: INCR + TTL pipelined,
/// EXPIRE on a fresh key. Counts race across replicas within one window;
/// the bound degrades by at most the number of in-flight increments.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
}

fn key_type_label(key_type: RateKeyType) -> &'static str {
    match key_type {
        RateKeyType::Ip => "ip",
        RateKeyType::Subnet => "subnet",
        RateKeyType::Session => "session",
        RateKeyType::Endpoint => "endpoint",
        RateKeyType::Composite => "composite",
    }
}

fn selector(features: &RequestFeatures, key_type: RateKeyType) -> String {
    match key_type {
        RateKeyType::Ip => features.ip_hash.clone(),
        RateKeyType::Subnet => features.subnet.clone(),
        // no session -> degrade to ip keying
        RateKeyType::Session => features
            .session_id
            .clone()
            .unwrap_or_else(|| features.ip_hash.clone()),
        RateKeyType::Endpoint => format!("{}:{}", features.method, features.path),
        RateKeyType::Composite => format!("{}:{}", features.ip_hash, features.path),
    }
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn check(
        &self,
        features: &RequestFeatures,
        cfg: &RateLimitConfig,
        policy_id: &str,
    ) -> RateLimitOutcome {
        let now = Utc::now();
        let key = format!(
            "rl:{}:{}:{}",
            policy_id,
            key_type_label(cfg.key_type),
            selector(features, cfg.key_type)
        );

        if !cfg.enabled {
            return RateLimitOutcome {
                allowed: true,
                count: 0,
                remaining: cfg.max_requests,
                reset_at: now + Duration::milliseconds(cfg.window_ms as i64),
                retry_after_ms: None,
                key_type: cfg.key_type,
                key,
            };
        }

        let window_secs = (cfg.window_ms / 1_000).max(1);
        let window = match self.kv.incr_with_window(&key, window_secs).await {
            Ok(window) => window,
            Err(err) => {
                // fail open: a KV outage must not become a denial of service
                tracing::warn!(%key, %err, "rate-limit store unavailable; allowing");
                return RateLimitOutcome {
                    allowed: true,
                    count: 0,
                    remaining: cfg.max_requests,
                    reset_at: now + Duration::milliseconds(cfg.window_ms as i64),
                    retry_after_ms: None,
                    key_type: cfg.key_type,
                    key,
                };
            }
        };

        let budget = cfg.max_requests + cfg.burst_limit.unwrap_or(0);
        let allowed = window.count <= budget;
        let remaining = cfg.max_requests.saturating_sub(window.count);
        let reset_ms = if window.ttl_secs > 0 {
            window.ttl_secs as u64 * 1_000
        } else {
            cfg.window_ms
        };
        let reset_at = now + Duration::milliseconds(reset_ms as i64);
        // remaining-TTL derivation under replica clock drift bottoms out at
        // zero because ttl_secs <= 0 already fell back to the window size
        let retry_after_ms = if allowed { None } else { Some(reset_ms) };

        RateLimitOutcome {
            allowed,
            count: window.count,
            remaining,
            reset_at,
            retry_after_ms,
            key_type: cfg.key_type,
            key,
        }
    }
}
