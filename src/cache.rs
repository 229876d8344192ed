use crate::kv::KvStore;
use crate::policy::CompiledConfig;
use crate::store::ConfigStorage;
use crate::types::{Backend, GlobalConfig};
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const COMPILED_CAPACITY: u64 = 1_024;

/// Loads the active config for a domain through the shared KV cache, falling
/// back to storage on miss and to an empty config on storage failure. The
/// compiled form is held per `(domain, version)` in a process-local cache;
/// configs are value-equal within a version, so recompiling on another
/// replica is harmless.
pub struct ConfigCache {
    kv: Arc<dyn KvStore>,
    storage: Arc<dyn ConfigStorage>,
    ttl_secs: u64,
    compiled: Cache<(String, u64), Arc<CompiledConfig>, ahash::RandomState>,
}

fn kv_key(domain: &str) -> String {
    format!("lb:config:{domain}")
}

/// Lowercase, trimmed, port stripped. IPv6 literals keep their brackets.
pub fn normalize_domain(raw: &str) -> String {
    let trimmed = raw.trim().to_ascii_lowercase();
    if let Some(end) = trimmed.find(']') {
        // bracketed IPv6 host, possibly with a port after the bracket
        return trimmed[..=end].to_string();
    }
    match trimmed.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => trimmed,
    }
}

impl ConfigCache {
    pub fn new(kv: Arc<dyn KvStore>, storage: Arc<dyn ConfigStorage>, ttl_secs: u64) -> Self {
        let compiled = Cache::builder()
            .max_capacity(COMPILED_CAPACITY)
            .time_to_live(Duration::from_secs(ttl_secs.max(60) * 5))
            .support_invalidation_closures()
            .build_with_hasher(ahash::RandomState::new());
        Self {
            kv,
            storage,
            ttl_secs,
            compiled,
        }
    }

    pub async fn load(&self, domain: &str) -> Arc<CompiledConfig> {
        let domain = normalize_domain(domain);
        let config = self.load_raw(&domain).await;
        let key = (domain, config.version);
        self.compiled
            .get_with(key, async move { Arc::new(CompiledConfig::compile(config)) })
            .await
    }

    async fn load_raw(&self, domain: &str) -> GlobalConfig {
        let key = kv_key(domain);
        match self.kv.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<GlobalConfig>(&raw) {
                Ok(config) => return config,
                Err(err) => {
                    tracing::warn!(%domain, %err, "cached config unparseable; refetching");
                }
            },
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(%domain, %err, "kv unavailable for config read");
            }
        }

        let config = match self.storage.get_active_config(domain).await {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(%domain, %err, "config storage failed; serving fallback config");
                return GlobalConfig::fallback(domain);
            }
        };

        match serde_json::to_string(&config) {
            Ok(raw) => {
                if let Err(err) = self.kv.set_ex(&key, &raw, self.ttl_secs).await {
                    tracing::warn!(%domain, %err, "kv unavailable for config write");
                }
            }
            Err(err) => tracing::warn!(%domain, %err, "config serialisation failed"),
        }
        config
    }

    pub async fn invalidate(&self, domain: &str) {
        let domain = normalize_domain(domain);
        if let Err(err) = self.kv.del(&kv_key(&domain)).await {
            tracing::warn!(%domain, %err, "kv unavailable for config invalidation");
        }
        let target = domain.clone();
        if let Err(err) = self
            .compiled
            .invalidate_entries_if(move |key, _| key.0 == target)
        {
            tracing::warn!(%domain, %err, "compiled-config invalidation failed");
        }
    }

    /// Distinct backends across every currently-compiled config; feeds the
    /// probe loop.
    pub fn cached_backends(&self) -> Vec<Backend> {
        let mut seen: HashMap<String, Backend> = HashMap::new();
        for (_, compiled) in self.compiled.iter() {
            for backend in &compiled.config.backends {
                seen.entry(backend.id.clone())
                    .or_insert_with(|| backend.clone());
            }
        }
        seen.into_values().collect()
    }

    pub fn cached_domains(&self) -> usize {
        self.compiled.entry_count() as usize
    }
}
