use anyhow::Result;
use std::{env, path::PathBuf};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    /// Salt mixed into the client-IP hash.
    pub ip_salt: String,
    /// HMAC key for challenge tokens.
    pub challenge_secret: Vec<u8>,
    pub metrics_sink_url: Option<String>,
    pub metrics_api_key: Option<String>,
    pub ai_classifier_url: Option<String>,
    pub ai_classifier_api_key: Option<String>,
    /// Classifier timeout applied wherever a policy does not override it.
    pub ai_timeout_ms: u64,
    pub turnstile_secret: Option<String>,
    pub hcaptcha_secret: Option<String>,
    /// Redis endpoint for the shared KV store; absent means in-process.
    pub kv_url: Option<String>,
    /// Directory the file-backed config storage reads from.
    pub config_dir: PathBuf,
    pub config_cache_ttl_secs: u64,
    /// Hard wall-clock budget per request.
    pub request_budget_ms: u64,
    /// Backend probe cycle; 0 disables the in-process prober.
    pub probe_interval_ms: u64,
}

fn env_parsed<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("GATEWAY_BIND").unwrap_or_else(|_| "0.0.0.0:8088".to_string());
        let workers = env::var("GATEWAY_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(num_cpus::get_physical);

        let ip_salt = match env_opt("IP_HASH_SALT") {
            Some(value) => value,
            None => {
                tracing::warn!("IP_HASH_SALT not set; using insecure default");
                "sentry-gate-dev-salt".to_string()
            }
        };

        let challenge_secret = match env_opt("CHALLENGE_SECRET") {
            Some(value) => value.into_bytes(),
            None => {
                tracing::warn!("CHALLENGE_SECRET not set; using insecure default");
                b"sentry-gate-dev-secret".to_vec()
            }
        };

        let config_dir = PathBuf::from(
            env::var("GATEWAY_CONFIG_DIR").unwrap_or_else(|_| "./configs".into()),
        );

        Ok(Self {
            server: ServerConfig { bind_addr, workers },
            ip_salt,
            challenge_secret,
            metrics_sink_url: env_opt("METRICS_SINK_URL"),
            metrics_api_key: env_opt("METRICS_API_KEY"),
            ai_classifier_url: env_opt("AI_CLASSIFIER_URL"),
            ai_classifier_api_key: env_opt("AI_CLASSIFIER_API_KEY"),
            ai_timeout_ms: env_parsed("AI_CLASSIFIER_TIMEOUT_MS", 50),
            turnstile_secret: env_opt("TURNSTILE_SECRET"),
            hcaptcha_secret: env_opt("HCAPTCHA_SECRET"),
            kv_url: env_opt("GATEWAY_KV_URL"),
            config_dir,
            config_cache_ttl_secs: env_parsed("GATEWAY_CONFIG_CACHE_TTL_SECS", 60),
            request_budget_ms: env_parsed("GATEWAY_REQUEST_BUDGET_MS", 30_000),
            probe_interval_ms: env_parsed("GATEWAY_PROBE_INTERVAL_MS", 10_000),
        })
    }
}
