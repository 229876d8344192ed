use crate::botguard::BotGuard;
use crate::cache::{normalize_domain, ConfigCache};
use crate::challenge::{self, CaptchaVerifier, ChallengeSigner};
use crate::config::GatewayConfig;
use crate::errors::GatewayError;
use crate::features;
use crate::health::{HealthStore, Prober};
use crate::kv::{KvStore, MemoryStore, RedisStore};
use crate::metrics::MetricsSink;
use crate::policy::EffectiveRoute;
use crate::proxy::UpstreamProxy;
use crate::rate::RateLimiter;
use crate::selector::RouteSelector;
use crate::store::{ConfigStorage, FileStorage};
use crate::types::{
    BotScoringResult, Decision, GatewayStats, MetricRecord, RateLimitOutcome, RequestFeatures,
    StickyKind,
};
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

#[derive(Default)]
struct GatewayCounters {
    total_requests: AtomicU64,
    rate_limited: AtomicU64,
    challenges_issued: AtomicU64,
    challenges_passed: AtomicU64,
    decisions: DashMap<String, u64>,
    backend_share: DashMap<String, u64>,
}

impl GatewayCounters {
    fn note_decision(&self, decision: Decision) {
        let label = decision_label(decision);
        self.decisions
            .entry(label.to_string())
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }

    fn note_backend(&self, backend_id: &str) {
        self.backend_share
            .entry(backend_id.to_string())
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }
}

fn decision_label(decision: Decision) -> &'static str {
    match decision {
        Decision::Allow => "allow",
        Decision::Challenge => "challenge",
        Decision::Throttle => "throttle",
        Decision::Block => "block",
        Decision::Reroute => "reroute",
    }
}

/// Ensures exactly one metric record per request: every terminal path calls
/// `finish`, and cancellation (client gone, budget blown) flushes the
/// prefilled record with status 499 on drop.
struct MetricGuard {
    sink: MetricsSink,
    record: Option<MetricRecord>,
}

impl MetricGuard {
    fn new(sink: MetricsSink, features: &RequestFeatures, domain: &str) -> Self {
        Self {
            sink,
            record: Some(MetricRecord {
                request_id: features.request_id.clone(),
                timestamp: Utc::now(),
                decision: Decision::Allow,
                path: features.path.clone(),
                method: features.method.clone(),
                backend_id: None,
                latency_ms: 0,
                bot_score: None,
                bot_bucket: None,
                bot_reason: None,
                status_code: 499,
                domain: domain.to_string(),
            }),
        }
    }

    fn finish(&mut self, started: Instant, apply: impl FnOnce(&mut MetricRecord)) {
        if let Some(mut record) = self.record.take() {
            record.timestamp = Utc::now();
            record.latency_ms = started.elapsed().as_millis() as u64;
            apply(&mut record);
            self.sink.record(record);
        }
    }
}

impl Drop for MetricGuard {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            self.sink.record(record);
        }
    }
}

pub struct Gateway {
    ip_salt: String,
    request_budget: Duration,
    config_cache: Arc<ConfigCache>,
    rate_limiter: RateLimiter,
    botguard: BotGuard,
    selector: RouteSelector,
    health: HealthStore,
    proxy: UpstreamProxy,
    challenge: ChallengeSigner,
    captcha: CaptchaVerifier,
    metrics: MetricsSink,
    counters: GatewayCounters,
}

impl Gateway {
    /// Production bootstrap: Redis-backed KV when configured, file-backed
    /// config storage, background probe loop.
    pub async fn bootstrap(cfg: &GatewayConfig) -> Result<Self, GatewayError> {
        let kv: Arc<dyn KvStore> = match cfg.kv_url.as_deref() {
            Some(url) => Arc::new(RedisStore::connect(url).await?),
            None => {
                tracing::warn!("GATEWAY_KV_URL not set; using process-local KV store");
                MemoryStore::new()
            }
        };
        let storage: Arc<dyn ConfigStorage> = Arc::new(FileStorage::new(cfg.config_dir.clone()));
        Self::with_components(cfg, kv, storage)
    }

    /// Assembly seam shared by `bootstrap` and the test harness.
    pub fn with_components(
        cfg: &GatewayConfig,
        kv: Arc<dyn KvStore>,
        storage: Arc<dyn ConfigStorage>,
    ) -> Result<Self, GatewayError> {
        // proxying gets an unbounded client (the request budget is the cap);
        // control-plane calls get a short one
        let proxy_client = reqwest::Client::builder()
            .build()
            .map_err(|err| GatewayError::Any(err.into()))?;
        let control_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| GatewayError::Any(err.into()))?;

        let config_cache = Arc::new(ConfigCache::new(kv.clone(), storage, cfg.config_cache_ttl_secs));
        let health = HealthStore::new();

        if cfg.probe_interval_ms > 0 {
            Prober::new(
                control_client.clone(),
                config_cache.clone(),
                health.clone(),
                Duration::from_millis(cfg.probe_interval_ms),
            )
            .spawn();
        }

        let metrics = match cfg.metrics_sink_url.clone() {
            Some(url) => MetricsSink::spawn(control_client.clone(), url, cfg.metrics_api_key.clone()),
            None => MetricsSink::disabled(),
        };

        Ok(Self {
            ip_salt: cfg.ip_salt.clone(),
            request_budget: Duration::from_millis(cfg.request_budget_ms.max(1)),
            rate_limiter: RateLimiter::new(kv),
            botguard: BotGuard::new(
                control_client.clone(),
                cfg.ai_classifier_url.clone(),
                cfg.ai_classifier_api_key.clone(),
                cfg.ai_timeout_ms,
            ),
            selector: RouteSelector::new(),
            health,
            proxy: UpstreamProxy::new(proxy_client),
            challenge: ChallengeSigner::new(cfg.challenge_secret.clone()),
            captcha: CaptchaVerifier::new(
                control_client,
                cfg.turnstile_secret.clone(),
                cfg.hcaptcha_secret.clone(),
            ),
            config_cache,
            metrics,
            counters: GatewayCounters::default(),
        })
    }

    pub fn health_store(&self) -> &HealthStore {
        &self.health
    }

    pub fn config_cache(&self) -> &ConfigCache {
        &self.config_cache
    }

    pub fn challenge_signer(&self) -> &ChallengeSigner {
        &self.challenge
    }

    pub fn captcha_verifier(&self) -> &CaptchaVerifier {
        &self.captcha
    }

    pub fn ip_salt(&self) -> &str {
        &self.ip_salt
    }

    pub fn note_challenge_passed(&self) {
        self.counters.challenges_passed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> GatewayStats {
        let collect = |map: &DashMap<String, u64>| {
            map.iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect::<HashMap<_, _>>()
        };
        GatewayStats {
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            decisions: collect(&self.counters.decisions),
            backend_share: collect(&self.counters.backend_share),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            challenges_issued: self.counters.challenges_issued.load(Ordering::Relaxed),
            challenges_passed: self.counters.challenges_passed.load(Ordering::Relaxed),
        }
    }

    /// Single entry for all proxied traffic.
    pub async fn handle(&self, req: HttpRequest, payload: web::Payload) -> HttpResponse {
        let span = tracing::info_span!(
            "Request Journey",
            method = %req.method(),
            path = %req.path()
        );
        match tokio::time::timeout(
            self.request_budget,
            self.process(req, payload).instrument(span),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => {
                // the dropped pipeline future has already flushed its metric
                tracing::warn!("request exceeded wall-clock budget");
                HttpResponse::GatewayTimeout().json(serde_json::json!({
                    "error": "Gateway Timeout",
                    "message": "Request budget exceeded",
                }))
            }
        }
    }

    async fn process(&self, req: HttpRequest, payload: web::Payload) -> HttpResponse {
        let started = Instant::now();
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        let (domain, original_url) = {
            let conn = req.connection_info().clone();
            let domain = normalize_domain(conn.host());
            let original_url = format!("{}://{}{}", conn.scheme(), conn.host(), req.uri());
            (domain, original_url)
        };

        let config = self.config_cache.load(&domain).await;
        let route = config.resolve(config.match_policy(req.path(), req.method().as_str()));
        let mut features = features::extract(&req, &self.ip_salt, route.rate_limit.subnet_mask);

        if config.config.telemetry_sample_rate >= 1.0
            || rand::thread_rng().gen::<f64>() < config.config.telemetry_sample_rate
        {
            tracing::debug!(
                request_id = %features.request_id,
                trace_id = %features.trace_id,
                policy = %route.policy_id,
                "pipeline start"
            );
        }

        let mut guard = MetricGuard::new(self.metrics.clone(), &features, &domain);

        match self
            .run_pipeline(
                &req,
                payload,
                &config.config.challenge_page_url,
                &original_url,
                &route,
                &mut features,
                started,
                &mut guard,
            )
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let response = err.error_response();
                let status = response.status().as_u16();
                guard.finish(started, |record| {
                    record.status_code = status;
                });
                response
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &self,
        req: &HttpRequest,
        payload: web::Payload,
        challenge_page_url: &str,
        original_url: &str,
        route: &EffectiveRoute,
        features: &mut RequestFeatures,
        started: Instant,
        guard: &mut MetricGuard,
    ) -> Result<HttpResponse, GatewayError> {
        // cross-domain challenge handshake: strip the param and bounce the
        // browser back, cookie attached when the token checks out
        if let Some(token) = handshake_token(req) {
            let verified = self.challenge.verify(&token, &features.ip_hash).is_ok();
            if verified {
                self.note_challenge_passed();
            }
            let location = url_without_handshake(req);
            let mut builder = HttpResponse::Found();
            builder
                .insert_header(("Location", location))
                .insert_header(("X-Request-Id", features.request_id.as_str()));
            if verified {
                let secure = features.protocol == "https";
                builder.insert_header((
                    "Set-Cookie",
                    challenge::token_cookie(&token, secure),
                ));
            }
            let response = builder.finish();
            guard.finish(started, |record| {
                record.status_code = 302;
            });
            return Ok(response);
        }

        if route.backends.is_empty() {
            self.counters.note_decision(Decision::Block);
            guard.finish(started, |record| record.status_code = 503);
            return Err(GatewayError::NoBackends(features.host.clone()));
        }

        // a verified proof-of-human token bypasses scoring but still rate-limits
        let human_validated = challenge::extract_token(req)
            .map(|token| self.challenge.verify(&token, &features.ip_hash).is_ok())
            .unwrap_or(false);

        let rate = self
            .rate_limiter
            .check(features, &route.rate_limit, &route.policy_id)
            .await;
        features.requests_in_window = Some(rate.count);

        if !rate.allowed {
            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
            self.counters.note_decision(Decision::Throttle);
            let response = throttle_response(&rate, &features.request_id);
            guard.finish(started, |record| {
                record.decision = Decision::Throttle;
                record.status_code = 429;
            });
            return Ok(response);
        }

        let scoring = if route.bot_guard.enabled {
            Some(
                self.botguard
                    .evaluate(
                        features,
                        &route.bot_guard,
                        &route.ip_allowlist,
                        &route.ip_blocklist,
                        human_validated,
                    )
                    .await,
            )
        } else {
            None
        };

        let mut candidates = route.backends.clone();
        if let Some(result) = &scoring {
            match result.decision {
                Decision::Block => {
                    self.counters.note_decision(Decision::Block);
                    let response = HttpResponse::Forbidden()
                        .content_type("text/plain; charset=utf-8")
                        .insert_header(("X-Request-Id", features.request_id.as_str()))
                        .body("Forbidden");
                    finish_with_scoring(guard, started, result, Decision::Block, 403, None);
                    return Ok(response);
                }
                Decision::Challenge => {
                    self.counters.challenges_issued.fetch_add(1, Ordering::Relaxed);
                    self.counters.note_decision(Decision::Challenge);
                    let response = challenge::challenge_redirect(
                        challenge_page_url,
                        original_url,
                        &features.request_id,
                    );
                    finish_with_scoring(guard, started, result, Decision::Challenge, 302, None);
                    return Ok(response);
                }
                Decision::Throttle => {
                    self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                    self.counters.note_decision(Decision::Throttle);
                    let response = throttle_response(&rate, &features.request_id);
                    finish_with_scoring(guard, started, result, Decision::Throttle, 429, None);
                    return Ok(response);
                }
                Decision::Reroute => {
                    if let Some(target) = route
                        .bot_guard
                        .reroute_backend_id
                        .as_deref()
                        .and_then(|id| candidates.iter().find(|b| b.id == id && b.enabled))
                        .cloned()
                    {
                        candidates = vec![target];
                    }
                }
                Decision::Allow => {}
            }
        }

        let sticky_value = route
            .sticky
            .as_ref()
            .and_then(|sticky| sticky_hint(req, sticky));
        let selection = self
            .selector
            .select(
                &candidates,
                route.strategy,
                &route.policy_id,
                &self.health,
                route.sticky.as_ref(),
                sticky_value.as_deref(),
            )
            .ok_or_else(|| {
                guard.finish(started, |record| record.status_code = 503);
                GatewayError::NoBackends(features.host.clone())
            })?;
        self.counters.note_backend(&selection.backend.id);

        let outcome = self
            .proxy
            .forward(req, payload, &selection.backend, features)
            .await;
        if outcome.status >= 500 {
            // upstream fault is returned verbatim but captured with context
            tracing::error!(
                backend = %selection.backend.id,
                status = outcome.status,
                latency_ms = outcome.latency_ms,
                "upstream returned server error"
            );
        }

        let mut response = outcome.response;
        if selection.new_sticky_assignment {
            if let Some(sticky) = route.sticky.as_ref().filter(|s| s.kind == StickyKind::Cookie) {
                let cookie = format!("{}={}; Path=/", sticky.cookie_name, selection.backend.id);
                if let Ok(value) = actix_web::http::header::HeaderValue::from_str(&cookie) {
                    response
                        .headers_mut()
                        .append(actix_web::http::header::SET_COOKIE, value);
                }
            }
        }
        if route.rate_limit.enabled {
            append_rate_headers(&mut response, &rate);
        }

        let final_decision = match scoring.as_ref().map(|s| s.decision) {
            Some(Decision::Reroute) => Decision::Reroute,
            _ => Decision::Allow,
        };
        self.counters.note_decision(final_decision);
        let backend_id = selection.backend.id.clone();
        guard.finish(started, |record| {
            record.decision = final_decision;
            record.status_code = outcome.status;
            record.backend_id = Some(backend_id);
            if let Some(result) = &scoring {
                record.bot_score = Some(result.score);
                record.bot_bucket = Some(result.bucket);
                record.bot_reason = result.reason_tag();
            }
        });

        Ok(response)
    }
}

fn finish_with_scoring(
    guard: &mut MetricGuard,
    started: Instant,
    result: &BotScoringResult,
    decision: Decision,
    status: u16,
    backend_id: Option<String>,
) {
    let score = result.score;
    let bucket = result.bucket;
    let reason = result.reason_tag();
    guard.finish(started, |record| {
        record.decision = decision;
        record.status_code = status;
        record.backend_id = backend_id;
        record.bot_score = Some(score);
        record.bot_bucket = Some(bucket);
        record.bot_reason = reason;
    });
}

fn throttle_response(rate: &RateLimitOutcome, request_id: &str) -> HttpResponse {
    let retry_secs = rate.retry_after_ms.unwrap_or(0).div_ceil(1_000);
    HttpResponse::TooManyRequests()
        .insert_header(("Retry-After", retry_secs.to_string()))
        .insert_header(("X-RateLimit-Remaining", rate.remaining.to_string()))
        .insert_header(("X-RateLimit-Reset", rate.reset_at.timestamp().to_string()))
        .insert_header(("X-Request-Id", request_id))
        .json(serde_json::json!({
            "error": "Too Many Requests",
            "message": "Rate limit exceeded",
            "retryAfter": retry_secs,
        }))
}

fn append_rate_headers(response: &mut HttpResponse, rate: &RateLimitOutcome) {
    let headers = response.headers_mut();
    if let Ok(value) =
        actix_web::http::header::HeaderValue::from_str(&rate.remaining.to_string())
    {
        headers.insert(
            actix_web::http::header::HeaderName::from_static("x-ratelimit-remaining"),
            value,
        );
    }
    if let Ok(value) =
        actix_web::http::header::HeaderValue::from_str(&rate.reset_at.timestamp().to_string())
    {
        headers.insert(
            actix_web::http::header::HeaderName::from_static("x-ratelimit-reset"),
            value,
        );
    }
}

fn handshake_token(req: &HttpRequest) -> Option<String> {
    for pair in req.query_string().split('&') {
        if let Some((name, value)) = pair.split_once('=') {
            if name == challenge::HANDSHAKE_PARAM && !value.is_empty() {
                return urlencoding::decode(value).ok().map(|v| v.into_owned());
            }
        }
    }
    None
}

fn url_without_handshake(req: &HttpRequest) -> String {
    let remaining: Vec<&str> = req
        .query_string()
        .split('&')
        .filter(|pair| {
            !pair.is_empty()
                && pair
                    .split_once('=')
                    .map(|(name, _)| name != challenge::HANDSHAKE_PARAM)
                    .unwrap_or(true)
        })
        .collect();
    if remaining.is_empty() {
        req.path().to_string()
    } else {
        format!("{}?{}", req.path(), remaining.join("&"))
    }
}

fn sticky_hint(req: &HttpRequest, sticky: &crate::types::StickyConfig) -> Option<String> {
    match sticky.kind {
        StickyKind::Cookie => {
            let raw = req.headers().get("cookie")?.to_str().ok()?;
            for pair in raw.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    if name.trim() == sticky.cookie_name && !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
            None
        }
        StickyKind::Header => req
            .headers()
            .get(sticky.header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string()),
    }
}
