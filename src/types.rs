use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal decision for a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum Decision {
    #[default]
    Allow,
    Challenge,
    Throttle,
    Block,
    Reroute,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum ScoreBucket {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[derive(Default)]
pub enum RouteStrategy {
    #[default]
    WeightedRoundRobin,
    LatencyAware,
    HealthAware,
    Sticky,
    Random,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum RateKeyType {
    #[default]
    Ip,
    Subnet,
    Session,
    Endpoint,
    Composite,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigStatus {
    Draft,
    Active,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub id: String,
    pub name: String,
    pub url: String,
    /// Relative routing weight, 0..=100.
    pub weight: u32,
    pub health_endpoint: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_affinity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendHealth {
    pub backend_id: String,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_p50: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_p95: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_p99: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl BackendHealth {
    pub fn healthy_now(backend_id: &str) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            healthy: true,
            last_check: Utc::now(),
            latency_p50: None,
            latency_p95: None,
            latency_p99: None,
            error_rate: None,
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub max_requests: u64,
    #[serde(default)]
    pub key_type: RateKeyType,
    /// IPv4 prefix length used for subnet keying, 8..=32.
    #[serde(default = "default_subnet_mask")]
    pub subnet_mask: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_limit: Option<u64>,
    #[serde(default = "default_retry_after_ms")]
    pub retry_after_ms: u64,
}

fn default_subnet_mask() -> u8 {
    24
}

fn default_retry_after_ms() -> u64 {
    1_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: 60_000,
            max_requests: 100,
            key_type: RateKeyType::Ip,
            subnet_mask: 24,
            burst_limit: None,
            retry_after_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoreThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        Self {
            low: 0.3,
            medium: 0.6,
            high: 0.85,
        }
    }
}

impl ScoreThresholds {
    /// Invariant: 0 <= low <= medium <= high <= 1.
    pub fn is_valid(&self) -> bool {
        0.0 <= self.low && self.low <= self.medium && self.medium <= self.high && self.high <= 1.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BucketActions {
    pub low: Decision,
    pub medium: Decision,
    pub high: Decision,
}

impl Default for BucketActions {
    fn default() -> Self {
        Self {
            low: Decision::Allow,
            medium: Decision::Challenge,
            high: Decision::Block,
        }
    }
}

impl BucketActions {
    pub fn for_bucket(&self, bucket: ScoreBucket) -> Decision {
        match bucket {
            ScoreBucket::Low => self.low,
            ScoreBucket::Medium => self.medium,
            ScoreBucket::High => self.high,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BotGuardConfig {
    pub enabled: bool,
    #[serde(default)]
    pub thresholds: ScoreThresholds,
    #[serde(default)]
    pub actions: BucketActions,
    #[serde(default)]
    pub use_ai_classifier: bool,
    /// Per-policy override; absent means the process-wide default applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reroute_backend_id: Option<String>,
}

impl Default for BotGuardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            thresholds: ScoreThresholds::default(),
            actions: BucketActions::default(),
            use_ai_classifier: false,
            ai_timeout_ms: None,
            reroute_backend_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum StickyKind {
    #[default]
    Cookie,
    Header,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StickyConfig {
    #[serde(rename = "type")]
    pub kind: StickyKind,
    #[serde(default = "default_sticky_cookie")]
    pub cookie_name: String,
    #[serde(default = "default_sticky_header")]
    pub header_name: String,
}

fn default_sticky_cookie() -> String {
    "_lb_sticky".into()
}

fn default_sticky_header() -> String {
    "X-Backend-Affinity".into()
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            kind: StickyKind::Cookie,
            cookie_name: default_sticky_cookie(),
            header_name: default_sticky_header(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutePolicy {
    pub id: String,
    pub name: String,
    pub priority: i32,
    pub path_pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    #[serde(default)]
    pub strategy: RouteStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky_config: Option<StickyConfig>,
    #[serde(default)]
    pub backend_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_guard: Option<BotGuardConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_allowlist: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_blocklist: Option<Vec<String>>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    pub version: u64,
    pub status: ConfigStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub domain: String,
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default)]
    pub policies: Vec<RoutePolicy>,
    #[serde(default)]
    pub default_rate_limit: RateLimitConfig,
    #[serde(default)]
    pub default_bot_guard: BotGuardConfig,
    #[serde(default)]
    pub default_strategy: RouteStrategy,
    #[serde(default = "default_sample_rate")]
    pub telemetry_sample_rate: f64,
    #[serde(default)]
    pub challenge_page_url: String,
}

fn default_sample_rate() -> f64 {
    1.0
}

impl GlobalConfig {
    /// Last-resort config used when storage is unreachable: no backends,
    /// nothing enforced, so traffic surfaces a clean 503 instead of an
    /// opaque failure.
    pub fn fallback(domain: &str) -> Self {
        let now = Utc::now();
        Self {
            version: 0,
            status: ConfigStatus::Active,
            created_at: now,
            updated_at: now,
            domain: domain.to_string(),
            backends: Vec::new(),
            policies: Vec::new(),
            default_rate_limit: RateLimitConfig::default(),
            default_bot_guard: BotGuardConfig::default(),
            default_strategy: RouteStrategy::Random,
            telemetry_sample_rate: 1.0,
            challenge_page_url: String::new(),
        }
    }

    pub fn backend(&self, id: &str) -> Option<&Backend> {
        self.backends.iter().find(|b| b.id == id)
    }
}

/// Privacy-preserving view of one request. Read-only after extraction; the
/// raw client IP and non-session cookie values never leave the extractor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFeatures {
    pub request_id: String,
    pub trace_id: String,
    pub ip_hash: String,
    pub subnet: String,
    pub method: String,
    pub path: String,
    pub host: String,
    pub protocol: String,
    pub user_agent: String,
    pub accept_language: Option<String>,
    pub accept_encoding: Option<String>,
    pub referer: Option<String>,
    pub origin: Option<String>,
    pub header_count: usize,
    pub has_accept_header: bool,
    pub has_cookies: bool,
    pub cookie_count: usize,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub asn: Option<String>,
    pub tls_version: Option<String>,
    pub session_id: Option<String>,
    pub requests_in_window: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleReason {
    pub rule: &'static str,
    pub weight: f64,
    pub triggered: bool,
    pub explanation: String,
}

/// Response shape of the external classifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AiClassification {
    pub bot_score: f64,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BotScoringResult {
    pub score: f64,
    pub bucket: ScoreBucket,
    pub decision: Decision,
    pub reasons: Vec<RuleReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_result: Option<AiClassification>,
}

impl BotScoringResult {
    /// Short tag describing the dominant reason, for metric records.
    pub fn reason_tag(&self) -> Option<String> {
        self.reasons
            .iter()
            .filter(|r| r.triggered)
            .max_by(|a, b| a.weight.partial_cmp(&b.weight).unwrap_or(std::cmp::Ordering::Equal))
            .map(|r| r.rule.to_string())
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    /// Window count observed by this check; feeds the frequency signal.
    pub count: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after_ms: Option<u64>,
    pub key_type: RateKeyType,
    pub key: String,
}

/// Outcome of backend selection.
#[derive(Debug, Clone)]
pub struct Selection {
    pub backend: Backend,
    pub strategy: RouteStrategy,
    pub candidates_count: usize,
    pub selection_reason: String,
    pub latency_estimate: Option<f64>,
    /// True when a sticky strategy picked a fresh backend and the response
    /// must persist the assignment.
    pub new_sticky_assignment: bool,
}

/// One record posted to the metrics sink per request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub decision: Decision,
    pub path: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_bucket: Option<ScoreBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_reason: Option<String>,
    pub status_code: u16,
    pub domain: String,
}

/// Aggregate counters surfaced on the ops endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub total_requests: u64,
    pub decisions: std::collections::HashMap<String, u64>,
    pub backend_share: std::collections::HashMap<String, u64>,
    pub rate_limited: u64,
    pub challenges_issued: u64,
    pub challenges_passed: u64,
}
