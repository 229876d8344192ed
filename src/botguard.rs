use crate::types::{
    AiClassification, BotGuardConfig, BotScoringResult, Decision, RequestFeatures, RuleReason,
    ScoreBucket, ScoreThresholds,
};
use regex::Regex;
use smallvec::SmallVec;
use std::sync::OnceLock;
use std::time::Duration;

/// UA substrings that mark automation frameworks and scrapers.
const BAD_BOTS: [&str; 18] = [
    "bot",
    "crawler",
    "spider",
    "scraper",
    "curl",
    "wget",
    "python-requests",
    "httpx",
    "axios",
    "node-fetch",
    "go-http-client",
    "java/",
    "libwww",
    "headless",
    "phantom",
    "selenium",
    "puppeteer",
    "playwright",
];

/// Crawlers we never penalise on UA alone.
const GOOD_BOTS: [&str; 10] = [
    "googlebot",
    "bingbot",
    "yandexbot",
    "duckduckbot",
    "baiduspider",
    "facebookexternalhit",
    "twitterbot",
    "linkedinbot",
    "slackbot",
    "discordbot",
];

bitflags::bitflags! {
    /// Which heuristic rules fired, as a compact mask for logging.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SignalFlags: u32 {
        const MISSING_UA = 1 << 0;
        const SHORT_UA = 1 << 1;
        const BOT_UA_PATTERN = 1 << 2;
        const MISSING_ACCEPT = 1 << 3;
        const MISSING_ACCEPT_LANGUAGE = 1 << 4;
        const SUSPICIOUS_ACCEPT_LANGUAGE = 1 << 5;
        const FEW_HEADERS = 1 << 6;
        const NO_COOKIES_RETURNING = 1 << 7;
        const MISSING_ACCEPT_ENCODING = 1 << 8;
        const DEEP_PATH_NO_REFERER = 1 << 9;
        const UNUSUAL_METHOD = 1 << 10;
        const HIGH_FREQUENCY = 1 << 11;
    }
}

struct Rule {
    id: &'static str,
    weight: f64,
    flag: SignalFlags,
}

const RULES: [Rule; 12] = [
    Rule { id: "missing_ua", weight: 0.40, flag: SignalFlags::MISSING_UA },
    Rule { id: "short_ua", weight: 0.20, flag: SignalFlags::SHORT_UA },
    Rule { id: "bot_ua_pattern", weight: 0.50, flag: SignalFlags::BOT_UA_PATTERN },
    Rule { id: "missing_accept", weight: 0.25, flag: SignalFlags::MISSING_ACCEPT },
    Rule { id: "missing_accept_language", weight: 0.20, flag: SignalFlags::MISSING_ACCEPT_LANGUAGE },
    Rule { id: "suspicious_accept_language", weight: 0.15, flag: SignalFlags::SUSPICIOUS_ACCEPT_LANGUAGE },
    Rule { id: "few_headers", weight: 0.20, flag: SignalFlags::FEW_HEADERS },
    Rule { id: "no_cookies_returning", weight: 0.10, flag: SignalFlags::NO_COOKIES_RETURNING },
    Rule { id: "missing_accept_encoding", weight: 0.15, flag: SignalFlags::MISSING_ACCEPT_ENCODING },
    Rule { id: "deep_path_no_referer", weight: 0.10, flag: SignalFlags::DEEP_PATH_NO_REFERER },
    Rule { id: "unusual_method", weight: 0.30, flag: SignalFlags::UNUSUAL_METHOD },
    Rule { id: "high_frequency", weight: 0.35, flag: SignalFlags::HIGH_FREQUENCY },
];

fn ua_matches_bad_bots(ua: &str) -> bool {
    let lower = ua.to_ascii_lowercase();
    let bad = BAD_BOTS.iter().any(|needle| lower.contains(needle));
    let good = GOOD_BOTS.iter().any(|needle| lower.contains(needle));
    bad && !good
}

fn path_depth(path: &str) -> usize {
    path.split('/').filter(|seg| !seg.is_empty()).count()
}

/// Score bucketing. The medium boundary is `thresholds.low` by contract;
/// `thresholds.medium` is advisory and only surfaces in metrics.
pub fn bucket(score: f64, thresholds: &ScoreThresholds) -> ScoreBucket {
    if score >= thresholds.high {
        ScoreBucket::High
    } else if score >= thresholds.low {
        ScoreBucket::Medium
    } else {
        ScoreBucket::Low
    }
}

/// Two-letter tags and bare wildcards are not what real browsers send.
fn al_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z]{2}$|^\*$").expect("static accept-language pattern"))
}

/// Evaluate every heuristic rule against the feature record. Triggered
/// weights sum, capped at 1.
pub fn score_features(features: &RequestFeatures) -> (f64, Vec<RuleReason>, SignalFlags) {
    let ua = features.user_agent.as_str();
    let mut flags = SignalFlags::empty();

    if ua.is_empty() {
        flags |= SignalFlags::MISSING_UA;
    }
    if !ua.is_empty() && ua.len() < 20 {
        flags |= SignalFlags::SHORT_UA;
    }
    if ua_matches_bad_bots(ua) {
        flags |= SignalFlags::BOT_UA_PATTERN;
    }
    if !features.has_accept_header {
        flags |= SignalFlags::MISSING_ACCEPT;
    }
    if features.accept_language.is_none() {
        flags |= SignalFlags::MISSING_ACCEPT_LANGUAGE;
    }
    if features
        .accept_language
        .as_deref()
        .map(|al| al_pattern().is_match(al))
        .unwrap_or(false)
    {
        flags |= SignalFlags::SUSPICIOUS_ACCEPT_LANGUAGE;
    }
    if features.header_count < 5 {
        flags |= SignalFlags::FEW_HEADERS;
    }
    if !features.has_cookies && features.referer.is_some() {
        flags |= SignalFlags::NO_COOKIES_RETURNING;
    }
    if features.accept_encoding.is_none() {
        flags |= SignalFlags::MISSING_ACCEPT_ENCODING;
    }
    if path_depth(&features.path) > 2 && features.referer.is_none() {
        flags |= SignalFlags::DEEP_PATH_NO_REFERER;
    }
    if matches!(features.method.as_str(), "TRACE" | "CONNECT" | "OPTIONS") {
        flags |= SignalFlags::UNUSUAL_METHOD;
    }
    if features.requests_in_window.unwrap_or(0) > 50 {
        flags |= SignalFlags::HIGH_FREQUENCY;
    }

    let mut total = 0.0;
    let mut reasons: SmallVec<[RuleReason; 12]> = SmallVec::new();
    for rule in &RULES {
        let triggered = flags.contains(rule.flag);
        if triggered {
            total += rule.weight;
        }
        reasons.push(RuleReason {
            rule: rule.id,
            weight: rule.weight,
            triggered,
            explanation: explanation_for(rule.id, features),
        });
    }

    (total.min(1.0), reasons.into_vec(), flags)
}

fn explanation_for(rule: &'static str, features: &RequestFeatures) -> String {
    match rule {
        "missing_ua" => "no User-Agent header".into(),
        "short_ua" => format!("User-Agent only {} chars", features.user_agent.len()),
        "bot_ua_pattern" => "User-Agent matches automation patterns".into(),
        "missing_accept" => "no Accept header".into(),
        "missing_accept_language" => "no Accept-Language header".into(),
        "suspicious_accept_language" => "Accept-Language too generic".into(),
        "few_headers" => format!("only {} headers", features.header_count),
        "no_cookies_returning" => "referred visit without any cookies".into(),
        "missing_accept_encoding" => "no Accept-Encoding header".into(),
        "deep_path_no_referer" => "deep path reached with no referer".into(),
        "unusual_method" => format!("method {}", features.method),
        "high_frequency" => format!(
            "{} requests in window",
            features.requests_in_window.unwrap_or(0)
        ),
        _ => String::new(),
    }
}

pub struct BotGuard {
    client: reqwest::Client,
    classifier_url: Option<String>,
    classifier_api_key: Option<String>,
    /// Process-wide classifier timeout; policies may override per route.
    default_timeout_ms: u64,
}

impl BotGuard {
    pub fn new(
        client: reqwest::Client,
        classifier_url: Option<String>,
        classifier_api_key: Option<String>,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            client,
            classifier_url,
            classifier_api_key,
            default_timeout_ms,
        }
    }

    /// Full guard evaluation: list checks, then the challenge-token
    /// short-circuit, then heuristics with the optional classifier blend.
    /// The blocklist dominates everything, a verified token included.
    pub async fn evaluate(
        &self,
        features: &RequestFeatures,
        cfg: &BotGuardConfig,
        allowlist: &[String],
        blocklist: &[String],
        human_validated: bool,
    ) -> BotScoringResult {
        // blocklist dominates allowlist
        if blocklist.iter().any(|entry| entry == &features.ip_hash) {
            return BotScoringResult {
                score: 1.0,
                bucket: ScoreBucket::High,
                decision: Decision::Block,
                reasons: vec![RuleReason {
                    rule: "blocklist",
                    weight: 1.0,
                    triggered: true,
                    explanation: "caller fingerprint is blocklisted".into(),
                }],
                ai_result: None,
            };
        }
        if allowlist.iter().any(|entry| entry == &features.ip_hash) {
            return BotScoringResult {
                score: 0.0,
                bucket: ScoreBucket::Low,
                decision: Decision::Allow,
                reasons: vec![RuleReason {
                    rule: "allowlist",
                    weight: 0.0,
                    triggered: true,
                    explanation: "caller fingerprint is allowlisted".into(),
                }],
                ai_result: None,
            };
        }

        if human_validated {
            return BotScoringResult {
                score: 0.0,
                bucket: ScoreBucket::Low,
                decision: Decision::Allow,
                reasons: vec![RuleReason {
                    rule: "challenge_token",
                    weight: 0.0,
                    triggered: true,
                    explanation: "valid proof-of-human token".into(),
                }],
                ai_result: None,
            };
        }

        let (mut score, reasons, flags) = score_features(features);
        let mut ai_result = None;

        if cfg.use_ai_classifier {
            let timeout_ms = cfg.ai_timeout_ms.unwrap_or(self.default_timeout_ms);
            if let Some(classification) = self.classify(features, timeout_ms).await {
                score = (0.6 * score + 0.4 * classification.bot_score).min(1.0);
                ai_result = Some(classification);
            }
        }

        let bucket = bucket(score, &cfg.thresholds);
        let decision = cfg.actions.for_bucket(bucket);
        tracing::debug!(
            ip_hash = %features.ip_hash,
            score,
            ?bucket,
            signals = ?flags,
            "bot guard verdict"
        );

        BotScoringResult {
            score,
            bucket,
            decision,
            reasons,
            ai_result,
        }
    }

    /// One bounded call to the external classifier. Every failure mode
    /// (timeout, transport, status, parse) falls back to heuristics only.
    async fn classify(
        &self,
        features: &RequestFeatures,
        timeout_ms: u64,
    ) -> Option<AiClassification> {
        let url = self.classifier_url.as_deref()?;
        let body = serde_json::json!({
            "url": features.path,
            "method": features.method,
            "user_agent": features.user_agent,
        });

        let mut request = self
            .client
            .post(url)
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .json(&body);
        if let Some(key) = self.classifier_api_key.as_deref() {
            request = request.header("x-api-key", key);
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<AiClassification>().await {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    tracing::debug!(%err, "classifier response unparseable");
                    None
                }
            },
            Ok(resp) => {
                tracing::debug!(status = %resp.status(), "classifier non-success");
                None
            }
            Err(err) => {
                tracing::debug!(%err, "classifier unreachable");
                None
            }
        }
    }
}
