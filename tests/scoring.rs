use chrono::Utc;
use sentry_gate::botguard::{bucket, score_features, BotGuard, SignalFlags};
use sentry_gate::challenge::ChallengeSigner;
use sentry_gate::features::{derive_subnet, hash_ip};
use sentry_gate::types::{
    BotGuardConfig, Decision, GlobalConfig, RequestFeatures, ScoreBucket, ScoreThresholds,
};

fn browser_features() -> RequestFeatures {
    RequestFeatures {
        request_id: "req0123456789abc".into(),
        trace_id: "trace0123456789abcdef0123456789ab".into(),
        ip_hash: hash_ip("203.0.113.7", "salt"),
        subnet: "203.0.113.0/24".into(),
        method: "GET".into(),
        path: "/products".into(),
        host: "shop.example".into(),
        protocol: "https".into(),
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            .into(),
        accept_language: Some("en-US,en;q=0.9".into()),
        accept_encoding: Some("gzip, deflate, br".into()),
        referer: None,
        origin: None,
        header_count: 9,
        has_accept_header: true,
        has_cookies: true,
        cookie_count: 2,
        country: None,
        region: None,
        city: None,
        asn: None,
        tls_version: None,
        session_id: None,
        requests_in_window: Some(3),
        timestamp: Utc::now(),
    }
}

#[test]
fn clean_browser_scores_zero() {
    let (score, reasons, flags) = score_features(&browser_features());
    assert_eq!(score, 0.0);
    assert!(flags.is_empty());
    assert!(reasons.iter().all(|r| !r.triggered));
}

#[test]
fn scripted_client_saturates_the_score() {
    let mut features = browser_features();
    features.user_agent = "python-requests/2.28.0".into();
    features.has_accept_header = false;
    features.accept_language = None;
    features.accept_encoding = None;
    features.header_count = 4;

    let (score, _reasons, flags) = score_features(&features);
    assert_eq!(score, 1.0);
    assert!(flags.contains(SignalFlags::BOT_UA_PATTERN));
    assert!(flags.contains(SignalFlags::MISSING_ACCEPT));
    assert!(flags.contains(SignalFlags::MISSING_ACCEPT_LANGUAGE));
    assert!(flags.contains(SignalFlags::MISSING_ACCEPT_ENCODING));
    assert!(flags.contains(SignalFlags::FEW_HEADERS));
    assert!(!flags.contains(SignalFlags::SHORT_UA));
}

#[test]
fn known_crawlers_are_exempt_from_the_ua_rule() {
    let mut features = browser_features();
    features.user_agent =
        "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)".into();
    let (_, _, flags) = score_features(&features);
    assert!(!flags.contains(SignalFlags::BOT_UA_PATTERN));

    features.user_agent = "SomeScraperBot/1.0".into();
    let (_, _, flags) = score_features(&features);
    assert!(flags.contains(SignalFlags::BOT_UA_PATTERN));
}

#[test]
fn individual_signals_fire() {
    let mut features = browser_features();
    features.user_agent = String::new();
    let (_, _, flags) = score_features(&features);
    assert!(flags.contains(SignalFlags::MISSING_UA));
    assert!(!flags.contains(SignalFlags::SHORT_UA));

    let mut features = browser_features();
    features.user_agent = "curl/8.0".into();
    let (_, _, flags) = score_features(&features);
    assert!(flags.contains(SignalFlags::SHORT_UA));
    assert!(flags.contains(SignalFlags::BOT_UA_PATTERN));

    let mut features = browser_features();
    features.method = "OPTIONS".into();
    let (_, _, flags) = score_features(&features);
    assert!(flags.contains(SignalFlags::UNUSUAL_METHOD));

    let mut features = browser_features();
    features.requests_in_window = Some(51);
    let (_, _, flags) = score_features(&features);
    assert!(flags.contains(SignalFlags::HIGH_FREQUENCY));
    features.requests_in_window = Some(50);
    let (_, _, flags) = score_features(&features);
    assert!(!flags.contains(SignalFlags::HIGH_FREQUENCY));

    let mut features = browser_features();
    features.path = "/a/b/c".into();
    features.referer = None;
    let (_, _, flags) = score_features(&features);
    assert!(flags.contains(SignalFlags::DEEP_PATH_NO_REFERER));
    features.referer = Some("https://shop.example/".into());
    let (_, _, flags) = score_features(&features);
    assert!(!flags.contains(SignalFlags::DEEP_PATH_NO_REFERER));

    let mut features = browser_features();
    features.has_cookies = false;
    features.cookie_count = 0;
    features.referer = Some("https://shop.example/".into());
    let (_, _, flags) = score_features(&features);
    assert!(flags.contains(SignalFlags::NO_COOKIES_RETURNING));
}

#[test]
fn suspicious_accept_language_patterns() {
    let mut features = browser_features();
    for (value, suspicious) in [("en", true), ("*", true), ("en-US", false), ("en-US,en;q=0.9", false)]
    {
        features.accept_language = Some(value.into());
        let (_, _, flags) = score_features(&features);
        assert_eq!(
            flags.contains(SignalFlags::SUSPICIOUS_ACCEPT_LANGUAGE),
            suspicious,
            "accept-language {value:?}"
        );
    }
}

#[test]
fn score_stays_in_unit_interval() {
    let mut features = browser_features();
    features.user_agent = String::new();
    features.has_accept_header = false;
    features.accept_language = None;
    features.accept_encoding = None;
    features.header_count = 1;
    features.method = "TRACE".into();
    features.requests_in_window = Some(500);
    features.path = "/a/b/c/d".into();
    features.has_cookies = false;

    let (score, _, _) = score_features(&features);
    assert!((0.0..=1.0).contains(&score));
    assert_eq!(score, 1.0);
}

#[test]
fn bucket_boundaries_use_low_and_high() {
    let thresholds = ScoreThresholds {
        low: 0.3,
        medium: 0.6,
        high: 0.85,
    };
    assert_eq!(bucket(0.29, &thresholds), ScoreBucket::Low);
    assert_eq!(bucket(0.30, &thresholds), ScoreBucket::Medium);
    // the medium threshold is advisory: 0.6..0.85 stays medium
    assert_eq!(bucket(0.84, &thresholds), ScoreBucket::Medium);
    assert_eq!(bucket(0.85, &thresholds), ScoreBucket::High);
    assert_eq!(bucket(1.0, &thresholds), ScoreBucket::High);
}

#[actix_web::test]
async fn blocklist_dominates_allowlist_and_tokens() {
    let guard = BotGuard::new(reqwest::Client::new(), None, None, 50);
    let cfg = BotGuardConfig {
        enabled: true,
        ..BotGuardConfig::default()
    };
    let features = browser_features();
    let listed = vec![features.ip_hash.clone()];

    // blocklisted: terminal block even with a verified token in hand
    let result = guard
        .evaluate(&features, &cfg, &listed, &listed, true)
        .await;
    assert_eq!(result.decision, Decision::Block);
    assert_eq!(result.score, 1.0);
    assert_eq!(result.bucket, ScoreBucket::High);
    assert_eq!(result.reasons[0].rule, "blocklist");

    // allowlisted only: terminal allow with a zero score
    let result = guard
        .evaluate(&features, &cfg, &listed, &[], false)
        .await;
    assert_eq!(result.decision, Decision::Allow);
    assert_eq!(result.score, 0.0);
    assert_eq!(result.reasons[0].rule, "allowlist");
}

#[actix_web::test]
async fn verified_token_skips_heuristics() {
    let guard = BotGuard::new(reqwest::Client::new(), None, None, 50);
    let cfg = BotGuardConfig {
        enabled: true,
        ..BotGuardConfig::default()
    };
    let mut features = browser_features();
    features.user_agent = "python-requests/2.28.0".into();
    features.has_accept_header = false;
    features.accept_language = None;
    features.accept_encoding = None;
    features.header_count = 3;

    let scored = guard.evaluate(&features, &cfg, &[], &[], false).await;
    assert_eq!(scored.decision, Decision::Block);

    let validated = guard.evaluate(&features, &cfg, &[], &[], true).await;
    assert_eq!(validated.decision, Decision::Allow);
    assert_eq!(validated.score, 0.0);
    assert_eq!(validated.bucket, ScoreBucket::Low);
    assert_eq!(validated.reasons[0].rule, "challenge_token");
}

#[test]
fn challenge_token_round_trip() {
    let signer = ChallengeSigner::new(b"round-trip-secret".to_vec());
    let ip_hash = hash_ip("198.51.100.1", "salt");
    let (token, claims) = signer.issue(&ip_hash, "/checkout").expect("issue");
    assert_eq!(claims.ip_hash, ip_hash);
    assert_eq!(claims.path, "/checkout");
    assert_eq!(claims.exp - claims.completed_at, 3_600);

    let verified = signer.verify(&token, &ip_hash).expect("verify");
    assert_eq!(verified.ip_hash, ip_hash);

    // binding to a different caller fails
    let other_hash = hash_ip("198.51.100.2", "salt");
    assert!(signer.verify(&token, &other_hash).is_err());

    // a different secret fails
    let other_signer = ChallengeSigner::new(b"another-secret".to_vec());
    assert!(other_signer.verify(&token, &ip_hash).is_err());

    // tampering with the payload fails
    let mut tampered = token.clone();
    tampered.replace_range(0..1, if token.starts_with('A') { "B" } else { "A" });
    assert!(signer.verify(&tampered, &ip_hash).is_err());
}

#[test]
fn ip_hash_is_fixed_length_and_salted() {
    let a = hash_ip("203.0.113.7", "salt-1");
    let b = hash_ip("203.0.113.7", "salt-2");
    let c = hash_ip("203.0.113.8", "salt-1");
    assert_eq!(a.len(), 16);
    assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    assert_ne!(a, b);
    assert_ne!(a, c);
    assert_eq!(a, hash_ip("203.0.113.7", "salt-1"));
}

#[test]
fn subnet_derivation_masks_ipv4_only() {
    assert_eq!(derive_subnet("203.0.113.77", 24), "203.0.113.0/24");
    assert_eq!(derive_subnet("203.0.113.77", 16), "203.0.0.0/16");
    assert_eq!(derive_subnet("203.0.113.77", 32), "203.0.113.77/32");
    assert_eq!(derive_subnet("2001:db8::1", 24), "2001:db8::1");
    assert_eq!(derive_subnet("not-an-ip", 24), "not-an-ip");
}

#[test]
fn global_config_json_round_trips() {
    let raw = serde_json::json!({
        "version": 7,
        "status": "active",
        "createdAt": "2026-01-01T00:00:00Z",
        "updatedAt": "2026-01-02T00:00:00Z",
        "domain": "shop.example",
        "backends": [{
            "id": "a",
            "name": "a",
            "url": "http://10.0.0.1:8080",
            "weight": 80,
            "healthEndpoint": "/health",
            "enabled": true
        }],
        "policies": [{
            "id": "p1",
            "name": "api",
            "priority": 10,
            "pathPattern": "/api/**",
            "methods": ["GET", "POST"],
            "strategy": "latency-aware",
            "backendIds": ["a"],
            "rateLimit": {
                "enabled": true,
                "windowMs": 60000,
                "maxRequests": 100,
                "keyType": "composite",
                "subnetMask": 24,
                "retryAfterMs": 1000
            },
            "enabled": true
        }],
        "defaultRateLimit": {
            "enabled": false,
            "windowMs": 60000,
            "maxRequests": 100,
            "keyType": "ip",
            "subnetMask": 24,
            "retryAfterMs": 1000
        },
        "defaultBotGuard": {
            "enabled": true,
            "thresholds": { "low": 0.3, "medium": 0.6, "high": 0.85 },
            "actions": { "low": "allow", "medium": "challenge", "high": "block" },
            "useAiClassifier": false,
            "aiTimeoutMs": 50
        },
        "defaultStrategy": "weighted-round-robin",
        "telemetrySampleRate": 0.5,
        "challengePageUrl": "https://challenge.example/verify"
    });

    let parsed: GlobalConfig = serde_json::from_value(raw).expect("parse config");
    let reparsed: GlobalConfig =
        serde_json::from_str(&serde_json::to_string(&parsed).expect("serialise"))
            .expect("reparse");
    assert_eq!(parsed, reparsed);
    assert_eq!(parsed.policies[0].rate_limit.as_ref().unwrap().window_ms, 60_000);
}
