use actix_web::{http::StatusCode, test, web, App, HttpResponse, HttpServer};
use chrono::Utc;
use sentry_gate::api;
use sentry_gate::config::{GatewayConfig, ServerConfig};
use sentry_gate::engine::Gateway;
use sentry_gate::features;
use sentry_gate::kv::MemoryStore;
use sentry_gate::store::StaticStorage;
use sentry_gate::types::{
    Backend, BackendHealth, BotGuardConfig, ConfigStatus, GlobalConfig, RateKeyType,
    RateLimitConfig, RoutePolicy, RouteStrategy, StickyConfig,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const SALT: &str = "test-salt";
const CHALLENGE_PAGE: &str = "https://challenge.example/verify";

fn test_gateway_config() -> GatewayConfig {
    GatewayConfig {
        server: ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            workers: 1,
        },
        ip_salt: SALT.into(),
        challenge_secret: b"test-secret-key".to_vec(),
        metrics_sink_url: None,
        metrics_api_key: None,
        ai_classifier_url: None,
        ai_classifier_api_key: None,
        ai_timeout_ms: 50,
        turnstile_secret: None,
        hcaptcha_secret: None,
        kv_url: None,
        config_dir: PathBuf::from("./configs"),
        config_cache_ttl_secs: 60,
        request_budget_ms: 10_000,
        probe_interval_ms: 0,
    }
}

/// Minimal upstream that reports which backend served the request.
async fn spawn_backend(marker: &'static str) -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    let server = HttpServer::new(move || {
        App::new()
            .route("/health", web::get().to(HttpResponse::Ok))
            .default_service(web::to(move || async move {
                HttpResponse::Ok().json(serde_json::json!({ "served_by": marker }))
            }))
    })
    .listen(listener)
    .expect("listen upstream")
    .workers(1)
    .run();
    actix_web::rt::spawn(server);
    format!("http://{addr}")
}

fn backend(id: &str, url: &str, weight: u32) -> Backend {
    Backend {
        id: id.into(),
        name: id.into(),
        url: url.into(),
        weight,
        health_endpoint: "/health".into(),
        enabled: true,
        region_affinity: None,
    }
}

fn policy(id: &str, backend_ids: Vec<&str>) -> RoutePolicy {
    RoutePolicy {
        id: id.into(),
        name: id.into(),
        priority: 100,
        path_pattern: "/**".into(),
        methods: None,
        strategy: RouteStrategy::WeightedRoundRobin,
        sticky_config: None,
        backend_ids: backend_ids.into_iter().map(String::from).collect(),
        rate_limit: None,
        bot_guard: None,
        ip_allowlist: None,
        ip_blocklist: None,
        enabled: true,
    }
}

fn active_config(backends: Vec<Backend>, policies: Vec<RoutePolicy>) -> GlobalConfig {
    let now = Utc::now();
    GlobalConfig {
        version: 1,
        status: ConfigStatus::Active,
        created_at: now,
        updated_at: now,
        domain: "localhost".into(),
        backends,
        policies,
        default_rate_limit: RateLimitConfig::default(),
        default_bot_guard: BotGuardConfig::default(),
        default_strategy: RouteStrategy::WeightedRoundRobin,
        telemetry_sample_rate: 1.0,
        challenge_page_url: CHALLENGE_PAGE.into(),
    }
}

fn bootstrap_gateway(storage: Arc<StaticStorage>) -> web::Data<Gateway> {
    let cfg = test_gateway_config();
    web::Data::new(
        Gateway::with_components(&cfg, MemoryStore::new(), storage).expect("bootstrap gateway"),
    )
}

fn guarded(mut p: RoutePolicy) -> RoutePolicy {
    p.bot_guard = Some(BotGuardConfig {
        enabled: true,
        ..BotGuardConfig::default()
    });
    p
}

#[actix_web::test]
async fn legitimate_browser_is_proxied() {
    let alpha = spawn_backend("alpha").await;
    let beta = spawn_backend("beta").await;
    let storage = StaticStorage::new();
    storage.put(active_config(
        vec![backend("alpha", &alpha, 80), backend("beta", &beta, 20)],
        vec![guarded(policy("p-main", vec!["alpha", "beta"]))],
    ));
    let engine = bootstrap_gateway(storage);
    let app = test::init_service(App::new().app_data(engine.clone()).configure(api::configure)).await;

    let req = test::TestRequest::get()
        .uri("/products/42")
        .insert_header(("user-agent", CHROME_UA))
        .insert_header(("accept", "text/html,application/xhtml+xml"))
        .insert_header(("accept-language", "en-US,en;q=0.9"))
        .insert_header(("accept-encoding", "gzip, deflate, br"))
        .insert_header(("x-real-ip", "203.0.113.7"))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-backend"));
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = test::read_body_json(resp).await;
    assert!(body["served_by"].is_string());
}

#[actix_web::test]
async fn scripted_client_is_blocked() {
    let alpha = spawn_backend("alpha").await;
    let storage = StaticStorage::new();
    storage.put(active_config(
        vec![backend("alpha", &alpha, 100)],
        vec![guarded(policy("p-main", vec!["alpha"]))],
    ));
    let engine = bootstrap_gateway(storage);
    let app = test::init_service(App::new().app_data(engine.clone()).configure(api::configure)).await;

    // sparse python-requests shape: bot UA, no accept headers, few headers
    let req = test::TestRequest::get()
        .uri("/api/items")
        .insert_header(("user-agent", "python-requests/2.28.0"))
        .insert_header(("x-real-ip", "203.0.113.9"))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(resp.headers().contains_key("x-request-id"));
    let body = test::read_body(resp).await;
    assert_eq!(&body[..], &b"Forbidden"[..]);
}

#[actix_web::test]
async fn good_crawler_ua_is_not_penalised() {
    let alpha = spawn_backend("alpha").await;
    let storage = StaticStorage::new();
    storage.put(active_config(
        vec![backend("alpha", &alpha, 100)],
        vec![guarded(policy("p-main", vec!["alpha"]))],
    ));
    let engine = bootstrap_gateway(storage);
    let app = test::init_service(App::new().app_data(engine.clone()).configure(api::configure)).await;

    let req = test::TestRequest::get()
        .uri("/articles")
        .insert_header((
            "user-agent",
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
        ))
        .insert_header(("accept", "text/html"))
        .insert_header(("accept-language", "en-US"))
        .insert_header(("accept-encoding", "gzip"))
        .insert_header(("x-real-ip", "66.249.66.1"))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn medium_bucket_redirects_to_challenge_page() {
    let alpha = spawn_backend("alpha").await;
    let storage = StaticStorage::new();
    storage.put(active_config(
        vec![backend("alpha", &alpha, 100)],
        vec![guarded(policy("p-main", vec!["alpha"]))],
    ));
    let engine = bootstrap_gateway(storage);
    let app = test::init_service(App::new().app_data(engine.clone()).configure(api::configure)).await;

    // real UA but stripped of accept headers: lands in the medium bucket
    let req = test::TestRequest::get()
        .uri("/checkout")
        .insert_header(("user-agent", CHROME_UA))
        .insert_header(("x-real-ip", "203.0.113.20"))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::FOUND);
    let location = resp.headers().get("location").unwrap().to_str().unwrap();
    assert!(location.starts_with(&format!("{CHALLENGE_PAGE}?return=")));
    assert!(location.contains("%2Fcheckout"));
}

#[actix_web::test]
async fn rate_limit_storm_turns_429() {
    let alpha = spawn_backend("alpha").await;
    let storage = StaticStorage::new();
    let mut limited = policy("p-limited", vec!["alpha"]);
    limited.rate_limit = Some(RateLimitConfig {
        enabled: true,
        window_ms: 60_000,
        max_requests: 5,
        key_type: RateKeyType::Ip,
        subnet_mask: 24,
        burst_limit: None,
        retry_after_ms: 1_000,
    });
    storage.put(active_config(vec![backend("alpha", &alpha, 100)], vec![limited]));
    let engine = bootstrap_gateway(storage);
    let app = test::init_service(App::new().app_data(engine.clone()).configure(api::configure)).await;

    let mut ok = 0;
    let mut throttled = 0;
    for _ in 0..8 {
        let req = test::TestRequest::get()
            .uri("/feed")
            .insert_header(("user-agent", CHROME_UA))
            .insert_header(("accept", "text/html"))
            .insert_header(("accept-language", "en-US"))
            .insert_header(("accept-encoding", "gzip"))
            .insert_header(("x-real-ip", "198.51.100.30"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        match resp.status() {
            StatusCode::OK => {
                ok += 1;
                assert!(resp.headers().contains_key("x-ratelimit-remaining"));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                throttled += 1;
                assert!(resp.headers().contains_key("retry-after"));
                assert_eq!(
                    resp.headers().get("x-ratelimit-remaining").unwrap(),
                    "0"
                );
                assert!(resp.headers().contains_key("x-ratelimit-reset"));
                let body: Value = test::read_body_json(resp).await;
                assert_eq!(body["error"], "Too Many Requests");
                assert_eq!(body["message"], "Rate limit exceeded");
                assert!(body["retryAfter"].is_u64());
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(ok, 5);
    assert_eq!(throttled, 3);
}

#[actix_web::test]
async fn sticky_cookie_pins_and_recovers() {
    let alpha = spawn_backend("alpha").await;
    let beta = spawn_backend("beta").await;
    let storage = StaticStorage::new();
    let mut sticky = policy("p-sticky", vec!["alpha", "beta"]);
    sticky.strategy = RouteStrategy::Sticky;
    sticky.sticky_config = Some(StickyConfig::default());
    storage.put(active_config(
        vec![backend("alpha", &alpha, 50), backend("beta", &beta, 50)],
        vec![sticky],
    ));
    let engine = bootstrap_gateway(storage);
    let app = test::init_service(App::new().app_data(engine.clone()).configure(api::configure)).await;

    let browser_req = |cookie: Option<String>| {
        let mut req = test::TestRequest::get()
            .uri("/session-bound")
            .insert_header(("user-agent", CHROME_UA))
            .insert_header(("accept", "text/html"))
            .insert_header(("accept-language", "en-US"))
            .insert_header(("accept-encoding", "gzip"))
            .insert_header(("x-real-ip", "198.51.100.44"));
        if let Some(cookie) = cookie {
            req = req.insert_header(("cookie", cookie));
        }
        req.to_request()
    };

    // first visit assigns and persists a backend
    let resp = test::call_service(&app, browser_req(None)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let set_cookie = resp
        .headers()
        .get("set-cookie")
        .expect("sticky cookie set")
        .to_str()
        .unwrap()
        .to_string();
    assert!(set_cookie.starts_with("_lb_sticky="));
    let assigned = set_cookie
        .trim_start_matches("_lb_sticky=")
        .split(';')
        .next()
        .unwrap()
        .to_string();

    // second visit with the cookie lands on the same backend
    let resp = test::call_service(&app, browser_req(Some(format!("_lb_sticky={assigned}")))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("x-backend").unwrap().to_str().unwrap(),
        assigned
    );

    // once the pinned backend goes unhealthy, a new one is assigned
    engine.health_store().set(BackendHealth {
        backend_id: assigned.clone(),
        healthy: false,
        last_check: Utc::now(),
        latency_p50: None,
        latency_p95: None,
        latency_p99: None,
        error_rate: Some(1.0),
        consecutive_failures: 3,
    });
    let resp = test::call_service(&app, browser_req(Some(format!("_lb_sticky={assigned}")))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let reassigned = resp
        .headers()
        .get("x-backend")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_ne!(reassigned, assigned);
    assert!(resp.headers().contains_key("set-cookie"));
}

#[actix_web::test]
async fn valid_challenge_token_bypasses_heuristics() {
    let alpha = spawn_backend("alpha").await;
    let storage = StaticStorage::new();
    storage.put(active_config(
        vec![backend("alpha", &alpha, 100)],
        vec![guarded(policy("p-main", vec!["alpha"]))],
    ));
    let engine = bootstrap_gateway(storage);
    let app = test::init_service(App::new().app_data(engine.clone()).configure(api::configure)).await;

    let ip = "198.51.100.77";
    let ip_hash = features::hash_ip(ip, SALT);
    let (token, _claims) = engine
        .challenge_signer()
        .issue(&ip_hash, "/")
        .expect("issue token");

    // same scripted shape that gets blocked without a token
    let req = test::TestRequest::get()
        .uri("/api/items")
        .insert_header(("user-agent", "python-requests/2.28.0"))
        .insert_header(("x-real-ip", ip))
        .insert_header(("cookie", format!("_challenge_token={token}")))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-backend"));
}

#[actix_web::test]
async fn handshake_param_sets_cookie_and_redirects() {
    let alpha = spawn_backend("alpha").await;
    let storage = StaticStorage::new();
    storage.put(active_config(
        vec![backend("alpha", &alpha, 100)],
        vec![policy("p-main", vec!["alpha"])],
    ));
    let engine = bootstrap_gateway(storage);
    let app = test::init_service(App::new().app_data(engine.clone()).configure(api::configure)).await;

    let ip = "198.51.100.88";
    let ip_hash = features::hash_ip(ip, SALT);
    let (token, _claims) = engine
        .challenge_signer()
        .issue(&ip_hash, "/landing")
        .expect("issue token");

    let req = test::TestRequest::get()
        .uri(&format!("/landing?keep=1&__challenge={token}"))
        .insert_header(("user-agent", CHROME_UA))
        .insert_header(("x-real-ip", ip))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(
        resp.headers().get("location").unwrap().to_str().unwrap(),
        "/landing?keep=1"
    );
    let cookie = resp
        .headers()
        .get("set-cookie")
        .expect("handshake cookie")
        .to_str()
        .unwrap();
    assert!(cookie.starts_with("_challenge_token="));
    assert!(cookie.contains("HttpOnly"));

    // a foreign token still strips the param but sets no cookie
    let req = test::TestRequest::get()
        .uri("/landing?__challenge=not-a-token")
        .insert_header(("user-agent", CHROME_UA))
        .insert_header(("x-real-ip", ip))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(
        resp.headers().get("location").unwrap().to_str().unwrap(),
        "/landing"
    );
    assert!(resp.headers().get("set-cookie").is_none());
}

#[actix_web::test]
async fn dead_upstream_becomes_bad_gateway() {
    // bind a port and release it so nothing is listening there
    let dead_url = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    };
    let storage = StaticStorage::new();
    storage.put(active_config(
        vec![backend("alpha", &dead_url, 100)],
        vec![policy("p-main", vec!["alpha"])],
    ));
    let engine = bootstrap_gateway(storage);
    let app = test::init_service(App::new().app_data(engine.clone()).configure(api::configure)).await;

    let req = test::TestRequest::get()
        .uri("/anything")
        .insert_header(("user-agent", CHROME_UA))
        .insert_header(("x-real-ip", "203.0.113.50"))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(resp.headers().get("x-backend").unwrap(), "alpha");
    assert!(resp.headers().contains_key("x-backend-latency"));
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "Bad Gateway");
    assert_eq!(body["backend"], "alpha");
}

#[actix_web::test]
async fn empty_backend_set_is_service_unavailable() {
    let storage = StaticStorage::new();
    storage.put(active_config(vec![], vec![]));
    let engine = bootstrap_gateway(storage);
    let app = test::init_service(App::new().app_data(engine.clone()).configure(api::configure)).await;

    let req = test::TestRequest::get()
        .uri("/anything")
        .insert_header(("user-agent", CHROME_UA))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[actix_web::test]
async fn ops_endpoints_respond() {
    let alpha = spawn_backend("alpha").await;
    let storage = StaticStorage::new();
    storage.put(active_config(
        vec![backend("alpha", &alpha, 100)],
        vec![policy("p-main", vec!["alpha"])],
    ));
    let engine = bootstrap_gateway(storage);
    let app = test::init_service(App::new().app_data(engine.clone()).configure(api::configure)).await;

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/__gateway/healthz").to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ok");

    // drive one request so the stats move
    let req = test::TestRequest::get()
        .uri("/x")
        .insert_header(("user-agent", CHROME_UA))
        .insert_header(("x-real-ip", "203.0.113.60"))
        .to_request();
    test::call_service(&app, req).await;

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/__gateway/stats").to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let stats: Value = test::read_body_json(resp).await;
    assert!(stats["totalRequests"].as_u64().unwrap() >= 1);
    assert!(stats["backendShare"]["alpha"].as_u64().unwrap() >= 1);

    // external prober seam: write then read a health record
    let record = serde_json::json!({
        "backendId": "alpha",
        "healthy": false,
        "lastCheck": Utc::now().to_rfc3339(),
        "consecutiveFailures": 2,
    });
    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/__gateway/backends/health")
            .set_json(&record)
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/__gateway/backends/health")
            .to_request(),
    )
    .await;
    let listed: Value = test::read_body_json(resp).await;
    assert_eq!(listed[0]["backendId"], "alpha");
    assert_eq!(listed[0]["healthy"], false);
}
