use crate::challenge::{self, CaptchaProvider};
use crate::engine::Gateway;
use crate::errors::GatewayError;
use crate::features;
use crate::types::BackendHealth;
use actix_cors::Cors;
use actix_web::{get, post, web, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Ops surface lives under `/__gateway/` so it can never shadow a proxied
/// route; everything else falls through to the pipeline.
pub fn configure(cfg: &mut web::ServiceConfig) {
    let cors = Cors::default()
        .allow_any_origin()
        .allowed_methods(vec!["GET", "POST"])
        .allowed_headers(vec![
            actix_web::http::header::CONTENT_TYPE,
            actix_web::http::header::ACCEPT,
            actix_web::http::header::AUTHORIZATION,
        ])
        .max_age(3600);

    cfg.service(
        web::scope("/__gateway")
            .wrap(cors)
            .service(get_healthz)
            .service(get_stats)
            .service(invalidate_config)
            .service(get_backend_health)
            .service(set_backend_health)
            .service(verify_challenge),
    )
    .default_service(web::to(proxy_entry));
}

async fn proxy_entry(
    req: HttpRequest,
    payload: web::Payload,
    engine: web::Data<Gateway>,
) -> HttpResponse {
    engine.handle(req, payload).await
}

#[get("/healthz")]
async fn get_healthz(engine: web::Data<Gateway>) -> impl Responder {
    #[derive(Serialize)]
    struct HealthResponse {
        status: &'static str,
        cached_domains: usize,
        timestamp: String,
    }

    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        cached_domains: engine.config_cache().cached_domains(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

#[get("/stats")]
async fn get_stats(engine: web::Data<Gateway>) -> impl Responder {
    HttpResponse::Ok().json(engine.stats())
}

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    domain: String,
}

#[post("/config/invalidate")]
async fn invalidate_config(
    engine: web::Data<Gateway>,
    payload: web::Json<InvalidateRequest>,
) -> Result<impl Responder, GatewayError> {
    engine.config_cache().invalidate(&payload.domain).await;
    Ok(HttpResponse::NoContent())
}

#[get("/backends/health")]
async fn get_backend_health(engine: web::Data<Gateway>) -> impl Responder {
    HttpResponse::Ok().json(engine.health_store().all())
}

/// Narrow seam the external prober writes through.
#[post("/backends/health")]
async fn set_backend_health(
    engine: web::Data<Gateway>,
    payload: web::Json<BackendHealth>,
) -> Result<impl Responder, GatewayError> {
    engine.health_store().set(payload.into_inner());
    Ok(HttpResponse::NoContent())
}

#[derive(Debug, Deserialize)]
struct ChallengeVerifyRequest {
    token: String,
    #[serde(default)]
    provider: CaptchaProvider,
    #[serde(default)]
    return_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChallengeVerifyResponse {
    verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect: Option<String>,
}

/// Completes the third-party human check and issues the signed token bound
/// to the caller's fingerprint.
#[post("/challenge/verify")]
async fn verify_challenge(
    req: HttpRequest,
    engine: web::Data<Gateway>,
    payload: web::Json<ChallengeVerifyRequest>,
) -> Result<HttpResponse, GatewayError> {
    let body = payload.into_inner();
    let accepted = engine
        .captcha_verifier()
        .verify(body.provider, &body.token, None)
        .await?;
    if !accepted {
        return Err(GatewayError::CaptchaRejected(
            "verification did not succeed".into(),
        ));
    }

    let features = features::extract(&req, engine.ip_salt(), 24);
    let completed_path = body
        .return_url
        .as_deref()
        .and_then(|url| reqwest::Url::parse(url).ok())
        .map(|url| url.path().to_string())
        .unwrap_or_else(|| "/".to_string());
    let (token, _claims) = engine
        .challenge_signer()
        .issue(&features.ip_hash, &completed_path)?;
    engine.note_challenge_passed();

    let secure = features.protocol == "https";
    Ok(HttpResponse::Ok()
        .insert_header(("Set-Cookie", challenge::token_cookie(&token, secure)))
        .insert_header(("X-Request-Id", features.request_id.as_str()))
        .json(ChallengeVerifyResponse {
            verified: true,
            redirect: body.return_url,
        }))
}
