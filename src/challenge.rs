use crate::errors::GatewayError;
use actix_web::{HttpRequest, HttpResponse};
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

pub type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_TTL_SECS: i64 = 3_600;
pub const TOKEN_COOKIE: &str = "_challenge_token";
pub const TOKEN_HEADER: &str = "x-challenge-token";
/// Query parameter used by the cross-domain handshake.
pub const HANDSHAKE_PARAM: &str = "__challenge";

const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Claims carried by a proof-of-human token. `path` records where the
/// challenge was completed and is informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeClaims {
    pub ip_hash: String,
    pub path: String,
    pub completed_at: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct ChallengeSigner {
    secret: Vec<u8>,
    engine: base64::engine::general_purpose::GeneralPurpose,
}

impl ChallengeSigner {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            engine: base64::engine::general_purpose::URL_SAFE_NO_PAD,
        }
    }

    pub fn issue(&self, ip_hash: &str, path: &str) -> Result<(String, ChallengeClaims), GatewayError> {
        let now = Utc::now().timestamp();
        let claims = ChallengeClaims {
            ip_hash: ip_hash.to_string(),
            path: path.to_string(),
            completed_at: now,
            exp: now + TOKEN_TTL_SECS,
        };
        let token = self.sign_claims(&claims)?;
        Ok((token, claims))
    }

    /// Signature, expiry, then fingerprint binding, in that order.
    pub fn verify(&self, token: &str, ip_hash: &str) -> Result<ChallengeClaims, GatewayError> {
        let raw = self
            .engine
            .decode(token)
            .map_err(|err| GatewayError::InvalidToken(format!("bad token encoding: {err}")))?;
        if raw.len() < 32 {
            return Err(GatewayError::InvalidToken("token too short".into()));
        }
        let (payload, sig) = raw.split_at(raw.len() - 32);

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| GatewayError::InvalidToken("invalid secret".into()))?;
        mac.update(payload);
        mac.verify_slice(sig)
            .map_err(|_| GatewayError::InvalidToken("signature mismatch".into()))?;

        let claims: ChallengeClaims = serde_json::from_slice(payload)
            .map_err(|err| GatewayError::InvalidToken(format!("invalid claims: {err}")))?;

        if claims.exp < Utc::now().timestamp() {
            return Err(GatewayError::InvalidToken("token expired".into()));
        }
        if claims.ip_hash != ip_hash {
            return Err(GatewayError::InvalidToken("IP mismatch".into()));
        }

        Ok(claims)
    }

    fn sign_claims(&self, claims: &ChallengeClaims) -> Result<String, GatewayError> {
        let payload = serde_json::to_vec(claims)
            .map_err(|err| GatewayError::InvalidToken(format!("serialize claims: {err}")))?;
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| GatewayError::InvalidToken("invalid secret".into()))?;
        mac.update(&payload);
        let sig = mac.finalize().into_bytes();
        let mut out = payload;
        out.extend_from_slice(&sig);
        Ok(self.engine.encode(out))
    }
}

/// Token from the dedicated header, else the challenge cookie.
pub fn extract_token(req: &HttpRequest) -> Option<String> {
    if let Some(value) = req
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Some(value.to_string());
    }
    let raw = req.headers().get("cookie")?.to_str().ok()?;
    for pair in raw.split(';') {
        if let Some((name, value)) = pair.trim().split_once('=') {
            if name.trim() == TOKEN_COOKIE && !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

pub fn token_cookie(token: &str, secure: bool) -> String {
    let mut cookie = format!(
        "{TOKEN_COOKIE}={token}; Max-Age={TOKEN_TTL_SECS}; Path=/; HttpOnly; SameSite=Strict"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// 302 to the challenge page with the original URL tucked into `return`.
pub fn challenge_redirect(page_url: &str, original_url: &str, request_id: &str) -> HttpResponse {
    let location = format!("{page_url}?return={}", urlencoding::encode(original_url));
    HttpResponse::Found()
        .insert_header(("Location", location))
        .insert_header(("X-Request-Id", request_id))
        .finish()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum CaptchaProvider {
    #[default]
    Turnstile,
    Hcaptcha,
}

#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    success: bool,
}

/// Third-party human verification. Any `success == true` response is
/// acceptance; everything else, including transport failure, is rejection.
pub struct CaptchaVerifier {
    client: reqwest::Client,
    turnstile_secret: Option<String>,
    hcaptcha_secret: Option<String>,
}

impl CaptchaVerifier {
    pub fn new(
        client: reqwest::Client,
        turnstile_secret: Option<String>,
        hcaptcha_secret: Option<String>,
    ) -> Self {
        Self {
            client,
            turnstile_secret,
            hcaptcha_secret,
        }
    }

    pub async fn verify(
        &self,
        provider: CaptchaProvider,
        response_token: &str,
        remote_ip: Option<&str>,
    ) -> Result<bool, GatewayError> {
        match provider {
            CaptchaProvider::Turnstile => {
                let secret = self.turnstile_secret.as_deref().ok_or_else(|| {
                    GatewayError::CaptchaRejected("turnstile not configured".into())
                })?;
                let mut body = serde_json::json!({
                    "secret": secret,
                    "response": response_token,
                });
                if let Some(ip) = remote_ip {
                    body["remoteip"] = serde_json::Value::String(ip.to_string());
                }
                let resp = self
                    .client
                    .post("https://challenges.cloudflare.com/turnstile/v0/siteverify")
                    .timeout(VERIFY_TIMEOUT)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|err| GatewayError::CaptchaRejected(err.to_string()))?;
                let parsed: SiteVerifyResponse = resp
                    .json()
                    .await
                    .map_err(|err| GatewayError::CaptchaRejected(err.to_string()))?;
                Ok(parsed.success)
            }
            CaptchaProvider::Hcaptcha => {
                let secret = self.hcaptcha_secret.as_deref().ok_or_else(|| {
                    GatewayError::CaptchaRejected("hcaptcha not configured".into())
                })?;
                let mut form = vec![
                    ("secret", secret.to_string()),
                    ("response", response_token.to_string()),
                ];
                if let Some(ip) = remote_ip {
                    form.push(("remoteip", ip.to_string()));
                }
                let resp = self
                    .client
                    .post("https://hcaptcha.com/siteverify")
                    .timeout(VERIFY_TIMEOUT)
                    .form(&form)
                    .send()
                    .await
                    .map_err(|err| GatewayError::CaptchaRejected(err.to_string()))?;
                let parsed: SiteVerifyResponse = resp
                    .json()
                    .await
                    .map_err(|err| GatewayError::CaptchaRejected(err.to_string()))?;
                Ok(parsed.success)
            }
        }
    }
}
