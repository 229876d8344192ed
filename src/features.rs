use crate::types::RequestFeatures;
use actix_web::HttpRequest;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

const SESSION_COOKIE_NAMES: [&str; 3] = ["session", "sid", "_session"];

fn header_str<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Client IP per the trusted-header chain: `x-real-ip`, else the first
/// `x-forwarded-for` hop, else the unspecified address.
fn client_ip(req: &HttpRequest) -> String {
    if let Some(ip) = header_str(req, "x-real-ip") {
        return ip.trim().to_string();
    }
    if let Some(chain) = header_str(req, "x-forwarded-for") {
        if let Some(first) = chain.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    "0.0.0.0".to_string()
}

/// First 8 bytes of SHA-256(ip || salt), hex-encoded. The raw IP is dropped
/// on the floor right here.
pub fn hash_ip(ip: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// IPv4 collapses to its masked network; IPv6 is carried as-is.
pub fn derive_subnet(ip: &str, mask: u8) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let mask = mask.clamp(8, 32);
            let bits = u32::from(v4);
            let network = if mask == 32 {
                bits
            } else {
                bits & (!0u32 << (32 - mask))
            };
            format!("{}/{}", Ipv4Addr::from(network), mask)
        }
        Ok(IpAddr::V6(_)) | Err(_) => ip.to_string(),
    }
}

fn inbound_trace_id(req: &HttpRequest) -> Option<String> {
    header_str(req, "x-trace-id")
        .map(str::trim)
        .filter(|v| (8..=64).contains(&v.len()) && v.bytes().all(|b| b.is_ascii_graphic()))
        .map(|v| v.to_string())
}

struct CookieShape {
    count: usize,
    session_id: Option<String>,
}

/// Structural look at the Cookie header: pair count and the session cookie
/// value only. No other cookie value is read out.
fn cookie_shape(req: &HttpRequest) -> CookieShape {
    let Some(raw) = header_str(req, "cookie") else {
        return CookieShape {
            count: 0,
            session_id: None,
        };
    };
    let mut count = 0;
    let mut session_id = None;
    for pair in raw.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        count += 1;
        if session_id.is_none() {
            if let Some((name, value)) = pair.split_once('=') {
                if SESSION_COOKIE_NAMES.contains(&name.trim()) && !value.is_empty() {
                    session_id = Some(value.to_string());
                }
            }
        }
    }
    CookieShape { count, session_id }
}

/// Derive the privacy-preserving feature record for one request.
pub fn extract(req: &HttpRequest, ip_salt: &str, subnet_mask: u8) -> RequestFeatures {
    let ip = client_ip(req);
    let ip_hash = hash_ip(&ip, ip_salt);
    let subnet = derive_subnet(&ip, subnet_mask);

    let request_id = Uuid::new_v4().simple().to_string()[..16].to_string();
    let trace_id =
        inbound_trace_id(req).unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let cookies = cookie_shape(req);
    let conn = req.connection_info().clone();

    RequestFeatures {
        request_id,
        trace_id,
        ip_hash,
        subnet,
        method: req.method().as_str().to_string(),
        path: req.path().to_string(),
        host: conn.host().to_string(),
        protocol: conn.scheme().to_string(),
        user_agent: header_str(req, "user-agent").unwrap_or_default().to_string(),
        accept_language: header_str(req, "accept-language").map(str::to_string),
        accept_encoding: header_str(req, "accept-encoding").map(str::to_string),
        referer: header_str(req, "referer").map(str::to_string),
        origin: header_str(req, "origin").map(str::to_string),
        header_count: req.headers().len(),
        has_accept_header: header_str(req, "accept").is_some(),
        has_cookies: cookies.count > 0,
        cookie_count: cookies.count,
        country: header_str(req, "x-geo-country").map(str::to_string),
        region: header_str(req, "x-geo-region").map(str::to_string),
        city: header_str(req, "x-geo-city").map(str::to_string),
        asn: header_str(req, "x-asn").map(str::to_string),
        tls_version: header_str(req, "x-tls-version").map(str::to_string),
        session_id: cookies.session_id,
        requests_in_window: None,
        timestamp: Utc::now(),
    }
}
