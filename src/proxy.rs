use crate::types::{Backend, RequestFeatures};
use actix_web::{web, HttpRequest, HttpResponse};
use futures::StreamExt;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

/// Hop-by-hop headers never forwarded in either direction. `host` and
/// `content-length` are re-derived by the client from the rewritten URL and
/// the streamed body.
const SKIP_FORWARD: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

const SKIP_RETURN: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

pub struct ProxyOutcome {
    pub response: HttpResponse,
    pub status: u16,
    pub latency_ms: u64,
}

/// Forwards requests to the chosen backend, streaming bodies both ways.
/// Response bodies and `Content-Encoding` pass through untouched; this
/// stack never transparently decompresses.
pub struct UpstreamProxy {
    client: reqwest::Client,
}

impl UpstreamProxy {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn forward(
        &self,
        req: &HttpRequest,
        payload: web::Payload,
        backend: &Backend,
        features: &RequestFeatures,
    ) -> ProxyOutcome {
        let started = Instant::now();

        let target = match build_target_url(backend, req) {
            Ok(url) => url,
            Err(message) => {
                tracing::error!(backend = %backend.id, %message, "bad backend url in config");
                return bad_gateway(backend, features, started.elapsed().as_millis() as u64);
            }
        };

        let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return bad_gateway(backend, features, started.elapsed().as_millis() as u64);
            }
        };

        let mut upstream = self.client.request(method, target);
        for (name, value) in req.headers() {
            let lowered = name.as_str().to_ascii_lowercase();
            if SKIP_FORWARD.contains(&lowered.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                upstream = upstream.header(name.as_str(), value);
            }
        }
        upstream = upstream
            .header("x-request-id", &features.request_id)
            .header("x-trace-id", &features.trace_id)
            .header("x-backend", &backend.id);

        // the inbound payload is not Send; bridge it through a channel so the
        // upstream body can stream without buffering
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(8);
        actix_web::rt::spawn(async move {
            let mut payload = payload;
            while let Some(chunk) = payload.next().await {
                let mapped = chunk.map_err(|err| {
                    std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
                });
                if tx.send(mapped).await.is_err() {
                    break;
                }
            }
        });
        upstream = upstream.body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)));

        let resp = match upstream.send().await {
            Ok(resp) => resp,
            Err(err) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                tracing::error!(backend = %backend.id, %err, latency_ms, "upstream transport error");
                return bad_gateway(backend, features, latency_ms);
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        let status = resp.status().as_u16();
        let mut builder = HttpResponse::build(
            actix_web::http::StatusCode::from_u16(status)
                .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY),
        );
        for (name, value) in resp.headers() {
            let lowered = name.as_str().to_ascii_lowercase();
            if SKIP_RETURN.contains(&lowered.as_str()) {
                continue;
            }
            // append, not insert: upstream Set-Cookie and friends repeat
            if let Ok(value) = value.to_str() {
                builder.append_header((name.as_str(), value));
            }
        }
        builder
            .insert_header(("X-Request-Id", features.request_id.as_str()))
            .insert_header(("X-Trace-Id", features.trace_id.as_str()))
            .insert_header(("X-Backend", backend.id.as_str()));

        let response = builder.streaming(resp.bytes_stream());
        ProxyOutcome {
            response,
            status,
            latency_ms,
        }
    }
}

/// Scheme, host and port come from the backend; path and query come from
/// the original request.
fn build_target_url(backend: &Backend, req: &HttpRequest) -> Result<reqwest::Url, String> {
    let mut url = reqwest::Url::parse(&backend.url).map_err(|err| err.to_string())?;
    url.set_path(req.path());
    let query = req.query_string();
    url.set_query((!query.is_empty()).then_some(query));
    Ok(url)
}

fn bad_gateway(backend: &Backend, features: &RequestFeatures, latency_ms: u64) -> ProxyOutcome {
    let response = HttpResponse::BadGateway()
        .insert_header(("X-Request-Id", features.request_id.as_str()))
        .insert_header(("X-Backend", backend.id.as_str()))
        .insert_header(("X-Backend-Latency", latency_ms.to_string()))
        .json(serde_json::json!({
            "error": "Bad Gateway",
            "message": "Backend unavailable",
            "backend": backend.id,
        }));
    ProxyOutcome {
        response,
        status: 502,
        latency_ms,
    }
}
