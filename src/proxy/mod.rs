use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{
    HeaderName, CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE,
};
use http::{HeaderMap, HeaderValue, Request, Response, Uri};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::config::ProxySettings;
use crate::context::BoxBody;
use crate::router::Upstream;
use crate::WafError;

/// Headers that describe one hop of the connection, never the end-to-end
/// payload — stripped on both the outbound request and the inbound response
/// (§4.5). `Connection`'s own value may additionally name further headers to
/// strip; those are removed too.
fn hop_by_hop_names() -> [HeaderName; 6] {
    [
        CONNECTION,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
    ]
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let connection_named: Vec<String> = headers
        .get(&CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .collect()
        })
        .unwrap_or_default();

    for name in hop_by_hop_names() {
        headers.remove(name);
    }
    headers.remove(&UPGRADE);
    for name in connection_named {
        if let Ok(header) = HeaderName::try_from(name) {
            headers.remove(header);
        }
    }
}

/// Appends the resolved `client_ip` (§4.1) to `X-Forwarded-For`, sets
/// `X-Forwarded-Proto` (default `http` when the inbound request carried
/// none) and overwrites `X-Forwarded-Host` with the request's own `Host`.
/// The orchestrator is responsible for dropping an inbound `X-Forwarded-For`
/// that arrived over an untrusted peer before this ever runs — this
/// function only ever appends.
fn inject_forwarded_headers(headers: &mut HeaderMap, client_ip: std::net::IpAddr, host: &str) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");

    let client = client_ip.to_string();
    let combined = match headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {client}"),
        _ => client,
    };
    if let Ok(v) = HeaderValue::from_str(&combined) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if let Ok(v) = HeaderValue::from_str(host) {
        headers.insert(XFH.clone(), v);
    }
}

/// Wraps an upstream response body so that an I/O error mid-stream, or the
/// overall request deadline being exceeded while still streaming, truncates
/// the stream instead of surfacing an error frame the client can't use —
/// response headers are already on the wire by the time this runs, so there
/// is no status code left to change (§4.5: "close the client connection if
/// headers were already sent"). The failure is still counted and logged
/// exactly once.
struct DeadlineBody<B> {
    inner: B,
    deadline: Instant,
    recorded: AtomicBool,
}

impl<B> DeadlineBody<B> {
    fn record_once(&self, error_type: &'static str, detail: impl std::fmt::Display) {
        if self
            .recorded
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            metrics::counter!("upstream_errors_total", "error_type" => error_type).increment(1);
            tracing::warn!(error_type, %detail, "response truncated mid-stream");
        }
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body<Data = Bytes, Error = hyper::Error> + Unpin,
{
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        if Instant::now() >= this.deadline {
            this.record_once("timeout", "request timeout exceeded while streaming body");
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Err(e))) => {
                this.record_once("read", &e);
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

/// Increments `client_aborts_total` if dropped before `disarm` is called —
/// the only signal available when the client disconnects mid-request, since
/// that just cancels whatever future is currently being polled.
struct AbortGuard {
    armed: bool,
}

impl AbortGuard {
    fn new() -> Self {
        Self { armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if self.armed {
            metrics::counter!("client_aborts_total").increment(1);
        }
    }
}

/// The Forward Proxy (§4.5): one shared keep-alive client reused across every
/// request, a single overall timeout per attempt, and no retry — a rejected
/// or failed upstream attempt is terminal.
pub struct ForwardProxy {
    client: Client<HttpsConnector<HttpConnector>, BoxBody>,
    request_timeout: Duration,
}

impl ForwardProxy {
    pub fn new(settings: &ProxySettings) -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_millis(settings.connect_timeout_ms)));

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(settings.pool_idle_timeout_secs))
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .build(https);

        Self {
            client,
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
        }
    }

    /// Forwards `req` to `upstream`, rewriting its URI to the upstream's
    /// origin and leaving the request-target (path and query) exactly as the
    /// client sent it — the raw form, not the normalized one (§4.5).
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        upstream: &Upstream,
        client_ip: std::net::IpAddr,
        host: &str,
    ) -> Result<Response<BoxBody>, WafError> {
        let mut guard = AbortGuard::new();
        let started = Instant::now();

        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        inject_forwarded_headers(&mut parts.headers, client_ip, host);

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target_uri: Uri = format!("{}{}", upstream.base_url, path_and_query)
            .parse()
            .map_err(|e| WafError::RequestMalformed(format!("unroutable target uri: {e}")))?;
        parts.uri = target_uri;
        if let Some(authority) = parts.uri.authority().map(|a| a.as_str().to_owned()) {
            if let Ok(v) = HeaderValue::from_str(&authority) {
                parts.headers.insert(HOST, v);
            }
        }

        let outbound = Request::from_parts(parts, body.boxed());

        let deadline = started + self.request_timeout;
        let attempt = tokio::time::timeout(self.request_timeout, self.client.request(outbound));

        let result = attempt.await;
        guard.disarm();

        let upstream_resp = match result {
            Err(_elapsed) => return Err(WafError::UpstreamTimeout),
            Ok(Err(e)) => {
                return Err(if e.is_connect() {
                    WafError::UpstreamConnect(e.to_string())
                } else {
                    WafError::UpstreamRead(e.to_string())
                })
            }
            Ok(Ok(resp)) => resp,
        };

        let (mut resp_parts, resp_body) = upstream_resp.into_parts();
        strip_hop_by_hop(&mut resp_parts.headers);

        let bounded_body = DeadlineBody {
            inner: resp_body,
            deadline,
            recorded: AtomicBool::new(false),
        }
        .boxed();

        Ok(Response::from_parts(resp_parts, bounded_body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_hop_by_hop_removes_fixed_set_and_connection_named_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONNECTION,
            HeaderValue::from_static("keep-alive, x-custom-hop"),
        );
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-custom-hop", HeaderValue::from_static("drop-me"));
        headers.insert("x-keep", HeaderValue::from_static("keep-me"));

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains_key(CONNECTION));
        assert!(!headers.contains_key(TRANSFER_ENCODING));
        assert!(!headers.contains_key("x-custom-hop"));
        assert!(headers.contains_key("x-keep"));
    }

    #[test]
    fn inject_forwarded_headers_appends_peer_and_sets_host() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.5"));
        let peer: std::net::IpAddr = "10.0.0.9".parse().unwrap();
        inject_forwarded_headers(&mut headers, peer, "api.example.com");

        assert_eq!(
            headers.get("x-forwarded-for").unwrap().to_str().unwrap(),
            "203.0.113.5, 10.0.0.9"
        );
        assert_eq!(
            headers.get("x-forwarded-proto").unwrap().to_str().unwrap(),
            "http"
        );
        assert_eq!(
            headers.get("x-forwarded-host").unwrap().to_str().unwrap(),
            "api.example.com"
        );
    }

    #[test]
    fn inject_forwarded_headers_starts_fresh_when_no_inbound_xff() {
        let mut headers = HeaderMap::new();
        let peer: std::net::IpAddr = "8.8.8.8".parse().unwrap();
        inject_forwarded_headers(&mut headers, peer, "h");
        assert_eq!(
            headers.get("x-forwarded-for").unwrap().to_str().unwrap(),
            "8.8.8.8"
        );
    }
}
