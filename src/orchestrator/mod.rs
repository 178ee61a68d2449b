use std::net::SocketAddr;

use http::{HeaderValue, Request, Response, StatusCode};
use hyper::body::Incoming;

use crate::config::WafMode;
use crate::context::{empty_body, full_body, BoxBody, RequestContext};
use crate::normalize;
use crate::server::GatewayState;
use crate::waf::{Verdict, IP_BLOCKLIST_RULE_ID};
use crate::WafError;

const DECISION_HEADER: &str = "x-waf-decision";
const SCORE_HEADER: &str = "x-waf-score";
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Sequences Normalizer → IP fast paths → Rate Limiter → Rule Engine →
/// Router → Forward Proxy, in the fixed order of §4.6. `/healthz`, `/readyz`
/// and `/metrics` never reach this function at all — they're served by the
/// separate admin listener, so step 1's "short-circuit before any WAF logic"
/// holds structurally rather than as a path check here.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let snapshot = state.snapshot();

    let method = req.method().as_str().to_string();
    let path_raw = req.uri().path().to_string();
    let mut ctx = RequestContext::new(peer_addr, method, path_raw);

    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    ctx.client_ip =
        normalize::resolve_client_ip(peer_addr, req.headers(), &snapshot.config.trusted_proxies);
    ctx.path_norm = normalize::normalize_path(req.uri().path());
    ctx.query_norm = normalize::normalize_query(req.uri());
    ctx.headers_subset = normalize::header_subset(req.headers());

    let peer_trusted = snapshot.config.trusted_proxies.trusts(peer_addr.ip());

    // Step 4: an explicit deny wins even over the allow-list — the
    // allow-list is a shortcut around the engine, not an override of one.
    if snapshot.blocklist.contains(&ctx.client_ip) {
        ctx.verdict = Verdict::Block;
        ctx.forwarded_verdict = Verdict::Block;
        // §4.2 calls the IP-blocklist gate's score "∞" — no finite wire
        // representation exists for that, so the block threshold itself is
        // used: any score at or above it already means BLOCK, which is all
        // a client or the access log needs to see here.
        ctx.score = snapshot.rules.thresholds().block;
        ctx.rule_hits = vec![IP_BLOCKLIST_RULE_ID.to_string()];
        let resp = block_response(&ctx);
        return Ok(finish(ctx, resp, None));
    }

    // Step 3: allow-listed IPs skip the rate limiter and rule engine
    // entirely and go straight to routing.
    let allow_listed = snapshot.allowlist.contains(&ctx.client_ip);

    if !allow_listed {
        // Step 5: Rate Limiter — a deny here skips rule evaluation entirely.
        if !snapshot.rate_limiter.admit(ctx.client_ip).await {
            metrics::counter!(
                "rate_limited_requests_total",
                "client_ip" => ctx.client_ip.to_string(),
            )
            .increment(1);
            let resp = rate_limited_response();
            return Ok(finish(ctx, resp, None));
        }

        // Step 6: Rule Engine.
        let (score, verdict, hits) = snapshot.rules.evaluate(&ctx);
        ctx.score = score;
        ctx.verdict = verdict;
        ctx.forwarded_verdict = verdict;
        ctx.rule_hits = hits;

        // Step 7: in enforce mode a true BLOCK is rejected outright. In
        // monitor mode the request still proceeds to routing — only the
        // forwarding decision is downgraded to SUSPICIOUS; the true verdict
        // stays on `ctx.verdict` for logging and metrics (§3 `WafMode`,
        // §4.2: "the original verdict is still recorded in logs and
        // metrics").
        if verdict == Verdict::Block {
            if snapshot.config.waf_settings.mode == WafMode::Enforce {
                let resp = block_response(&ctx);
                return Ok(finish(ctx, resp, None));
            }
            ctx.forwarded_verdict = Verdict::Suspicious;
        }
    }

    // Step 8: Router, then Forward Proxy.
    let Some(upstream) = snapshot.router.route(&host, &ctx.path_norm) else {
        // §4.4: an empty pool is a routing failure, not a WAF block — it's
        // reported in its own error class, never folded into
        // `upstream_errors_total` (that counter is reserved for the forward
        // proxy's timeout/connect/read outcomes), and the client-visible
        // decision must read ALLOW regardless of whatever the rule engine
        // scored this request.
        metrics::counter!("routing_errors_total", "reason" => "no_upstream").increment(1);
        ctx.forwarded_verdict = Verdict::Allow;
        let resp = error_response(&WafError::UpstreamUnavailable);
        return Ok(finish(ctx, resp, None));
    };
    ctx.chosen_upstream = Some(upstream.name.clone());

    let mut req = req;
    if !peer_trusted {
        req.headers_mut().remove("x-forwarded-for");
    }

    match state
        .forward_proxy
        .forward(req, upstream, ctx.client_ip, &host)
        .await
    {
        Ok(resp) => Ok(finish(ctx, resp, None)),
        Err(err) => Ok(finish_err(ctx, err)),
    }
}

/// Synthesizes the 403 JSON body from §4.6 step 7.
fn block_response(ctx: &RequestContext) -> Response<BoxBody> {
    let ids: Vec<String> = ctx
        .rule_hits
        .iter()
        .map(|id| format!("\"{id}\""))
        .collect();
    let body = format!(
        r#"{{"blocked":true,"reason":"waf","score":{},"rule_ids":[{}]}}"#,
        ctx.score,
        ids.join(",")
    );
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("static block response is well-formed")
}

fn rate_limited_response() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .body(empty_body())
        .expect("static rate-limited response is well-formed")
}

fn error_response(err: &WafError) -> Response<BoxBody> {
    Response::builder()
        .status(err.status())
        .body(empty_body())
        .expect("static error response is well-formed")
}

/// Stamps `X-WAF-Decision` / `X-WAF-Score` / `X-Request-ID` and finalizes the
/// context (access log + metrics) exactly once, then returns the response
/// (§4.6 step 9 — every exit path carries these headers).
fn finish(
    mut ctx: RequestContext,
    mut resp: Response<BoxBody>,
    error_type: Option<&str>,
) -> Response<BoxBody> {
    let status = resp.status().as_u16();
    ctx.finalize(status, error_type);
    stamp_decision_headers(&mut resp, &ctx);
    resp
}

fn finish_err(ctx: RequestContext, err: WafError) -> Response<BoxBody> {
    let resp = error_response(&err);
    finish(ctx, resp, err.upstream_error_tag())
}

fn stamp_decision_headers(resp: &mut Response<BoxBody>, ctx: &RequestContext) {
    let headers = resp.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&ctx.forwarded_verdict.label().to_ascii_uppercase()) {
        headers.insert(DECISION_HEADER, v);
    }
    if let Ok(v) = HeaderValue::from_str(&ctx.score.to_string()) {
        headers.insert(SCORE_HEADER, v);
    }
    if let Ok(v) = HeaderValue::from_str(&ctx.request_id.to_string()) {
        headers.insert(REQUEST_ID_HEADER, v);
    }
}
