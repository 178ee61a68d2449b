use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use uuid::Uuid;

use crate::waf::Verdict;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request state threaded through the orchestrator's fixed pipeline.
/// One instance per inbound request; `finalize` is the single exit point
/// that emits the access log line and records metrics exactly once.
pub struct RequestContext {
    pub request_id: Uuid,
    pub client_ip: IpAddr,
    pub peer_addr: SocketAddr,
    pub method: String,
    pub path_raw: String,
    pub path_norm: String,
    pub query_norm: String,
    pub headers_subset: BTreeMap<String, String>,
    pub start: Instant,
    pub verdict: Verdict,
    /// What `X-WAF-Decision` carries on the downstream response. Equal to
    /// `verdict` except where the rule engine's true BLOCK is downgraded to
    /// SUSPICIOUS in monitor mode, or a routing failure forces ALLOW — in
    /// both cases `verdict` keeps the true value for the access log and the
    /// `requests_total` metric (§4.2, §4.4).
    pub forwarded_verdict: Verdict,
    pub score: f64,
    pub rule_hits: Vec<String>,
    pub chosen_upstream: Option<String>,
    pub status: u16,
}

impl RequestContext {
    pub fn new(peer_addr: SocketAddr, method: String, path_raw: String) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client_ip: peer_addr.ip(),
            peer_addr,
            method,
            path_raw,
            path_norm: String::new(),
            query_norm: String::new(),
            headers_subset: BTreeMap::new(),
            start: Instant::now(),
            verdict: Verdict::Allow,
            forwarded_verdict: Verdict::Allow,
            score: 0.0,
            rule_hits: Vec::new(),
            chosen_upstream: None,
            status: 0,
        }
    }

    pub fn latency_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Truncates the log's rule-id list to the first 16 hits, matching the
    /// access-log field budget.
    pub fn logged_rule_hits(&self) -> &[String] {
        let cap = self.rule_hits.len().min(16);
        &self.rule_hits[..cap]
    }

    /// Emits the one JSON access-log line for this request and records the
    /// contractual metrics. Called exactly once, at the end of the pipeline,
    /// regardless of which phase produced the final status.
    pub fn finalize(&mut self, status: u16, error_type: Option<&str>) {
        self.status = status;

        let mut status_buf = itoa::Buffer::new();
        let status_str = status_buf.format(status);

        metrics::counter!(
            "requests_total",
            "verdict" => self.verdict.label(),
            "status" => status_str.to_owned(),
        )
        .increment(1);

        for rule_id in self.logged_rule_hits() {
            metrics::counter!("waf_rule_hits_total", "rule_id" => rule_id.clone()).increment(1);
        }

        if let Some(error_type) = error_type {
            metrics::counter!("upstream_errors_total", "error_type" => error_type.to_owned())
                .increment(1);
        }

        metrics::histogram!("upstream_latency_seconds").record(self.start.elapsed().as_secs_f64());

        tracing::info!(
            request_id = %self.request_id,
            client_ip = %self.client_ip,
            method = %self.method,
            path = %self.path_norm,
            verdict = self.verdict.label(),
            score = self.score,
            rule_ids = ?self.logged_rule_hits(),
            upstream = self.chosen_upstream.as_deref().unwrap_or(""),
            status = status,
            latency_ms = self.latency_ms(),
            "request handled"
        );
    }
}
