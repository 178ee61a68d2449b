use std::fmt;

use http::StatusCode;

/// The nine terminal outcomes a request can resolve to before a response is
/// written. Each variant carries exactly what the access log and the metrics
/// layer need to classify it; nothing more.
#[derive(Debug)]
pub enum WafError {
    ConfigFatal(String),
    RequestMalformed(String),
    VerdictBlock { rule_id: String, score: f64 },
    RateLimited,
    UpstreamUnavailable,
    UpstreamTimeout,
    UpstreamConnect(String),
    UpstreamRead(String),
    ClientAbort,
}

impl WafError {
    /// Status code stamped on the response written to the client. `ClientAbort`
    /// has no response — the connection is already gone — so callers must not
    /// call this for that variant.
    pub fn status(&self) -> StatusCode {
        match self {
            WafError::ConfigFatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WafError::RequestMalformed(_) => StatusCode::BAD_REQUEST,
            WafError::VerdictBlock { .. } => StatusCode::FORBIDDEN,
            WafError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            WafError::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            WafError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            WafError::UpstreamConnect(_) => StatusCode::BAD_GATEWAY,
            WafError::UpstreamRead(_) => StatusCode::BAD_GATEWAY,
            WafError::ClientAbort => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Label used for the access log's `error` field. Stable across variant
    /// payload changes.
    pub fn label(&self) -> &'static str {
        match self {
            WafError::ConfigFatal(_) => "config_fatal",
            WafError::RequestMalformed(_) => "request_malformed",
            WafError::VerdictBlock { .. } => "verdict_block",
            WafError::RateLimited => "rate_limited",
            WafError::UpstreamUnavailable => "upstream_unavailable",
            WafError::UpstreamTimeout => "timeout",
            WafError::UpstreamConnect(_) => "connect",
            WafError::UpstreamRead(_) => "read",
            WafError::ClientAbort => "client_abort",
        }
    }

    /// `Some(tag)` for the three outcomes the contractual `upstream_errors_total{error_type}`
    /// counter is scoped to (§6: `{timeout, connect, read}`); `None` for
    /// every other variant, which must never be folded into that counter.
    pub fn upstream_error_tag(&self) -> Option<&'static str> {
        match self {
            WafError::UpstreamTimeout => Some("timeout"),
            WafError::UpstreamConnect(_) => Some("connect"),
            WafError::UpstreamRead(_) => Some("read"),
            _ => None,
        }
    }
}

impl fmt::Display for WafError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WafError::ConfigFatal(msg) => write!(f, "config fatal: {msg}"),
            WafError::RequestMalformed(msg) => write!(f, "request malformed: {msg}"),
            WafError::VerdictBlock { rule_id, score } => {
                write!(f, "blocked by rule {rule_id} (score {score})")
            }
            WafError::RateLimited => write!(f, "rate limited"),
            WafError::UpstreamUnavailable => write!(f, "no upstream available"),
            WafError::UpstreamTimeout => write!(f, "upstream timeout"),
            WafError::UpstreamConnect(msg) => write!(f, "upstream connect error: {msg}"),
            WafError::UpstreamRead(msg) => write!(f, "upstream read error: {msg}"),
            WafError::ClientAbort => write!(f, "client aborted"),
        }
    }
}

impl std::error::Error for WafError {}
