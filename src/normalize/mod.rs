use std::net::{IpAddr, SocketAddr};

use http::{HeaderMap, Uri};
use ipnetwork::IpNetwork;

use crate::config::TrustedPeers;

/// Fixed set of headers the rule engine and access log ever look at. Any
/// header outside this set never reaches a rule or a log line.
const SUBSET_HEADERS: &[&str] = &["host", "user-agent", "referer", "cookie", "content-type"];

impl TrustedPeers {
    pub(crate) fn trusts(&self, addr: IpAddr) -> bool {
        self.cidrs.iter().any(|cidr| {
            cidr.parse::<IpNetwork>()
                .map(|net| net.contains(addr))
                .unwrap_or(false)
        })
    }
}

/// Resolves the client IP per the trust model: the left-most entry of
/// `X-Forwarded-For` is used only when the immediate TCP peer is a trusted
/// proxy; otherwise the TCP peer address is authoritative.
pub fn resolve_client_ip(peer: SocketAddr, headers: &HeaderMap, trusted: &TrustedPeers) -> IpAddr {
    if !trusted.trusts(peer.ip()) {
        return peer.ip();
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .and_then(|s| s.parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer.ip())
}

/// Percent-decodes and collapses `.`/`..` segments without ever escaping
/// above the root — `/a/../../b` normalizes to `/b`, not an error.
pub fn normalize_path(raw_path: &str) -> String {
    let decoded = percent_decode(raw_path, false);
    let mut segments: Vec<&str> = Vec::new();
    for seg in decoded.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    let mut out = String::from("/");
    out.push_str(&segments.join("/"));
    out
}

/// Decodes and re-renders the query string in its original key order, with
/// every key and value percent-decoded.
pub fn normalize_query(uri: &Uri) -> String {
    let Some(query) = uri.query() else {
        return String::new();
    };
    let mut pairs = Vec::new();
    for kv in query.split('&') {
        if kv.is_empty() {
            continue;
        }
        let mut it = kv.splitn(2, '=');
        let k = percent_decode(it.next().unwrap_or(""), true);
        let v = it
            .next()
            .map(|v| percent_decode(v, true))
            .unwrap_or_default();
        pairs.push(format!("{k}={v}"));
    }
    pairs.join("&")
}

/// Extracts the fixed, lower-cased header subset the rule engine and access
/// log are allowed to see.
pub fn header_subset(headers: &HeaderMap) -> std::collections::BTreeMap<String, String> {
    let mut out = std::collections::BTreeMap::new();
    for name in SUBSET_HEADERS {
        if let Some(v) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            out.insert((*name).to_string(), v.to_string());
        }
    }
    out
}

/// Truncates a rule-engine-bound string to the configured inspection
/// budget. Truncation happens before evaluation, never after — a rule
/// never sees bytes beyond the budget.
pub fn truncate_for_inspection(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Percent-decodes `s`. `plus_as_space` applies the form-encoding convention
/// (`+` decodes to a literal space) — that convention belongs to query
/// strings, not generic URI paths, so `normalize_path` passes `false` and
/// leaves a literal `+` in a path segment untouched.
fn percent_decode(s: &str, plus_as_space: bool) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use std::net::Ipv4Addr;

    fn peer(ip: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)
    }

    #[test]
    fn untrusted_peer_ignores_xff() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("9.9.9.9"));
        let trusted = TrustedPeers { cidrs: vec![] };
        let ip = resolve_client_ip(peer([1, 2, 3, 4], 1), &headers, &trusted);
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn trusted_peer_uses_leftmost_xff_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.5, 10.0.0.1"),
        );
        let trusted = TrustedPeers {
            cidrs: vec!["10.0.0.0/8".into()],
        };
        let ip = resolve_client_ip(peer([10, 0, 0, 1], 1), &headers, &trusted);
        assert_eq!(ip, "203.0.113.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn path_traversal_never_escapes_root() {
        assert_eq!(normalize_path("/a/../../b"), "/b");
        assert_eq!(normalize_path("/../../../etc/passwd"), "/etc/passwd");
    }

    #[test]
    fn path_collapses_dot_segments() {
        assert_eq!(normalize_path("/a/./b/"), "/a/b");
    }

    #[test]
    fn path_percent_decodes() {
        assert_eq!(normalize_path("/a%2Fb"), "/a/b");
    }

    #[test]
    fn path_does_not_treat_plus_as_space() {
        assert_eq!(normalize_path("/a+b"), "/a+b");
    }

    #[test]
    fn query_preserves_order_and_decodes() {
        let uri: Uri = "/x?b=2&a=1%20x".parse().unwrap();
        assert_eq!(normalize_query(&uri), "b=2&a=1 x");
    }

    #[test]
    fn inspection_truncation_respects_char_boundaries() {
        let s = "héllo";
        let truncated = truncate_for_inspection(s, 2);
        assert!(truncated.len() <= 2);
    }
}
