use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::UpstreamConfig;

/// A routable HTTP origin. Carries its own selection counter so weighted
/// round robin needs no shared lock across upstreams — each has an
/// independent `AtomicU64`, matching the teacher's per-instance counter
/// idiom for load-balancer state.
pub struct Upstream {
    pub name: String,
    pub base_url: String,
    pub weight: u32,
    /// Lower-cased; empty means "no host constraint" (matches any `Host`).
    hosts: Vec<String>,
    /// Longest-prefix-wins path match; empty means "matches any path" but
    /// always loses a tie to an upstream with a real prefix match.
    path_prefixes: Vec<String>,
    counter: AtomicU64,
}

impl Upstream {
    pub fn from_config(cfg: &UpstreamConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            base_url: cfg.base_url.clone(),
            weight: cfg.weight.max(1),
            hosts: cfg.hosts.iter().map(|h| h.to_ascii_lowercase()).collect(),
            path_prefixes: cfg.path_prefixes.clone(),
            counter: AtomicU64::new(0),
        }
    }

    fn host_matches(&self, host: &str) -> bool {
        self.hosts.is_empty() || self.hosts.iter().any(|h| h == host)
    }

    /// `Some(len)` of the longest configured prefix matching `path`, `Some(0)`
    /// when no prefixes are configured at all (unconstrained path-wise), or
    /// `None` when prefixes are configured but none of them match.
    fn longest_prefix_match(&self, path: &str) -> Option<usize> {
        if self.path_prefixes.is_empty() {
            return Some(0);
        }
        self.path_prefixes
            .iter()
            .filter(|p| path.starts_with(p.as_str()))
            .map(|p| p.len())
            .max()
    }
}

/// Host/path routing plus weighted round-robin upstream selection (§4.4).
/// Rebuilt wholesale on config reload and swapped in behind an `ArcSwap`
/// alongside the rule set — never mutated in place.
pub struct Router {
    upstreams: Vec<Upstream>,
}

impl Router {
    pub fn new(upstreams: Vec<Upstream>) -> Self {
        Self { upstreams }
    }

    /// Resolves `(host, path)` to one upstream, or `None` when the pool is
    /// empty — the orchestrator maps that to a 502 (§4.4 empty-pool
    /// semantics), not a WAF block.
    pub fn route(&self, host: &str, path: &str) -> Option<&Upstream> {
        let host_lower = host.to_ascii_lowercase();

        let mut candidates: Vec<(usize, &Upstream)> = Vec::new();
        for upstream in &self.upstreams {
            if !upstream.host_matches(&host_lower) {
                continue;
            }
            if let Some(prefix_len) = upstream.longest_prefix_match(path) {
                candidates.push((prefix_len, upstream));
            }
        }
        if candidates.is_empty() {
            return None;
        }

        let best_len = candidates.iter().map(|(len, _)| *len).max().unwrap();
        let winners: Vec<&Upstream> = candidates
            .into_iter()
            .filter(|(len, _)| *len == best_len)
            .map(|(_, u)| u)
            .collect();

        self.pick_weighted(&winners)
    }

    /// Largest `weight / (counter + 1)` wins; ties broken by configuration
    /// order (the order `winners` was built in, which mirrors `self.upstreams`).
    fn pick_weighted<'a>(&self, winners: &[&'a Upstream]) -> Option<&'a Upstream> {
        let mut best: Option<(&Upstream, f64)> = None;
        for upstream in winners {
            let counter = upstream.counter.load(Ordering::Relaxed);
            let ratio = upstream.weight as f64 / (counter + 1) as f64;
            match best {
                Some((_, best_ratio)) if ratio <= best_ratio => {}
                _ => best = Some((upstream, ratio)),
            }
        }
        let chosen = best?.0;
        chosen.counter.fetch_add(1, Ordering::Relaxed);
        Some(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(name: &str, weight: u32, hosts: &[&str], prefixes: &[&str]) -> Upstream {
        Upstream {
            name: name.into(),
            base_url: format!("http://{name}"),
            weight,
            hosts: hosts.iter().map(|s| s.to_string()).collect(),
            path_prefixes: prefixes.iter().map(|s| s.to_string()).collect(),
            counter: AtomicU64::new(0),
        }
    }

    #[test]
    fn unconstrained_upstream_matches_any_host_and_path() {
        let router = Router::new(vec![upstream("a", 1, &[], &[])]);
        let picked = router.route("anything.example", "/x/y").unwrap();
        assert_eq!(picked.name, "a");
    }

    #[test]
    fn host_constraint_excludes_non_matching_host() {
        let router = Router::new(vec![upstream("a", 1, &["api.example"], &[])]);
        assert!(router.route("other.example", "/x").is_none());
        assert!(router.route("API.EXAMPLE", "/x").is_some());
    }

    #[test]
    fn longest_prefix_wins_over_shorter_prefix_and_unconstrained() {
        let router = Router::new(vec![
            upstream("catchall", 1, &[], &[]),
            upstream("api", 1, &[], &["/api"]),
            upstream("api-v2", 1, &[], &["/api/v2"]),
        ]);
        let picked = router.route("h", "/api/v2/widgets").unwrap();
        assert_eq!(picked.name, "api-v2");
    }

    #[test]
    fn configured_prefix_that_does_not_match_excludes_upstream() {
        let router = Router::new(vec![upstream("a", 1, &[], &["/admin"])]);
        assert!(router.route("h", "/public").is_none());
    }

    #[test]
    fn empty_pool_returns_none() {
        let router = Router::new(vec![]);
        assert!(router.route("h", "/").is_none());
    }

    #[test]
    fn weighted_round_robin_favors_higher_weight_over_many_picks() {
        let router = Router::new(vec![upstream("heavy", 3, &[], &[]), upstream("light", 1, &[], &[])]);
        let mut heavy_count = 0;
        let mut light_count = 0;
        for _ in 0..8 {
            match router.route("h", "/").unwrap().name.as_str() {
                "heavy" => heavy_count += 1,
                "light" => light_count += 1,
                _ => unreachable!(),
            }
        }
        assert!(heavy_count > light_count);
    }

    #[test]
    fn ties_break_by_configuration_order() {
        let router = Router::new(vec![upstream("first", 1, &[], &[]), upstream("second", 1, &[], &[])]);
        // Equal weight, equal (zero) counters on the first pick: config order wins.
        let picked = router.route("h", "/").unwrap();
        assert_eq!(picked.name, "first");
    }
}
