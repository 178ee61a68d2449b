use regex::Regex;
use serde::Deserialize;

use crate::context::RequestContext;

/// Synthetic rule id attached to verdicts produced by the IP allow/block
/// gates rather than by a configured rule.
pub const IP_BLOCKLIST_RULE_ID: &str = "IPBL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Suspicious,
    Block,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Suspicious => "suspicious",
            Verdict::Block => "block",
        }
    }
}

/// What a rule's pattern is matched against. Mirrors the request fields the
/// Normalizer exposes — a rule never reaches past what's already been
/// normalized and budget-truncated.
#[derive(Debug, Clone)]
pub enum Target {
    Path,
    Query,
    Header(String),
    Method,
    UserAgent,
}

#[derive(Debug, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    pub target: TargetConfig,
    pub pattern: String,
    pub score: f64,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetConfig {
    Path,
    Query,
    Header { name: String },
    Method,
    UserAgent,
}

/// A rule with its pattern compiled once at config-load time.
pub struct Rule {
    pub id: String,
    pub target: Target,
    pub pattern: Regex,
    pub score: f64,
    #[allow(dead_code)]
    pub description: String,
}

impl Rule {
    pub fn compile(cfg: &RuleConfig) -> Result<Rule, regex::Error> {
        let target = match &cfg.target {
            TargetConfig::Path => Target::Path,
            TargetConfig::Query => Target::Query,
            TargetConfig::Header { name } => Target::Header(name.to_ascii_lowercase()),
            TargetConfig::Method => Target::Method,
            TargetConfig::UserAgent => Target::UserAgent,
        };
        Ok(Rule {
            id: cfg.id.clone(),
            target,
            pattern: Regex::new(&cfg.pattern)?,
            score: cfg.score,
            description: cfg.description.clone(),
        })
    }

    fn subject<'a>(&self, ctx: &'a RequestContext) -> Option<&'a str> {
        match &self.target {
            // The raw, undecoded path is what path rules see — normalization
            // collapses `../` segments for routing/logging, which would hide
            // exactly the traversal attempts a rule like `\.\./ ` exists to
            // catch (§4.1: "the raw form is what rules see, while the
            // normalized form is used for routing and logging").
            Target::Path => Some(ctx.path_raw.as_str()),
            Target::Query => Some(ctx.query_norm.as_str()),
            Target::Method => Some(ctx.method.as_str()),
            Target::Header(name) => ctx.headers_subset.get(name).map(|s| s.as_str()),
            Target::UserAgent => ctx.headers_subset.get("user-agent").map(|s| s.as_str()),
        }
    }

    /// Truncates the projected target to `max_inspect_bytes` before testing
    /// the pattern — the inspection budget bounds regex cost, it never
    /// bounds what the forward proxy later sends upstream (`ctx.path_raw`
    /// itself is untouched).
    fn matches(&self, ctx: &RequestContext, max_inspect_bytes: usize) -> bool {
        match self.subject(ctx) {
            Some(subject) => {
                let truncated =
                    crate::normalize::truncate_for_inspection(subject, max_inspect_bytes);
                self.pattern.is_match(&truncated)
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Thresholds {
    pub allow: f64,
    pub challenge: f64,
    pub block: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            allow: 0.0,
            challenge: 5.0,
            block: 10.0,
        }
    }
}

impl Thresholds {
    /// Maps an accumulated score onto a verdict: `score >= block` wins over
    /// `score >= challenge`, which wins over allow.
    pub fn classify(&self, score: f64) -> Verdict {
        if score >= self.block {
            Verdict::Block
        } else if score >= self.challenge {
            Verdict::Suspicious
        } else {
            Verdict::Allow
        }
    }
}

/// The compiled rule set evaluated once per request. Rebuilt wholesale on
/// every config reload and swapped in behind an `ArcSwap` — never mutated
/// in place.
pub struct RuleSet {
    rules: Vec<Rule>,
    thresholds: Thresholds,
    max_inspect_bytes: usize,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>, thresholds: Thresholds, max_inspect_bytes: usize) -> Self {
        Self {
            rules,
            thresholds,
            max_inspect_bytes,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Evaluates every rule against the context, accumulating score
    /// additively, and returns `(score, verdict, rule_ids_hit)`. A rule is
    /// evaluated in load order and contributes at most once, even though a
    /// single target string could in principle match its own pattern more
    /// than once.
    pub fn evaluate(&self, ctx: &RequestContext) -> (f64, Verdict, Vec<String>) {
        let mut score = 0.0;
        let mut hits = Vec::new();
        for rule in &self.rules {
            if rule.matches(ctx, self.max_inspect_bytes) {
                score += rule.score;
                hits.push(rule.id.clone());
            }
        }
        let verdict = self.thresholds.classify(score);
        (score, verdict, hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn ctx_with_path(path: &str) -> RequestContext {
        let mut ctx = RequestContext::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1234),
            "GET".into(),
            path.into(),
        );
        ctx.path_norm = path.into();
        ctx
    }

    fn rule(id: &str, target: Target, pattern: &str, score: f64) -> Rule {
        Rule {
            id: id.into(),
            target,
            pattern: Regex::new(pattern).unwrap(),
            score,
            description: String::new(),
        }
    }

    #[test]
    fn additive_scoring_crosses_block_threshold() {
        let rules = vec![
            rule("r1", Target::Path, "union", 6.0),
            rule("r2", Target::Path, "select", 6.0),
        ];
        let rs = RuleSet::new(rules, Thresholds::default(), 10_000);
        let ctx = ctx_with_path("/x?id=1 union select 1");
        let (score, verdict, hits) = rs.evaluate(&ctx);
        assert_eq!(score, 12.0);
        assert_eq!(verdict, Verdict::Block);
        assert_eq!(hits, vec!["r1", "r2"]);
    }

    #[test]
    fn single_mid_rule_is_suspicious_not_block() {
        let rules = vec![rule("r1", Target::Path, "admin", 6.0)];
        let rs = RuleSet::new(rules, Thresholds::default(), 10_000);
        let ctx = ctx_with_path("/admin/login");
        let (score, verdict, _) = rs.evaluate(&ctx);
        assert_eq!(score, 6.0);
        assert_eq!(verdict, Verdict::Suspicious);
    }

    #[test]
    fn no_match_allows() {
        let rules = vec![rule("r1", Target::Path, "admin", 6.0)];
        let rs = RuleSet::new(rules, Thresholds::default(), 10_000);
        let ctx = ctx_with_path("/home");
        let (score, verdict, hits) = rs.evaluate(&ctx);
        assert_eq!(score, 0.0);
        assert_eq!(verdict, Verdict::Allow);
        assert!(hits.is_empty());
    }

    #[test]
    fn header_target_is_case_insensitive_by_name_not_value() {
        let rules = vec![rule(
            "r1",
            Target::Header("x-custom".into()),
            "bad-value",
            10.0,
        )];
        let rs = RuleSet::new(rules, Thresholds::default(), 10_000);
        let mut ctx = ctx_with_path("/");
        ctx.headers_subset
            .insert("x-custom".into(), "bad-value".into());
        let (_, verdict, _) = rs.evaluate(&ctx);
        assert_eq!(verdict, Verdict::Block);
    }

    #[test]
    fn missing_header_does_not_match() {
        let rules = vec![rule("r1", Target::Header("x-custom".into()), ".*", 10.0)];
        let rs = RuleSet::new(rules, Thresholds::default(), 10_000);
        let ctx = ctx_with_path("/");
        let (score, _, _) = rs.evaluate(&ctx);
        assert_eq!(score, 0.0);
    }

    /// Scenario 1 (§8): the rule engine must see the raw, undecoded path so
    /// a traversal pattern still matches even though the normalized path
    /// (used for routing/logs) has already collapsed the `../` segment.
    #[test]
    fn path_rule_matches_raw_form_not_normalized_form() {
        let rules = vec![rule("PT001", Target::Path, r"\.\./", 10.0)];
        let thresholds = Thresholds {
            allow: 5.0,
            challenge: 6.0,
            block: 10.0,
        };
        let rs = RuleSet::new(rules, thresholds, 10_000);
        let mut ctx = ctx_with_path("/../etc/passwd");
        ctx.path_norm = "/etc/passwd".into();
        let (score, verdict, hits) = rs.evaluate(&ctx);
        assert_eq!(score, 10.0);
        assert_eq!(verdict, Verdict::Block);
        assert_eq!(hits, vec!["PT001"]);
    }

    #[test]
    fn truncation_applies_only_to_the_rule_copy() {
        let rules = vec![rule("r1", Target::Path, "needle", 10.0)];
        let rs = RuleSet::new(rules, Thresholds::default(), 4);
        let ctx = ctx_with_path("/needle-but-past-the-budget");
        let (score, _, _) = rs.evaluate(&ctx);
        assert_eq!(score, 0.0, "pattern lies past the 4-byte inspection budget");
    }
}
