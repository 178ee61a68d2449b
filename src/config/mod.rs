pub mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::router::Upstream;
use crate::waf::{Rule, RuleSet, Thresholds};

impl GatewayConfig {
    /// Loads the whole configuration snapshot from a single TOML or JSON
    /// file, chosen by extension, then validates it eagerly so a bad config
    /// can never become a live snapshot.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: GatewayConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content).context("parsing TOML config")?,
            Some("json") => serde_json::from_str(&content).context("parsing JSON config")?,
            Some(ext) => bail!("unsupported config format: .{ext}, use .toml or .json"),
            None => bail!("config file has no extension, use .toml or .json"),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects a config that would make the snapshot unusable: duplicate
    /// rule ids, uncompilable regex patterns, or malformed CIDR entries.
    /// Everything here maps to `WafError::ConfigFatal` at the call site.
    pub fn validate(&self) -> Result<()> {
        if self.upstreams.is_empty() {
            bail!("config must define at least one upstream");
        }

        let mut seen_ids = std::collections::HashSet::new();
        for rule in &self.rules {
            if !seen_ids.insert(rule.id.clone()) {
                bail!("duplicate rule id: {}", rule.id);
            }
            regex::Regex::new(&rule.pattern)
                .with_context(|| format!("rule {} has an invalid pattern", rule.id))?;
        }

        for cidr in &self.trusted_proxies.cidrs {
            cidr.parse::<ipnetwork::IpNetwork>()
                .with_context(|| format!("invalid trusted-proxy CIDR: {cidr}"))?;
        }

        for ip in self.ip_allowlist.iter().chain(self.ip_blocklist.iter()) {
            ip.parse::<std::net::IpAddr>()
                .with_context(|| format!("invalid IP allow/block-list entry: {ip}"))?;
        }

        if self.rate_limits.requests_per_minute == 0 {
            bail!("rate_limits.requests_per_minute must be greater than zero");
        }

        let t = &self.thresholds;
        if !(t.allow < t.challenge && t.challenge <= t.block) {
            bail!(
                "thresholds must satisfy allow < challenge <= block (got {}, {}, {})",
                t.allow,
                t.challenge,
                t.block
            );
        }

        Ok(())
    }

    #[cfg(test)]
    fn test_base() -> GatewayConfig {
        GatewayConfig {
            upstreams: vec![UpstreamConfig {
                name: "a".into(),
                base_url: "http://127.0.0.1:9".into(),
                weight: 1,
                hosts: vec![],
                path_prefixes: vec![],
            }],
            rules: vec![],
            thresholds: Thresholds::default(),
            rate_limits: RateLimitConfig {
                requests_per_minute: 60,
            },
            trusted_proxies: TrustedPeers::default(),
            ip_allowlist: vec![],
            ip_blocklist: vec![],
            proxy_settings: ProxySettings::default(),
            waf_settings: WafSettings::default(),
        }
    }

    /// Compiles the declarative rule list into a ready-to-evaluate `RuleSet`.
    pub fn compile_rules(&self) -> Result<RuleSet> {
        let mut compiled = Vec::with_capacity(self.rules.len());
        for cfg in &self.rules {
            let rule = Rule::compile(cfg)
                .with_context(|| format!("rule {} has an invalid pattern", cfg.id))?;
            compiled.push(rule);
        }
        Ok(RuleSet::new(
            compiled,
            self.thresholds,
            self.waf_settings.max_inspect_bytes,
        ))
    }

    /// Builds the set of routable upstreams, each with its own selection
    /// counter reset to zero.
    pub fn build_upstreams(&self) -> Vec<Upstream> {
        self.upstreams.iter().map(Upstream::from_config).collect()
    }

    /// Parses the allow/block lists into lookup sets once per config load,
    /// rather than re-parsing an IP string on every request. `validate` has
    /// already confirmed every entry parses.
    pub fn build_ip_lists(
        &self,
    ) -> (
        std::collections::HashSet<std::net::IpAddr>,
        std::collections::HashSet<std::net::IpAddr>,
    ) {
        let parse_all = |list: &[String]| {
            list.iter()
                .filter_map(|s| s.parse::<std::net::IpAddr>().ok())
                .collect()
        };
        (parse_all(&self.ip_allowlist), parse_all(&self.ip_blocklist))
    }
}
