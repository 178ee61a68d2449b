use serde::{Deserialize, Deserializer};

use crate::waf::{RuleConfig, Thresholds};

/// Treats an explicit `null` the same as a missing key, so config authors
/// can write `field = null` to fall back to the default without deleting
/// the key entirely.
pub fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

fn default_weight() -> u32 {
    1
}

fn default_max_inspect_bytes() -> usize {
    8192
}

fn default_mode() -> WafMode {
    WafMode::Enforce
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_pool_idle_timeout_secs() -> u64 {
    90
}

fn default_pool_max_idle_per_host() -> usize {
    32
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub path_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WafMode {
    /// Enforced verdicts are applied: BLOCK is rejected at the edge.
    Enforce,
    /// BLOCK is downgraded to SUSPICIOUS for forwarding purposes only; the
    /// true verdict is still logged and metered.
    Monitor,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WafSettings {
    pub mode: WafMode,
    pub max_inspect_bytes: usize,
}

impl Default for WafSettings {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            max_inspect_bytes: default_max_inspect_bytes(),
        }
    }
}

/// Token-bucket capacity, in requests per minute. No `Default` impl on
/// purpose — a missing value must fail config validation rather than
/// silently admit unlimited traffic (§3: capacity `C = requests_per_minute`).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrustedPeers {
    pub cidrs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub pool_idle_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
        }
    }
}

/// The whole WAF configuration snapshot, loaded from one local file and
/// swapped in atomically on reload. Business config lives here directly
/// (unlike the teacher's infra-only local file) because dynamic-config
/// polling is out of scope for this gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub thresholds: Thresholds,
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub trusted_proxies: TrustedPeers,
    #[serde(default)]
    pub ip_allowlist: Vec<String>,
    #[serde(default)]
    pub ip_blocklist: Vec<String>,
    #[serde(default)]
    pub proxy_settings: ProxySettings,
    #[serde(default)]
    pub waf_settings: WafSettings,
}
