use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;

use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::proxy::ForwardProxy;
use crate::ratelimit::RateLimiter;
use crate::router::Router;
use crate::waf::RuleSet;

/// Everything derived from one validated `GatewayConfig`: the compiled rule
/// set, the routable upstream pool, the rate limiter, and the parsed IP
/// lists. Rebuilt wholesale on every reload and swapped in atomically — the
/// orchestrator loads one `Snapshot` at the start of a request and uses it
/// for the whole request (§5: "readers acquire the current reference at
/// request start and use it for the whole request").
///
/// A reload resets rate-limiter state along with everything else: a fresh
/// `RateLimiter` ships with each snapshot rather than surviving across
/// reloads, trading a brief burst-allowance reset for not having to carry
/// limiter state through an otherwise wholesale config rebuild.
pub struct Snapshot {
    pub config: Arc<GatewayConfig>,
    pub rules: RuleSet,
    pub router: Router,
    pub rate_limiter: Arc<RateLimiter>,
    pub allowlist: HashSet<IpAddr>,
    pub blocklist: HashSet<IpAddr>,
}

impl Snapshot {
    fn build(config: GatewayConfig) -> Result<Arc<Snapshot>> {
        let rules = config.compile_rules()?;
        let router = Router::new(config.build_upstreams());
        let (allowlist, blocklist) = config.build_ip_lists();
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limits.requests_per_minute));
        rate_limiter.start_reaper();

        Ok(Arc::new(Snapshot {
            config: Arc::new(config),
            rules,
            router,
            rate_limiter,
            allowlist,
            blocklist,
        }))
    }
}

/// Shared gateway state, cheaply cloneable. The config-derived snapshot
/// hot-swaps on reload; `metrics` and `forward_proxy` are process lifetime
/// singletons that don't change with the config.
#[derive(Clone)]
pub struct GatewayState {
    snapshot: Arc<ArcSwap<Snapshot>>,
    pub metrics: Metrics,
    pub forward_proxy: Arc<ForwardProxy>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let forward_proxy = Arc::new(ForwardProxy::new(&config.proxy_settings));
        let snapshot = Snapshot::build(config)?;
        let metrics = Metrics::install();

        Ok(Self {
            snapshot: Arc::new(ArcSwap::new(snapshot)),
            metrics,
            forward_proxy,
        })
    }

    pub fn snapshot(&self) -> arc_swap::Guard<Arc<Snapshot>> {
        self.snapshot.load()
    }

    /// Re-validates `config` and, if it passes, swaps it in as the live
    /// snapshot. An invalid reload leaves the previous snapshot serving
    /// traffic untouched.
    pub fn reload(&self, config: GatewayConfig) -> Result<()> {
        config.validate()?;
        let snapshot = Snapshot::build(config)?;
        self.snapshot.store(snapshot);
        Ok(())
    }
}
