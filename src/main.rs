#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use waf_gateway::{config, server};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "waf-gateway", about = "Reverse-proxy web application firewall")]
struct Cli {
    /// Path to gateway config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Admin API listen address (health/readiness/metrics)
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,
}

/// Exit codes (§6): `0` clean shutdown, `2` config-fatal, `1` any other
/// runtime failure. Config is loaded here, before the tokio runtime starts,
/// so a compile failure or malformed CIDR never opens a listener.
fn main() -> ExitCode {
    let cli = Cli::parse();

    let gateway = match config::GatewayConfig::load(&cli.config) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("config fatal: {e:#}");
            return ExitCode::from(2);
        }
    };

    let worker_threads = server::runtime::get_container_cpu_limit();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime failure: {e:#}");
            return ExitCode::from(1);
        }
    };

    let result = rt.block_on(server::bootstrap::run(
        server::bootstrap::BootstrapArgs {
            config_path: cli.config,
            listen: cli.listen,
            admin_listen: cli.admin_listen,
        },
        gateway,
    ));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("runtime failure: {e:#}");
            ExitCode::from(1)
        }
    }
}
