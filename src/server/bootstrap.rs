use crate::{config, server};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: serve → watch for reload → shutdown. Config loading
/// happens in `main` before this is called, so a config-fatal failure can be
/// told apart from a runtime failure at the process exit-code boundary (§6:
/// exit `2` vs exit `1`).
pub async fn run(args: BootstrapArgs, gateway: config::GatewayConfig) -> Result<()> {
    init_tracing();

    let state = server::GatewayState::new(gateway)?;

    let shutdown = Arc::new(Notify::new());
    start_reload_watcher(&state, args.config_path.clone());
    start_admin_server(&state, &args);

    tracing::info!("server: starting gateway, listen={}", args.listen);

    let proxy_handle = tokio::spawn({
        let listen = args.listen.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    if let Err(e) = proxy_handle.await {
        tracing::error!("server: proxy task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Watches for `SIGHUP` and hot-swaps the config snapshot when it arrives.
/// An invalid reload is logged and discarded — the gateway keeps serving
/// traffic on the previous snapshot (§3: config is validated eagerly).
fn start_reload_watcher(state: &server::GatewayState, config_path: std::path::PathBuf) {
    let state = state.clone();

    #[cfg(unix)]
    tokio::spawn(async move {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("server: failed to install SIGHUP handler: {}", e);
                return;
            }
        };

        loop {
            hangup.recv().await;
            tracing::info!("server: SIGHUP received, reloading config");
            match config::GatewayConfig::load(&config_path) {
                Ok(config) => match state.reload(config) {
                    Ok(()) => tracing::info!("server: config reload applied"),
                    Err(e) => tracing::error!("server: config reload rejected: {}", e),
                },
                Err(e) => tracing::error!("server: config reload failed to parse: {}", e),
            }
        }
    });

    #[cfg(not(unix))]
    {
        let _ = (state, config_path);
    }
}

fn start_admin_server(state: &server::GatewayState, args: &BootstrapArgs) {
    let s = state.clone();
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
