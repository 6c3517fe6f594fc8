use crate::config::Config;
use crate::dns::Traffic;
use crate::metrics::Metrics;
use crate::server::{self, DirectorState};
use crate::xds::XdsClient;
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Director lifecycle: init → discover → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: configuration and metrics. Any config error is fatal here;
    // everything past this point is contained and retried.
    let config = Config::load(&args.config_path)?;
    let metrics = Metrics::install();

    // Phase 2: build the discovery client and the DNS handler over it.
    let client = XdsClient::new(&config.traffic).map_err(|e| anyhow::anyhow!("{}", e))?;
    let handler = Arc::new(Traffic::new(client.clone(), &config.traffic)?);

    if config.traffic.origins.is_empty() {
        tracing::warn!("traffic: no origins configured, all queries will be refused");
    }
    if !config.traffic.localities.is_empty() {
        tracing::info!(
            "traffic: {} locality preferences parsed, carried as metadata only",
            config.localities().len()
        );
    }

    // Phase 3: the discovery stream. The client owns its reconnect loop;
    // DNS serving continues from the retained snapshot while it is down.
    let ads_handle = tokio::spawn(client.clone().run());

    // Phase 4: admin + DNS servers.
    let shutdown = CancellationToken::new();
    start_admin_server(
        &args,
        DirectorState {
            metrics,
            client: client.clone(),
        },
    );

    tracing::info!("server: starting traffic director, listen={}", args.listen);
    let dns_handle = tokio::spawn({
        let listen = args.listen.clone();
        let shutdown = shutdown.clone();
        async move { server::run_dns_server(&listen, handler, shutdown).await }
    });

    // Phase 5: block until signal, then clean up.
    wait_for_shutdown().await;

    shutdown.cancel();
    client.stop();

    if let Err(e) = dns_handle.await.map_err(anyhow::Error::from).and_then(|r| r) {
        tracing::error!("server: dns task error: {}", e);
    }
    if let Err(e) = ads_handle.await {
        tracing::error!("ads: client task error: {}", e);
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

fn start_admin_server(args: &BootstrapArgs, state: DirectorState) {
    let admin_addr = args.admin_listen.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, state).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown() {
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
}
