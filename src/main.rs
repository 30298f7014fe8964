mod config;

use clap::Parser as _;
use config::Config;
use smart_router::{
    AppState, build_metrics_layer_and_handle, build_metrics_router, build_router,
    settings::{RouterSettings, WatchedFile},
};
use tokio::net::TcpListener;
use tracing::{error, info, instrument};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    info!("Starting smart router with config: {:?}", config);

    let settings = RouterSettings::from_file(&config.config)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load settings from config: {}", e))?;

    let app_state = AppState::new(
        settings,
        config.pool_idle_timeout_secs,
        config.pool_max_idle_per_host,
    )
    .with_config_path(&config.config);

    // The first refresh may fail while the backend comes up; requests retry it.
    if let Err(e) = app_state.inventory.refresh().await {
        error!("Initial model discovery failed: {}", e);
    }

    // Start file watcher if a config file was specified
    if config.watch {
        app_state
            .settings
            .receive_updates(WatchedFile(config.config.clone()), app_state.inventory.clone())
            .await?;
    }

    let mut router = build_router(app_state);

    if config.metrics {
        let (prometheus_layer, handle) = build_metrics_layer_and_handle(config.metrics_prefix);
        router = router.layer(prometheus_layer);

        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr).await?;
        info!("Metrics listening on {}", metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, build_metrics_router(handle)).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Smart router listening on {}", bind_addr);

    axum::serve(listener, router).await?;

    Ok(())
}
