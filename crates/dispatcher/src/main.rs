use std::process::ExitCode;

use tracing::{error, info};

use relayq_dispatcher::consumer::DeliveryLogger;
use relayq_dispatcher::promoter::PromoterSettings;
use relayq_dispatcher::service::{DispatcherService, ServiceSettings};
use relayq_infra::config::Config;
use relayq_infra::redis_backend::RedisConnector;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env for local dev; in containers the real environment wins.
    dotenvy::dotenv().ok();

    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    relayq_observability::init(&level);

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "dispatcher exited with error");
            ExitCode::from(1)
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;

    let settings = ServiceSettings::new(
        PromoterSettings::default().with_poll_interval(cfg.poll_interval),
        Default::default(),
    );
    let service = DispatcherService::new(RedisConnector::new(cfg), DeliveryLogger, settings);

    service.start().await?;

    shutdown_signal().await;
    info!("shutdown signal received");
    service.stop().await;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM; both route through the ordered stop path
/// so in-flight acknowledgements are not lost.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
