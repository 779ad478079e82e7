#![forbid(unsafe_code)]

use anyhow::Result;
use partyline::admission::AdmissionController;
use partyline::config::Config;
use partyline::media::{MediaConfig, MediaEvent, MediaWorker};
use partyline::metrics::ServerMetrics;
use partyline::registry::{ChannelRegistry, ClientRegistry};
use partyline::routing::{speaking, RoutingCore};
use partyline::signaling::SignalingServer;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Distinguished exit code for media worker death, so an external supervisor
/// can tell it from an initialization failure.
const EXIT_CODE_WORKER_DIED: i32 = 70;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::from_env()?);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.filter_directive().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Partyline - starting intercom server");

    // Media worker: one worker process, one router, one speaker observer.
    let (media, mut streams) =
        MediaWorker::new(MediaConfig::from_server_config(&config), config.ice_timeout).await?;

    // Registries (the system channel is created here) and the routing core.
    let channels = Arc::new(ChannelRegistry::new());
    let clients = Arc::new(ClientRegistry::new());
    let metrics = ServerMetrics::new();
    let routing = Arc::new(RoutingCore::new(
        Arc::clone(&media),
        Arc::clone(&channels),
        Arc::clone(&clients),
        metrics.clone(),
    ));
    let admission = Arc::new(AdmissionController::new(
        &config,
        Arc::clone(&clients),
        Arc::clone(&channels),
        metrics.clone(),
    ));

    // Speaking fan-out task.
    tokio::spawn(speaking::run(
        Arc::clone(&routing),
        streams.observer_events,
        config.speaking_interval,
        config.speaking_hold_off,
    ));

    // Media event drain: DTLS failures and ICE watchdog expiries cascade here.
    {
        let routing = Arc::clone(&routing);
        let mut media_events = streams.media_events;
        tokio::spawn(async move {
            while let Some(event) = media_events.recv().await {
                match event {
                    MediaEvent::TransportFailed {
                        client_id,
                        transport_id,
                        ..
                    } => {
                        routing.transport_failed(&client_id, &transport_id).await;
                    }
                }
            }
        });
    }

    let signaling = SignalingServer::new(
        Arc::clone(&admission),
        Arc::clone(&routing),
        metrics,
        Arc::clone(&config),
    );
    let port = config.signaling_port;

    tokio::select! {
        result = signaling.serve(port) => {
            if let Err(e) = result {
                error!("Signaling server error: {}", e);
                return Err(e);
            }
        }
        reason = streams.worker_died.recv() => {
            error!(
                "Media worker died ({}), exiting",
                reason.unwrap_or_else(|| "unknown reason".to_string())
            );
            std::process::exit(EXIT_CODE_WORKER_DIED);
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, draining");
            media.shutdown().await;
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install SIGINT handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
