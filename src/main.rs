use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dashboard_realtime::config::{LogFormat, Settings};
use dashboard_realtime::transport::WebSocketTransport;
use dashboard_realtime::{ConnectionEvent, RealtimeClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    init_tracing(settings.log.format);
    tracing::info!("Configuration loaded");

    let channels = settings.channels.clone();
    let client = RealtimeClient::init(settings, Arc::new(WebSocketTransport::new()))?;

    // Subscribe before connecting; frames go out on the handshake
    let mut handles = Vec::with_capacity(channels.len());
    for channel in &channels {
        let handle = client.subscribe(channel, |message| {
            tracing::info!(
                channel = %message.channel,
                kind = %message.kind,
                data = %message.data,
                "Message received"
            );
        })?;
        handles.push(handle);
    }
    if channels.is_empty() {
        tracing::warn!("No channels configured, set REALTIME__CHANNELS to tail something");
    }

    // Log lifecycle events in background
    let mut events = client.events();
    let events_handle = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::Degraded { reason } => {
                    tracing::error!(reason = %reason, "Connection degraded");
                }
                other => tracing::debug!(event = ?other, "Connection event"),
            }
        }
    });

    // Connect in background so Ctrl+C works while retrying
    let connector = client.clone();
    tokio::spawn(async move {
        if let Err(e) = connector.connect().await {
            tracing::warn!(error = %e, code = e.code(), "Initial connect did not complete");
        }
    });

    shutdown_signal_handler().await;

    drop(handles);
    let stats = client.stats();
    client.shutdown().await;
    events_handle.abort();

    tracing::info!(stats = %serde_json::to_string(&stats)?, "Client shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
