use std::path::PathBuf;

use chrono::Utc;
use clap::Parser;
use log::{info, warn};
use tokio::sync::broadcast;

mod config;
mod manager;
mod messages;
mod mqtt;
mod notifier;
mod presence;
mod prober;
mod snapshot;

use notifier::{MqttChannel, Notifier, NotifyFilter};
use presence::{PresenceSettings, PresenceTracker};
use snapshot::SnapshotStore;

/// Track who is home by pinging their devices.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Run a single poll cycle and exit
    #[arg(long)]
    once: bool,
}

fn init_logging() {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(log::LevelFilter::Info);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let config = config::AppConfig::load(&cli.config)?;
    let settings = config.poll_settings()?;

    info!("Tracking: {:?}", config.people.keys().collect::<Vec<_>>());

    let mut tracker = PresenceTracker::new(
        config.people.keys().cloned(),
        PresenceSettings {
            debounce: settings.debounce,
            staleness: settings.staleness,
        },
    );

    let store = config.presence.state_file.clone().map(SnapshotStore::new);
    if let Some(store) = &store {
        match store.load() {
            Ok(Some(snapshot)) => {
                info!("Restored presence from {}", store.path().display());
                tracker.restore(snapshot);
            }
            Ok(None) => {}
            Err(err) => warn!("Could not load snapshot: {}", err),
        }
    }

    let api_key = config
        .pushbullet
        .as_ref()
        .and_then(config::PushbulletConfig::resolve_api_key);
    let mut notifier = Notifier::new().with_pushbullet(
        api_key,
        NotifyFilter {
            arrivals: config.notify.arrivals,
            departures: config.notify.departures,
        },
    );

    let mut mqtt_client = None;
    let mut scan_requests = None;
    if let Some(mqtt_config) = &config.mqtt {
        let (client, mut eventloop) = mqtt::MqttClient::new(mqtt_config);
        let (tx, rx) = broadcast::channel(10);

        let loop_client = client.clone();
        tokio::task::spawn(async move {
            loop_client.event_loop(&mut eventloop, tx).await;
        });

        notifier = notifier.with_channel(
            MqttChannel::new(client.clone(), config.people.clone()),
            NotifyFilter::ALL,
        );
        mqtt_client = Some(client);
        scan_requests = Some(rx);
    }

    if !notifier.is_enabled() {
        info!("No notification channels configured");
    }

    let mut core = manager::Manager::new(
        config.people.clone(),
        prober::PingProber,
        tracker,
        notifier,
        manager::LoopSettings {
            poll_interval: settings.poll_interval,
            probe_timeout: settings.probe_timeout,
            concurrent_probes: settings.concurrent_probes,
        },
    );
    if let Some(store) = store {
        core = core.with_snapshot_store(store);
    }

    let snapshot = if cli.once {
        let now = Utc::now();
        core.poll_cycle(now).await?;
        core.tracker().snapshot(now)
    } else {
        core.run_loop(shutdown_signal(), scan_requests).await?
    };

    info!("Last known presence:");
    snapshot.log_summary();

    if let Some(client) = mqtt_client {
        if let Err(err) = client.disconnect().await {
            warn!("Error disconnecting from MQTT: {}", err);
        }
    }

    Ok(())
}
