//! Volume Bridge Client
//!
//! Connects to a mixer server, prints its playback devices and then follows
//! the update stream until Ctrl+C or until the server stops answering.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use volume_bridge::{
    config::AppConfig,
    session::{ConnectOutcome, SessionEvent},
    state::{Applied, MixerState},
    Bridge, ServerAddress, VolumeControllerExt,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Volume Bridge");

    let mut config = AppConfig::load().context("Failed to load config")?;
    let stored = AppConfig::default_path().is_some_and(|path| path.exists());
    let bridge = Arc::new(Bridge::websocket(config.clone()));

    let address = match std::env::args().nth(1) {
        Some(arg) => ServerAddress::parse(&arg).with_context(|| format!("Invalid address {}", arg))?,
        None if stored => config.server.address()?,
        None => match bridge.discover().await {
            Some(found) => {
                tracing::info!("Discovered server at {}", found);
                found
            }
            None => {
                tracing::warn!("No server answered discovery, trying the default address");
                config.server.address()?
            }
        },
    };

    // Ctrl+C while retrying cancels the attempt
    let canceller = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                bridge.cancel_start();
            }
        })
    };
    let outcome = bridge.start(&address).await;
    canceller.abort();

    match outcome.with_context(|| format!("Could not connect to {}", address))? {
        ConnectOutcome::Connected { attempts } => {
            tracing::info!("Connected to {} after {} attempt(s)", address, attempts);
        }
        ConnectOutcome::Cancelled => {
            tracing::info!("Connection cancelled");
            return Ok(());
        }
    }

    config.server.set_address(&address);
    if let Err(e) = config.save() {
        tracing::warn!("Failed to save config: {}", e);
    }

    let controller = bridge.controller().clone();
    let mut mixer = MixerState::new();
    let overview = controller.device_overview().await;

    println!("\n=== Playback Devices ===");
    for (device, apps) in &overview {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        let mute_marker = if device.volume.muted { " (muted)" } else { "" };
        println!(
            "  {}{}: {:.0}%{}",
            device.friendly_name,
            default_marker,
            device.volume.current.as_percent(),
            mute_marker
        );
        println!("    ID: {}", device.id);

        for &app_id in apps {
            match controller.get_application(app_id).await {
                Some(app) => {
                    println!(
                        "    - {} [{}]: {:.0}%",
                        app.process.name,
                        app_id,
                        app.volume.current.as_percent()
                    );
                    mixer.insert_application(app);
                }
                None => println!("    - [{}]", app_id),
            }
        }
        mixer.set_device_applications(&device.id, apps.clone());
    }
    println!();
    mixer.set_devices(overview.into_iter().map(|(device, _)| device).collect());

    let mut updates = bridge.subscribe();
    let mut events = bridge.session().events();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            update = updates.recv() => {
                let Some(change) = update else { break };
                tracing::info!("Update for {:?}: {:?}", change.id, change.change);
                if mixer.apply(&change) == Applied::NeedsRefresh {
                    mixer.refresh_stale(controller.as_ref()).await;
                }
            }
            event = events.recv() => {
                if let Ok(SessionEvent::ForcedLogout) = event {
                    tracing::error!("Server stopped answering heartbeats, logged out");
                    break;
                }
            }
        }
    }

    bridge.shutdown().await;
    Ok(())
}
