use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use tokio::sync::broadcast::error::RecvError;

use upnext_engine::configure::load_config;
use upnext_engine::engine::AuctionEngine;
use upnext_engine::logger::setup_logger;
use upnext_engine::music::DeezerCatalog;

#[derive(Parser, Debug)]
#[command(about = "Song-request auction engine")]
struct Args {
    /// Display name of the event
    #[arg(long, default_value = "UPNEXT Live")]
    event_name: String,

    /// Total event duration in hours
    #[arg(long, default_value_t = 2)]
    duration_hours: u32,

    /// Number of bidding slots per hour
    #[arg(long, default_value_t = 12)]
    slots_per_hour: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let config = load_config()?;
    setup_logger(&config)?;

    let catalog = Arc::new(DeezerCatalog::new(
        config.music_api_base.clone(),
        Duration::from_secs(config.music_cache_ttl_secs),
    ));
    let engine = AuctionEngine::new(config, Some(catalog));

    let event = engine.create_event(
        &args.event_name,
        Utc::now(),
        args.duration_hours,
        args.slots_per_hour,
    )?;
    engine.generate_slots(event.id)?;
    engine.spawn_background(event.id);

    log::info!(
        "Engine running: event {} ({}), {} slots/hour for {}h",
        event.id, event.name, args.slots_per_hour, args.duration_hours
    );

    // Log the realtime stream until shutdown; a transport layer would relay
    // these to its sockets instead.
    let (snapshot, mut updates) = engine.subscribe(event.id);
    log::info!(
        "Initial snapshot v{}: {} slots, {} bids",
        snapshot.version,
        snapshot.slots.len(),
        snapshot.bids.len()
    );
    let stream_task = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(msg) => log::info!(
                    "v{}: {}",
                    msg.version,
                    serde_json::to_string(&msg.update).unwrap_or_default()
                ),
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Stream lagged, {} updates dropped; re-snapshot required", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    engine.shutdown();
    stream_task.abort();
    Ok(())
}
