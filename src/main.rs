//! IPTV channel relay
//!
//! Run with: tv-relay [CONFIG_PATH]
//!
//! The configuration path falls back to `TV_RELAY_CONFIG`; without either the
//! relay starts with an empty lineup on 0.0.0.0:8080.
//!
//! ## Watching a channel
//!
//! With VLC:
//!   vlc http://localhost:8080/v/1.ts
//!
//! With ffplay:
//!   ffplay http://localhost:8080/v/1
//!
//! ## Admin
//!
//!   curl -X POST http://localhost:8080/api/channels/1/next
//!   curl -X POST http://localhost:8080/api/channels/1/streams/<stream_id>
//!   curl http://localhost:8080/api/stats

use tv_relay::config::RelayConfig;
use tv_relay::context::RelayContext;

/// Environment variable naming the configuration file
const CONFIG_ENV: &str = "TV_RELAY_CONFIG";

fn print_usage() {
    eprintln!("Usage: tv-relay [CONFIG_PATH]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  CONFIG_PATH  JSON configuration file (default: ${CONFIG_ENV})");
    eprintln!();
    eprintln!("Logging is controlled with RUST_LOG (default: tv_relay=info)");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tv_relay=info")),
        )
        .init();

    let config = match args.get(1).cloned().or_else(|| std::env::var(CONFIG_ENV).ok()) {
        Some(path) => RelayConfig::load(&path)?,
        None => {
            tracing::warn!("No configuration given, starting with defaults");
            RelayConfig::default()
        }
    };

    let context = RelayContext::initialize(config)?;
    let server = context.server()?;

    // Log channel events as they happen
    let mut events = context.notifier().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::debug!(?event, "Channel event");
        }
    });

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
