mod commands;
mod config;
mod dispatcher;
mod event_loop;
mod handlers;
mod platform;
mod protocol;
mod registry;
mod relay;
mod transport;

#[cfg(test)]
mod testing;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::event_loop::{EventLoop, RelaySettings};
use crate::platform::{discord, InboundEventQueue};
use crate::transport::TcpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,polyrelay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  General channel: {}", config.discord.general_channel_id);
    info!("  Command prefix: {}", config.discord.command_prefix);
    info!("  Promotion ranks: {}", config.discord.ranks.len());
    info!("  TCP port: {} (backlog {})", config.network.port, config.network.backlog);
    info!("  Tick: {}ms", config.relay.tick_millis);

    // Discord first: a bad token should stop us before we accept servers
    let (events, queue) = InboundEventQueue::new();
    let (mut client, chat) = discord::connect(&config.discord, events).await?;

    let transport = TcpTransport::bind(config.network.port, config.network.backlog).await?;
    info!("Accepting game servers on {}", transport.local_addr());

    let event_loop = EventLoop::new(
        transport,
        handlers::default_dispatcher(&config.discord.ranks),
        queue,
        Box::new(chat),
        RelaySettings::from_config(&config),
    );
    event_loop.spawn()?;

    info!("Relay is starting...");
    tokio::select! {
        result = client.start() => {
            result.context("Discord gateway connection failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
