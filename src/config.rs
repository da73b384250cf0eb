use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub discord: DiscordConfig,
    #[serde(default = "default_network_config")]
    pub network: NetworkConfig,
    #[serde(default = "default_relay_config")]
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscordConfig {
    pub bot_token: String,
    /// The shared channel every server relays into
    pub general_channel_id: u64,
    /// Discord user allowed to run `!exec`
    #[serde(default)]
    pub owner_id: Option<u64>,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// Guild whose roles promotions are granted in
    #[serde(default)]
    pub guild_id: Option<u64>,
    /// Rank name to Discord role id, for promotions requested by servers
    #[serde(default)]
    pub ranks: HashMap<String, u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
}

impl RelayConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}

fn default_command_prefix() -> String {
    "!".to_string()
}

fn default_port() -> u16 {
    5005
}

fn default_backlog() -> u32 {
    128
}

fn default_tick_millis() -> u64 {
    50
}

fn default_network_config() -> NetworkConfig {
    NetworkConfig {
        port: default_port(),
        backlog: default_backlog(),
    }
}

fn default_relay_config() -> RelayConfig {
    RelayConfig {
        tick_millis: default_tick_millis(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.discord.bot_token.trim().is_empty() {
            anyhow::bail!("discord.bot_token must not be empty");
        }
        if self.discord.general_channel_id == 0 {
            anyhow::bail!("discord.general_channel_id must be set");
        }
        if self.discord.command_prefix.is_empty() {
            anyhow::bail!("discord.command_prefix must not be empty");
        }
        if !self.discord.ranks.is_empty() && self.discord.guild_id.is_none() {
            anyhow::bail!("discord.guild_id must be set when discord.ranks is configured");
        }
        if let Some((rank, _)) = self.discord.ranks.iter().find(|(_, role)| **role == 0) {
            anyhow::bail!("discord.ranks.{} must be a role id", rank);
        }
        if self.relay.tick_millis == 0 {
            anyhow::bail!("relay.tick_millis must be greater than zero");
        }
        Ok(())
    }
}
