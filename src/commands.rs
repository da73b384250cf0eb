use anyhow::Result;
use tracing::{debug, info};

use crate::platform::{ChatSink, PostedMessage};
use crate::protocol::{encode, GenericCommand};
use crate::registry::OnlineServerRegistry;
use crate::transport::Transport;

/// Handles prefixed Discord commands on the tick thread.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    prefix: String,
    owner_id: Option<u64>,
}

impl CommandProcessor {
    pub fn new(prefix: impl Into<String>, owner_id: Option<u64>) -> Self {
        Self {
            prefix: prefix.into(),
            owner_id,
        }
    }

    pub fn handle(
        &self,
        message: &PostedMessage,
        registry: &OnlineServerRegistry,
        chat: &dyn ChatSink,
        transport: &mut dyn Transport,
    ) -> Result<()> {
        let body = match message.content.strip_prefix(&self.prefix) {
            Some(body) => body,
            None => return Ok(()),
        };
        let mut words = body.split_whitespace();
        let name = match words.next() {
            Some(name) => name.to_lowercase(),
            None => return Ok(()),
        };
        let args: Vec<&str> = words.collect();

        info!(
            "Command '{}' from {} ({})",
            name, message.author_name, message.author_id
        );

        match name.as_str() {
            "online" => chat.post(message.channel_id, &online_summary(registry)),
            "tps" => {
                let Some(&server_id) = args.first() else {
                    return chat.post(
                        message.channel_id,
                        &format!("Usage: {}tps <server-id>", self.prefix),
                    );
                };
                self.send_command(message, registry, chat, transport, server_id, "tps", &[])
            }
            "exec" => {
                if self.owner_id != Some(message.author_id) {
                    return chat.post(message.channel_id, "Only the bot owner can use exec.");
                }
                if args.len() < 2 {
                    return chat.post(
                        message.channel_id,
                        &format!("Usage: {}exec <server-id> <command...>", self.prefix),
                    );
                }
                self.send_command(message, registry, chat, transport, args[0], "exec", &args[1..])
            }
            _ => {
                debug!("Ignoring unknown command '{}'", name);
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn send_command(
        &self,
        message: &PostedMessage,
        registry: &OnlineServerRegistry,
        chat: &dyn ChatSink,
        transport: &mut dyn Transport,
        server_id: &str,
        command_name: &str,
        args: &[&str],
    ) -> Result<()> {
        if registry.get(server_id).is_none() {
            return chat.post(
                message.channel_id,
                &format!("Unknown server `{}`.", server_id),
            );
        }

        let command = if args.is_empty() {
            command_name.to_string()
        } else {
            args.join(" ")
        };
        let request = GenericCommand {
            server_id: server_id.to_string(),
            channel_id: message.channel_id,
            command_name: command_name.to_string(),
            command,
            args: args.iter().map(|a| a.to_string()).collect(),
        };
        // Every server receives it; only `server_id` acts on it
        transport.broadcast(&encode(&request)?)
    }
}

fn online_summary(registry: &OnlineServerRegistry) -> String {
    if registry.is_empty() {
        return "No servers are online.".to_string();
    }

    let mut summary = format!("Online servers ({}):\n", registry.len());
    for server in registry.all() {
        let status = server
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        summary.push_str(&format!("  - {} (`{}`, {}", server.display_name, server.id, status));
        if !server.address.is_empty() {
            summary.push_str(&format!(", {}", server.address));
        }
        summary.push_str(&format!(
            "): {}/{} players",
            server.player_count(),
            server.max_players
        ));
        if !server.players.is_empty() {
            summary.push_str(&format!(": {}", server.players.join(", ")));
        }
        summary.push('\n');
    }
    summary
}
