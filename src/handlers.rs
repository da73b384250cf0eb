use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::dispatcher::{HandlerContext, MessageDispatcher, MessageHandler};
use crate::protocol::{
    encode, ChatMessage, GenericCommandResult, PlayerState, PlayerStatusChanged, PlayersOnline,
    PromoteMemberCommand, ServerInfo, ServerState, ServerStatus,
};
use crate::registry::ServerUpdate;

/// The dispatch table used by the relay, in invocation order.
///
/// `ranks` maps rank names to the Discord roles promotions grant.
pub fn default_dispatcher(ranks: &HashMap<String, u64>) -> MessageDispatcher {
    MessageDispatcher::builder()
        .register(ChatMessageHandler)
        .register(PromoteMemberHandler::new(ranks))
        .register(ServerInfoHandler)
        .register(ServerStatusHandler)
        .register(PlayersOnlineHandler)
        .register(PlayerStatusChangedHandler)
        .register(CommandResultHandler)
        .build()
}

/// Chat from one server goes to Discord and to every other server.
pub struct ChatMessageHandler;

impl MessageHandler for ChatMessageHandler {
    type Message = ChatMessage;

    fn handle(&mut self, message: &ChatMessage, ctx: &mut HandlerContext<'_>) -> Result<()> {
        ctx.touch(&message.server_id);

        let posted = ctx.post_general(&message.message);
        if let Err(e) = &posted {
            warn!("Chat from {} not posted to Discord: {:#}", message.server_id, e);
        }

        let bytes = encode(message)?;
        ctx.transport.broadcast_except(ctx.origin, &bytes)?;
        posted
    }
}

/// Grants the Discord role for a rank when a server promotes one of its players.
pub struct PromoteMemberHandler {
    /// Keyed by lowercased rank name
    roles: HashMap<String, u64>,
}

impl PromoteMemberHandler {
    pub fn new(ranks: &HashMap<String, u64>) -> Self {
        Self {
            roles: ranks
                .iter()
                .map(|(rank, &role)| (rank.to_lowercase(), role))
                .collect(),
        }
    }
}

impl MessageHandler for PromoteMemberHandler {
    type Message = PromoteMemberCommand;

    fn handle(
        &mut self,
        message: &PromoteMemberCommand,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<()> {
        let name = ctx.touch(&message.server_id).display_name.clone();
        if message.member_id == 0 {
            anyhow::bail!("promotion from {} names no Discord member", message.server_id);
        }

        let Some(&role) = self.roles.get(&message.rank.to_lowercase()) else {
            return ctx.post_general(&format!(
                "Cannot promote <@{}>: {} asked for unknown rank `{}`.",
                message.member_id, name, message.rank
            ));
        };

        ctx.chat.add_role(message.member_id, role)?;
        info!(
            "Promoted member {} to {} for {}",
            message.member_id, message.rank, message.server_id
        );

        let who = if message.player_name.is_empty() {
            format!("<@{}>", message.member_id)
        } else {
            format!("{} (<@{}>)", message.player_name, message.member_id)
        };
        ctx.post_general(&format!("{} has been promoted to {} on {}.", who, message.rank, name))
    }
}

pub struct ServerInfoHandler;

impl MessageHandler for ServerInfoHandler {
    type Message = ServerInfo;

    fn handle(&mut self, message: &ServerInfo, ctx: &mut HandlerContext<'_>) -> Result<()> {
        info!(
            "Server info for {}: '{}' at {} ({} slots)",
            message.server_id, message.server_name, message.server_address, message.max_players
        );
        ctx.upsert(
            &message.server_id,
            ServerUpdate {
                display_name: Some(message.server_name.clone()),
                address: Some(message.server_address.clone()),
                max_players: Some(message.max_players),
                ..Default::default()
            },
        );
        Ok(())
    }
}

/// Tracks lifecycle changes and announces them in the shared channel.
pub struct ServerStatusHandler;

impl MessageHandler for ServerStatusHandler {
    type Message = ServerStatus;

    fn handle(&mut self, message: &ServerStatus, ctx: &mut HandlerContext<'_>) -> Result<()> {
        // A stopped or crashed server has nobody on it
        let players = match message.status {
            ServerState::Started => None,
            ServerState::Stopped | ServerState::Crashed => Some(Vec::new()),
        };
        let name = ctx
            .upsert(
                &message.server_id,
                ServerUpdate {
                    status: Some(message.status),
                    players,
                    ..Default::default()
                },
            )
            .display_name
            .clone();

        info!("Server {} has {}", message.server_id, message.status);
        ctx.post_general(&format!("Server {} has {}.", name, message.status))
    }
}

pub struct PlayersOnlineHandler;

impl MessageHandler for PlayersOnlineHandler {
    type Message = PlayersOnline;

    fn handle(&mut self, message: &PlayersOnline, ctx: &mut HandlerContext<'_>) -> Result<()> {
        if message.players_online as usize != message.player_names.len() {
            debug!(
                "{} reports {} players but lists {}",
                message.server_id,
                message.players_online,
                message.player_names.len()
            );
        }
        ctx.upsert(
            &message.server_id,
            ServerUpdate {
                players: Some(message.player_names.clone()),
                ..Default::default()
            },
        );
        Ok(())
    }
}

pub struct PlayerStatusChangedHandler;

impl MessageHandler for PlayerStatusChangedHandler {
    type Message = PlayerStatusChanged;

    fn handle(
        &mut self,
        message: &PlayerStatusChanged,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<()> {
        let server = ctx.touch(&message.server_id);
        let mut players = server.players.clone();
        let name = server.display_name.clone();

        let verb = match message.new_status {
            PlayerState::Joined => {
                if !players.contains(&message.player_name) {
                    players.push(message.player_name.clone());
                }
                "joined"
            }
            PlayerState::Left => {
                players.retain(|p| p != &message.player_name);
                "left"
            }
        };
        ctx.upsert(
            &message.server_id,
            ServerUpdate {
                players: Some(players),
                ..Default::default()
            },
        );

        ctx.post_general(&format!("{} has {} {}.", message.player_name, verb, name))
    }
}

/// Posts the output of a remote command back where it was requested.
pub struct CommandResultHandler;

impl MessageHandler for CommandResultHandler {
    type Message = GenericCommandResult;

    fn handle(
        &mut self,
        message: &GenericCommandResult,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<()> {
        let name = ctx.touch(&message.server_id).display_name.clone();
        let channel = if message.channel_id == 0 {
            ctx.general_channel
        } else {
            message.channel_id
        };

        let outcome = if message.success { "succeeded" } else { "failed" };
        let mut text = format!("Command `{}` on {} {}", message.command_name, name, outcome);
        if message.output.is_empty() {
            text.push('.');
        } else {
            text.push_str(&format!(":\n```\n{}\n```", message.output.join("\n")));
        }

        ctx.chat.post(channel, &text)
    }
}
