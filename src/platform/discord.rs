use std::sync::Arc;

use anyhow::{Context as _, Result};
use serenity::all::{ChannelId, GuildId, Http, RoleId, User, UserId};
use serenity::async_trait;
use serenity::model::channel::{Message, Reaction};
use serenity::model::gateway::Ready;
use serenity::prelude::{Client, Context, EventHandler, GatewayIntents};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::DiscordConfig;
use crate::platform::{ChatSink, EventSender, PlatformEvent, PostedMessage};

/// Discord rejects messages longer than this many characters
const MAX_MESSAGE_LEN: usize = 2000;

/// Split `text` into chunks of at most `max_chars` characters, breaking after
/// a newline or space where one falls inside the window.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while let Some((limit, _)) = rest.char_indices().nth(max_chars) {
        let window = &rest[..limit];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    chunks.push(rest.to_string());

    chunks
}

/// Server nickname aside, the name Discord shows for `author`
fn author_name(author: &User) -> String {
    author.display_name().to_string()
}

/// Gateway callbacks. Runs on serenity's tasks and only ever pushes into the queue.
struct Handler {
    events: EventSender,
}

impl Handler {
    fn forward(&self, event: PlatformEvent) {
        if !self.events.push(event) {
            warn!("Relay loop is gone, dropping Discord event");
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, _ctx: Context, msg: Message) {
        let author_name = author_name(&msg.author);
        debug!(
            "Discord message from {} in {}: {}",
            author_name, msg.channel_id, msg.content
        );
        self.forward(PlatformEvent::MessagePosted(PostedMessage {
            author_name,
            author_is_bot: msg.author.bot,
            author_id: msg.author.id.get(),
            channel_id: msg.channel_id.get(),
            content: msg.content.clone(),
        }));
    }

    async fn reaction_add(&self, _ctx: Context, _reaction: Reaction) {
        self.forward(PlatformEvent::Other {
            kind: "reaction_add".to_string(),
        });
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("Connected to Discord as {}", ready.user.name);
    }
}

/// Posts into Discord from the tick thread by blocking on the runtime.
pub struct DiscordChat {
    http: Arc<Http>,
    runtime: Handle,
    guild_id: Option<u64>,
}

impl ChatSink for DiscordChat {
    fn post(&self, channel_id: u64, text: &str) -> Result<()> {
        if channel_id == 0 {
            anyhow::bail!("Cannot post to channel id 0");
        }
        let channel = ChannelId::new(channel_id);
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            self.runtime
                .block_on(channel.say(&self.http, chunk))
                .with_context(|| format!("Failed to post to Discord channel {}", channel_id))?;
        }
        Ok(())
    }

    fn add_role(&self, member_id: u64, role_id: u64) -> Result<()> {
        let guild_id = self
            .guild_id
            .context("discord.guild_id is not configured")?;
        if member_id == 0 || role_id == 0 {
            anyhow::bail!("Cannot grant role {} to member {}", role_id, member_id);
        }
        self.runtime
            .block_on(self.http.add_member_role(
                GuildId::new(guild_id),
                UserId::new(member_id),
                RoleId::new(role_id),
                Some("Promoted from a game server"),
            ))
            .with_context(|| format!("Failed to give role {} to member {}", role_id, member_id))
    }
}

/// Log in to Discord and wire gateway events into `events`.
///
/// The returned client still has to be started; the sink is usable immediately.
pub async fn connect(config: &DiscordConfig, events: EventSender) -> Result<(Client, DiscordChat)> {
    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILD_MESSAGE_REACTIONS
        | GatewayIntents::MESSAGE_CONTENT;

    let client = Client::builder(&config.bot_token, intents)
        .event_handler(Handler { events })
        .await
        .context("Failed to build Discord client")?;

    let me = client
        .http
        .get_current_user()
        .await
        .context("Discord login failed, check discord.bot_token")?;
    info!("Authenticated with Discord as {} ({})", me.name, me.id);

    let chat = DiscordChat {
        http: client.http.clone(),
        runtime: Handle::current(),
        guild_id: config.guild_id,
    };
    Ok((client, chat))
}
