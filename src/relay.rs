use anyhow::Result;
use tracing::debug;

use crate::platform::{PlatformEvent, PostedMessage};
use crate::protocol::{encode, ChatMessage, DISCORD_SERVER_ID};
use crate::transport::Transport;

/// Why an event was not relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not a posted message
    Unhandled,
    FromBot,
    OtherChannel,
}

/// What to do with one drained platform event
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Relay(ChatMessage),
    Command(PostedMessage),
    Drop(DropReason),
}

/// Decides, per event, whether Discord chat goes out to the game servers.
#[derive(Debug, Clone)]
pub struct EventFilter {
    general_channel: u64,
    command_prefix: String,
}

impl EventFilter {
    pub fn new(general_channel: u64, command_prefix: impl Into<String>) -> Self {
        Self {
            general_channel,
            command_prefix: command_prefix.into(),
        }
    }

    pub fn route(&self, event: PlatformEvent) -> Route {
        let message = match event {
            PlatformEvent::MessagePosted(message) => message,
            PlatformEvent::Other { kind } => {
                debug!("Ignoring Discord event '{}'", kind);
                return Route::Drop(DropReason::Unhandled);
            }
        };

        // Our own posts and other bots never go back out
        if message.author_is_bot {
            return Route::Drop(DropReason::FromBot);
        }
        if message.content.starts_with(&self.command_prefix) {
            return Route::Command(message);
        }
        if message.channel_id != self.general_channel {
            return Route::Drop(DropReason::OtherChannel);
        }

        let line = format!("[Discord] {}: {}", message.author_name, message.content);
        Route::Relay(ChatMessage::new(DISCORD_SERVER_ID, line))
    }
}

/// Send a relayed chat line to every connected server.
pub fn broadcast_chat(transport: &mut dyn Transport, chat: &ChatMessage) -> Result<()> {
    let bytes = encode(chat)?;
    transport.broadcast(&bytes)
}
