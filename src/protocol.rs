use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Server id used for messages that originate on Discord
pub const DISCORD_SERVER_ID: &str = "Discord";

/// A typed message that can travel inside an [`Envelope`].
pub trait PolychatMessage: Serialize + DeserializeOwned + Send + 'static {
    /// Type tag written into the envelope
    const TYPE: &'static str;

    /// Id of the game server the message belongs to
    fn server_id(&self) -> &str;
}

/// Self-describing wrapper around every message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn pack<M: PolychatMessage>(message: &M) -> Result<Self> {
        let payload = serde_json::to_value(message)
            .with_context(|| format!("Failed to serialize {}", M::TYPE))?;
        Ok(Self {
            type_tag: M::TYPE.to_string(),
            payload,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("Malformed envelope")
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize envelope")
    }

    /// Decode the payload as `M`. Rejects a mismatched tag and an empty server id.
    pub fn unpack<M: PolychatMessage>(&self) -> Result<M> {
        if self.type_tag != M::TYPE {
            anyhow::bail!(
                "Envelope carries '{}', expected '{}'",
                self.type_tag,
                M::TYPE
            );
        }
        let message: M = serde_json::from_value(self.payload.clone())
            .with_context(|| format!("Malformed {} payload", M::TYPE))?;
        if message.server_id().is_empty() {
            anyhow::bail!("{} has an empty server_id", M::TYPE);
        }
        Ok(message)
    }
}

/// Pack a message straight into frame bytes.
pub fn encode<M: PolychatMessage>(message: &M) -> Result<Vec<u8>> {
    Envelope::pack(message)?.to_bytes()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub server_id: String,
    pub message: String,
    /// UTF-16 offset of the separator between the sender prefix and the text
    pub message_offset: i32,
}

impl ChatMessage {
    /// Build a chat line with the offset pointing at the first `:`.
    pub fn new(server_id: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let message_offset = separator_offset(&message);
        Self {
            server_id: server_id.into(),
            message,
            message_offset,
        }
    }
}

/// UTF-16 index of the first `:` in `text`, or -1 when there is none.
pub fn separator_offset(text: &str) -> i32 {
    match text.find(':') {
        Some(byte_index) => text[..byte_index].encode_utf16().count() as i32,
        None => -1,
    }
}

impl PolychatMessage for ChatMessage {
    const TYPE: &'static str = "chat_message";

    fn server_id(&self) -> &str {
        &self.server_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    #[serde(default)]
    pub server_address: String,
    #[serde(default)]
    pub max_players: u32,
}

impl PolychatMessage for ServerInfo {
    const TYPE: &'static str = "server_info";

    fn server_id(&self) -> &str {
        &self.server_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Started,
    Stopped,
    Crashed,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Started => write!(f, "started"),
            ServerState::Stopped => write!(f, "stopped"),
            ServerState::Crashed => write!(f, "crashed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server_id: String,
    pub status: ServerState,
}

impl PolychatMessage for ServerStatus {
    const TYPE: &'static str = "server_status";

    fn server_id(&self) -> &str {
        &self.server_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayersOnline {
    pub server_id: String,
    pub players_online: u32,
    #[serde(default)]
    pub player_names: Vec<String>,
}

impl PolychatMessage for PlayersOnline {
    const TYPE: &'static str = "players_online";

    fn server_id(&self) -> &str {
        &self.server_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Joined,
    Left,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerStatusChanged {
    pub server_id: String,
    pub player_name: String,
    pub new_status: PlayerState,
}

impl PolychatMessage for PlayerStatusChanged {
    const TYPE: &'static str = "player_status_changed";

    fn server_id(&self) -> &str {
        &self.server_id
    }
}

/// A command sent from Discord to one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericCommand {
    pub server_id: String,
    /// Channel the result should be posted to
    pub channel_id: u64,
    pub command_name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl PolychatMessage for GenericCommand {
    const TYPE: &'static str = "generic_command";

    fn server_id(&self) -> &str {
        &self.server_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericCommandResult {
    pub server_id: String,
    #[serde(default)]
    pub channel_id: u64,
    pub command_name: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub output: Vec<String>,
}

impl PolychatMessage for GenericCommandResult {
    const TYPE: &'static str = "generic_command_result";

    fn server_id(&self) -> &str {
        &self.server_id
    }
}

/// A server asking for a Discord member to be given a rank's role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromoteMemberCommand {
    pub server_id: String,
    /// Discord user id of the member being promoted
    pub member_id: u64,
    /// In-game name, used in the announcement
    #[serde(default)]
    pub player_name: String,
    pub rank: String,
}

impl PolychatMessage for PromoteMemberCommand {
    const TYPE: &'static str = "promote_member_command";

    fn server_id(&self) -> &str {
        &self.server_id
    }
}
