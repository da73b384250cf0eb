use std::collections::HashMap;

use tracing::info;

use crate::protocol::ServerState;

/// A game server known to the relay
#[derive(Debug, Clone, PartialEq)]
pub struct OnlineServer {
    pub id: String,
    /// Defaults to the id until the server sends its info
    pub display_name: String,
    pub address: String,
    pub max_players: u32,
    pub players: Vec<String>,
    pub status: Option<ServerState>,
    pub last_seen_tick: u64,
}

impl OnlineServer {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: id.to_string(),
            address: String::new(),
            max_players: 0,
            players: Vec::new(),
            status: None,
            last_seen_tick: 0,
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }
}

/// Partial update merged into an [`OnlineServer`]. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct ServerUpdate {
    pub display_name: Option<String>,
    pub address: Option<String>,
    pub max_players: Option<u32>,
    pub players: Option<Vec<String>>,
    pub status: Option<ServerState>,
    pub last_seen_tick: Option<u64>,
}

impl ServerUpdate {
    fn apply(self, server: &mut OnlineServer) {
        if let Some(display_name) = self.display_name {
            server.display_name = display_name;
        }
        if let Some(address) = self.address {
            server.address = address;
        }
        if let Some(max_players) = self.max_players {
            server.max_players = max_players;
        }
        if let Some(players) = self.players {
            server.players = players;
        }
        if let Some(status) = self.status {
            server.status = Some(status);
        }
        if let Some(tick) = self.last_seen_tick {
            server.last_seen_tick = tick;
        }
    }
}

/// Servers seen since startup, in the order they first appeared.
///
/// Owned by the tick thread. Entries are never removed.
#[derive(Debug, Default)]
pub struct OnlineServerRegistry {
    servers: Vec<OnlineServer>,
    index: HashMap<String, usize>,
}

impl OnlineServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry if missing, then merge `update` into it.
    pub fn upsert(&mut self, id: &str, update: ServerUpdate) -> &OnlineServer {
        let position = match self.index.get(id) {
            Some(&position) => position,
            None => {
                info!("New server registered: {}", id);
                self.servers.push(OnlineServer::new(id));
                let position = self.servers.len() - 1;
                self.index.insert(id.to_string(), position);
                position
            }
        };

        let server = &mut self.servers[position];
        update.apply(server);
        server
    }

    pub fn get(&self, id: &str) -> Option<&OnlineServer> {
        self.index.get(id).map(|&position| &self.servers[position])
    }

    /// Snapshot of every entry in insertion order
    pub fn all(&self) -> Vec<OnlineServer> {
        self.servers.clone()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_creates_entry() {
        let mut registry = OnlineServerRegistry::new();
        let server = registry.upsert("survival", ServerUpdate::default());

        assert_eq!(server.id, "survival");
        assert_eq!(server.display_name, "survival");
        assert!(server.players.is_empty());
        assert_eq!(server.status, None);
    }

    #[test]
    fn test_upsert_same_id_keeps_one_entry() {
        let mut registry = OnlineServerRegistry::new();
        for tick in 0..5 {
            registry.upsert(
                "survival",
                ServerUpdate {
                    last_seen_tick: Some(tick),
                    ..Default::default()
                },
            );
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("survival").unwrap().last_seen_tick, 4);
    }

    #[test]
    fn test_upsert_merges_last_write_wins() {
        let mut registry = OnlineServerRegistry::new();
        registry.upsert(
            "survival",
            ServerUpdate {
                display_name: Some("Survival".to_string()),
                max_players: Some(20),
                players: Some(vec!["alice".to_string()]),
                ..Default::default()
            },
        );
        registry.upsert(
            "survival",
            ServerUpdate {
                display_name: Some("Survival S2".to_string()),
                status: Some(ServerState::Started),
                ..Default::default()
            },
        );

        let server = registry.get("survival").unwrap();
        assert_eq!(server.display_name, "Survival S2");
        assert_eq!(server.max_players, 20);
        assert_eq!(server.players, vec!["alice".to_string()]);
        assert_eq!(server.status, Some(ServerState::Started));
    }

    #[test]
    fn test_get_unknown_is_none() {
        let registry = OnlineServerRegistry::new();
        assert!(registry.get("nope").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_all_is_insertion_ordered_snapshot() {
        let mut registry = OnlineServerRegistry::new();
        registry.upsert("b", ServerUpdate::default());
        registry.upsert("a", ServerUpdate::default());
        registry.upsert("c", ServerUpdate::default());
        registry.upsert("a", ServerUpdate::default());

        let snapshot = registry.all();
        let ids: Vec<&str> = snapshot.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);

        registry.upsert(
            "b",
            ServerUpdate {
                display_name: Some("changed".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(snapshot[0].display_name, "b");
    }
}
