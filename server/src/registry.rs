//! Session registry and server configuration for the relay server
//!
//! This module owns the authoritative mapping from player ids to live
//! sessions, including:
//! - Monotonic id assignment (ids are never reused)
//! - Session lifecycle bookkeeping for both transports
//! - Token and connection lookups
//! - Roster snapshots for join batches and the admin dashboard
//!
//! A session exists in the registry iff it is *active*: it counts
//! toward capacity, appears in the roster, and is a relay target.
//! Stream connections that have not completed JOIN are placeholders
//! owned by their connection task and are invisible here.

use shared::PosUpdate;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use serde::{Deserialize, Serialize};

/// Transport-specific half of a session.
///
/// The two shapes share the identity fields on [`Session`]; everything
/// that only one transport needs lives behind this tag.
#[derive(Debug)]
pub enum Transport {
    /// Persistent connection. The sender feeds the connection's writer
    /// task; dropping it (on removal) closes the socket's write side.
    Stream { tx: mpsc::UnboundedSender<String> },
    /// Request/response polling. Events are queued as encoded lines
    /// until the next sync drains them.
    Poll {
        token: String,
        last_poll: Instant,
        queue: Vec<String>,
    },
}

/// One registered player endpoint, regardless of transport.
#[derive(Debug)]
pub struct Session {
    /// Unique player id assigned by the registry; 0 is reserved for
    /// server/admin messages and never assigned.
    pub id: u32,
    /// Display name announced in the roster.
    pub name: String,
    /// Remote address the session was established from.
    pub addr: SocketAddr,
    /// Current character sprite name, updated by POS.
    pub character_name: String,
    /// Current character sprite index, updated by POS.
    pub character_index: u32,
    /// Transport discriminator and per-transport state.
    pub transport: Transport,
}

impl Session {
    /// Applies the appearance fields of a position update. The map and
    /// coordinate fields are relayed, not stored: the relay keeps no
    /// world state beyond the roster.
    pub fn apply_pos(&mut self, pos: &PosUpdate) {
        self.character_name = pos.character_name.clone();
        self.character_index = pos.character_index;
    }

    /// Returns the session token if this is a poll session.
    pub fn token(&self) -> Option<&str> {
        match &self.transport {
            Transport::Poll { token, .. } => Some(token),
            Transport::Stream { .. } => None,
        }
    }

    /// Checks whether a poll session has been idle past the timeout.
    /// Stream sessions never time out here; their disconnect is the
    /// connection closing.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        match &self.transport {
            Transport::Poll { last_poll, .. } => now.duration_since(*last_poll) > timeout,
            Transport::Stream { .. } => false,
        }
    }
}

/// Identity snapshot of one active session, as needed by join batches
/// and the dashboard roster view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RosterEntry {
    pub id: u32,
    pub name: String,
    pub character_name: String,
    pub character_index: u32,
}

/// Shared mutable server configuration, read by every join and list
/// operation and written only through the admin interface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerConfig {
    /// Display name shown in WELCOME and discovery listings.
    pub name: String,
    /// Message of the day, delivered as a system CHAT on join.
    pub motd: String,
    /// Admission limit; joins are rejected at this count.
    pub max_players: usize,
}

/// Partial configuration update from the admin interface. Fields left
/// unset retain their prior values.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    pub name: Option<String>,
    pub motd: Option<String>,
    pub max_players: Option<usize>,
}

impl ServerConfig {
    /// Merges a partial update into the live config.
    pub fn apply(&mut self, patch: ConfigPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(motd) = patch.motd {
            self.motd = motd;
        }
        if let Some(max_players) = patch.max_players {
            self.max_players = max_players;
        }
    }
}

/// Authoritative store of all active sessions.
///
/// Ids are assigned in strictly increasing order starting from 1 and
/// are never reused, so a removed id can never be confused with a
/// later joiner. Admission control lives in the relay core, which
/// owns both this registry and the capacity limit.
pub struct SessionRegistry {
    sessions: std::collections::HashMap<u32, Session>,
    next_id: u32,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: std::collections::HashMap::new(),
            next_id: 1,
        }
    }

    /// Returns the next player id. Strictly increasing; never reused.
    pub fn assign_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Adds a session to the active set.
    ///
    /// A duplicate id would be a programming defect, not a runtime
    /// condition, hence the debug assertion rather than an error path.
    pub fn insert(&mut self, session: Session) {
        debug_assert!(
            !self.sessions.contains_key(&session.id),
            "duplicate session id {}",
            session.id
        );
        log::info!("Session {} ({}) registered", session.id, session.name);
        self.sessions.insert(session.id, session);
    }

    /// Removes a session from the active set, returning it so the
    /// caller can announce the departure.
    pub fn remove(&mut self, id: u32) -> Option<Session> {
        let session = self.sessions.remove(&id);
        if let Some(session) = &session {
            log::info!("Session {} ({}) removed", session.id, session.name);
        }
        session
    }

    pub fn get(&self, id: u32) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Resolves a stream connection's remote address to its session id.
    ///
    /// Only stream sessions participate: a connection is the identity
    /// on that transport, while poll sessions are keyed by token and
    /// may move between addresses.
    pub fn lookup_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.sessions
            .iter()
            .find(|(_, session)| {
                matches!(session.transport, Transport::Stream { .. }) && session.addr == addr
            })
            .map(|(id, _)| *id)
    }

    /// Resolves a poll token to the session id holding it.
    ///
    /// Tokens are unique among active sessions only; once a session is
    /// removed its token may later be minted for someone else.
    pub fn lookup_by_token(&self, token: &str) -> Option<u32> {
        self.sessions
            .iter()
            .find(|(_, session)| session.token() == Some(token))
            .map(|(id, _)| *id)
    }

    /// Identity snapshot of every active session, ordered by id so
    /// join batches are deterministic.
    pub fn roster(&self) -> Vec<RosterEntry> {
        let mut entries: Vec<RosterEntry> = self
            .sessions
            .values()
            .map(|session| RosterEntry {
                id: session.id,
                name: session.name.clone(),
                character_name: session.character_name.clone(),
                character_index: session.character_index,
            })
            .collect();
        entries.sort_by_key(|entry| entry.id);
        entries
    }

    /// Mutable walk over all active sessions, used by the fan-out.
    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn stream_session(id: u32, name: &str) -> (Session, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Session {
                id,
                name: name.to_string(),
                addr: test_addr(),
                character_name: "hero".to_string(),
                character_index: 1,
                transport: Transport::Stream { tx },
            },
            rx,
        )
    }

    fn poll_session(id: u32, name: &str, token: &str) -> Session {
        Session {
            id,
            name: name.to_string(),
            addr: test_addr(),
            character_name: "hero".to_string(),
            character_index: 1,
            transport: Transport::Poll {
                token: token.to_string(),
                last_poll: Instant::now(),
                queue: Vec::new(),
            },
        }
    }

    #[test]
    fn test_ids_strictly_increasing_and_never_reused() {
        let mut registry = SessionRegistry::new();

        let first = registry.assign_id();
        let second = registry.assign_id();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let (session, _rx) = stream_session(first, "Alice");
        registry.insert(session);
        registry.remove(first);

        // Removal never recycles the id
        assert_eq!(registry.assign_id(), 3);
    }

    #[test]
    fn test_insert_and_remove() {
        let mut registry = SessionRegistry::new();
        let (session, _rx) = stream_session(1, "Alice");

        registry.insert(session);
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());

        let removed = registry.remove(1).unwrap();
        assert_eq!(removed.name, "Alice");
        assert!(registry.is_empty());

        assert!(registry.remove(1).is_none());
    }

    #[test]
    fn test_lookup_by_token() {
        let mut registry = SessionRegistry::new();
        registry.insert(poll_session(1, "Alice", "tok-a"));
        registry.insert(poll_session(2, "Bob", "tok-b"));

        assert_eq!(registry.lookup_by_token("tok-a"), Some(1));
        assert_eq!(registry.lookup_by_token("tok-b"), Some(2));
        assert_eq!(registry.lookup_by_token("unknown"), None);

        registry.remove(1);
        assert_eq!(registry.lookup_by_token("tok-a"), None);
    }

    #[test]
    fn test_stream_sessions_have_no_token() {
        let mut registry = SessionRegistry::new();
        let (session, _rx) = stream_session(1, "Alice");
        registry.insert(session);

        assert_eq!(registry.get(1).unwrap().token(), None);
        assert_eq!(registry.lookup_by_token(""), None);
    }

    #[test]
    fn test_lookup_by_addr_matches_stream_only() {
        let mut registry = SessionRegistry::new();
        let (session, _rx) = stream_session(1, "Alice");
        registry.insert(session);
        registry.insert(poll_session(2, "Bob", "tok-b"));

        // Both sessions share test_addr(); only the stream one resolves
        assert_eq!(registry.lookup_by_addr(test_addr()), Some(1));
        assert_eq!(
            registry.lookup_by_addr("127.0.0.1:9".parse().unwrap()),
            None
        );

        registry.remove(1);
        assert_eq!(registry.lookup_by_addr(test_addr()), None);
    }

    #[test]
    fn test_roster_sorted_by_id() {
        let mut registry = SessionRegistry::new();
        registry.insert(poll_session(3, "Carol", "tok-c"));
        let (session, _rx) = stream_session(1, "Alice");
        registry.insert(session);
        registry.insert(poll_session(2, "Bob", "tok-b"));

        let roster = registry.roster();
        let ids: Vec<u32> = roster.iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(roster[0].name, "Alice");
    }

    #[test]
    fn test_apply_pos_updates_appearance_only() {
        let (mut session, _rx) = stream_session(1, "Alice");
        session.apply_pos(&PosUpdate {
            map: "cave".to_string(),
            x: 5,
            y: 6,
            direction: 2,
            speed: 4,
            character_name: "mage".to_string(),
            character_index: 7,
        });

        assert_eq!(session.character_name, "mage");
        assert_eq!(session.character_index, 7);
        // Identity is untouched
        assert_eq!(session.name, "Alice");
    }

    #[test]
    fn test_poll_idle_detection() {
        let now = Instant::now();
        let mut session = poll_session(1, "Alice", "tok");
        let timeout = Duration::from_secs(30);

        assert!(!session.is_idle(now, timeout));

        if let Transport::Poll { last_poll, .. } = &mut session.transport {
            *last_poll = now - Duration::from_secs(31);
        }
        assert!(session.is_idle(now, timeout));

        // Stream sessions never reap
        let (stream, _rx) = stream_session(2, "Bob");
        assert!(!stream.is_idle(now, timeout));
    }

    #[test]
    fn test_config_partial_merge() {
        let mut config = ServerConfig {
            name: "MyServer".to_string(),
            motd: "welcome".to_string(),
            max_players: 8,
        };

        config.apply(ConfigPatch {
            motd: Some("new motd".to_string()),
            ..Default::default()
        });

        assert_eq!(config.name, "MyServer");
        assert_eq!(config.motd, "new motd");
        assert_eq!(config.max_players, 8);

        config.apply(ConfigPatch {
            name: Some("Renamed".to_string()),
            max_players: Some(2),
            ..Default::default()
        });
        assert_eq!(config.name, "Renamed");
        assert_eq!(config.max_players, 2);
    }
}
