//! Relay core: admission, broadcast fan-out, and session teardown
//!
//! [`Relay`] owns the session registry and the live server config and
//! is the single serialization point for every state-changing
//! operation. All of its methods are synchronous and run to completion
//! under one `Mutex`, so each registry mutation plus its fan-out is
//! atomic; no await is ever held across the guard. Socket I/O happens
//! elsewhere: stream deliveries go through per-connection channels and
//! poll deliveries sit in per-session queues, so fan-out itself never
//! suspends.

use shared::{Event, PosUpdate, SYSTEM_ID};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

use log::{debug, info};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::notify::{Notification, NotificationSink};
use crate::registry::{
    ConfigPatch, RosterEntry, ServerConfig, Session, SessionRegistry, Transport,
};

/// How often the reaper wakes up.
pub const REAP_INTERVAL: Duration = Duration::from_secs(10);

/// Idle time after which a poll session is evicted.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Length of minted poll session tokens.
const TOKEN_LEN: usize = 24;

/// Transport mode advertised in discovery listings.
const TRANSPORT_MODE: &str = "dual";

/// A join was rejected; no session was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    Full,
}

/// A token did not resolve to an active session; nothing was mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    InvalidToken,
}

/// Relay shared between transport adapters, the reaper, and the admin
/// interface.
pub type SharedRelay = Arc<Mutex<Relay>>;

/// The relay state machine: session registry, server config, and the
/// dashboard notification sink.
pub struct Relay {
    registry: SessionRegistry,
    config: ServerConfig,
    notify: NotificationSink,
}

impl Relay {
    pub fn new(config: ServerConfig, notify: NotificationSink) -> Self {
        Self {
            registry: SessionRegistry::new(),
            config,
            notify,
        }
    }

    pub fn into_shared(self) -> SharedRelay {
        Arc::new(Mutex::new(self))
    }

    // ---- fan-out -------------------------------------------------------

    /// Delivers one encoded event to every active session except the
    /// excluded sender.
    ///
    /// Stream sessions get the line pushed onto their writer channel;
    /// a failed send means the connection is already going away and
    /// cleanup happens on its close event. Poll sessions get the line
    /// appended to their outbound queue, never dropped.
    fn fan_out(&mut self, line: &str, exclude: Option<u32>) {
        for session in self.registry.sessions_mut() {
            if Some(session.id) == exclude {
                continue;
            }
            match &mut session.transport {
                Transport::Stream { tx } => {
                    let _ = tx.send(line.to_string());
                }
                Transport::Poll { queue, .. } => {
                    queue.push(line.to_string());
                }
            }
        }
    }

    /// The batch a fresh joiner receives: WELCOME, the MOTD as a system
    /// CHAT, then one ADDPLAYER per already-present roster member.
    fn join_batch(&self, id: u32, token: Option<String>) -> Vec<String> {
        let mut batch = vec![Event::Welcome {
            id,
            server_name: self.config.name.clone(),
            token,
        }
        .encode()];

        if !self.config.motd.is_empty() {
            batch.push(
                Event::Chat {
                    sender_id: SYSTEM_ID,
                    sender_name: self.config.name.clone(),
                    text: self.config.motd.clone(),
                }
                .encode(),
            );
        }

        for entry in self.registry.roster() {
            if entry.id == id {
                continue;
            }
            batch.push(
                Event::AddPlayer {
                    id: entry.id,
                    name: entry.name,
                    character_name: entry.character_name,
                    character_index: entry.character_index,
                }
                .encode(),
            );
        }
        batch
    }

    fn is_full(&self) -> bool {
        self.registry.len() >= self.config.max_players
    }

    fn announce_join(&mut self, id: u32, name: &str, character_name: &str, character_index: u32) {
        let line = Event::AddPlayer {
            id,
            name: name.to_string(),
            character_name: character_name.to_string(),
            character_index,
        }
        .encode();
        self.fan_out(&line, Some(id));
        self.notify.emit(Notification::PlayerJoined {
            id,
            name: name.to_string(),
        });
        self.emit_count();
    }

    fn emit_count(&self) {
        self.notify.emit(Notification::PlayerCount {
            count: self.registry.len(),
        });
    }

    // ---- stream operations ---------------------------------------------

    /// Admits a stream client. The join batch is written directly to
    /// the connection through `tx` before the sender is handed to the
    /// session; the new player's ADDPLAYER then fans out to everyone
    /// else.
    ///
    /// `None` means the server is full: no session is created, no
    /// response is written, and the caller terminates the connection.
    pub fn join_stream(
        &mut self,
        name: String,
        character_name: String,
        character_index: u32,
        addr: SocketAddr,
        tx: mpsc::UnboundedSender<String>,
    ) -> Option<u32> {
        if self.is_full() {
            info!("Rejecting stream join from {}: server full", addr);
            return None;
        }

        let id = self.registry.assign_id();
        self.registry.insert(Session {
            id,
            name: name.clone(),
            addr,
            character_name: character_name.clone(),
            character_index,
            transport: Transport::Stream { tx: tx.clone() },
        });

        for line in self.join_batch(id, None) {
            let _ = tx.send(line);
        }
        self.announce_join(id, &name, &character_name, character_index);
        Some(id)
    }

    /// Position update from a stream connection. Unidentified or
    /// already-removed connections are silently ignored.
    pub fn stream_pos(&mut self, addr: SocketAddr, pos: PosUpdate) {
        if let Some(id) = self.registry.lookup_by_addr(addr) {
            self.pos(id, pos);
        }
    }

    /// Chat from a stream connection; same identity rule as
    /// [`Relay::stream_pos`].
    pub fn stream_chat(&mut self, addr: SocketAddr, text: String) {
        if let Some(id) = self.registry.lookup_by_addr(addr) {
            self.chat(id, text);
        }
    }

    /// Relays a position update from an identified session, excluding
    /// the sender. Unknown ids (already removed) are silently ignored.
    pub fn pos(&mut self, id: u32, pos: PosUpdate) {
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        session.apply_pos(&pos);

        let line = Event::Pos {
            sender_id: id,
            pos,
        }
        .encode();
        self.fan_out(&line, Some(id));
    }

    /// Relays a chat line from an identified session, excluding the
    /// sender.
    pub fn chat(&mut self, id: u32, text: String) {
        let Some(session) = self.registry.get(id) else {
            return;
        };
        let sender_name = session.name.clone();

        let line = Event::Chat {
            sender_id: id,
            sender_name: sender_name.clone(),
            text: text.clone(),
        }
        .encode();
        self.fan_out(&line, Some(id));
        self.notify.emit(Notification::ChatRelayed {
            sender_id: id,
            sender_name,
            text,
        });
    }

    /// Handles a stream connection closing for any reason.
    ///
    /// An identified connection tears its session down like any other
    /// departure; an unidentified one has nothing to remove, but a
    /// roster-count notification is emitted either way.
    pub fn disconnect_stream(&mut self, addr: SocketAddr) {
        let removed = self
            .registry
            .lookup_by_addr(addr)
            .map(|id| self.remove_session(id))
            .unwrap_or(false);
        if !removed {
            self.emit_count();
        }
    }

    // ---- poll operations -----------------------------------------------

    /// Admits a poll client, minting a token and an empty outbound
    /// queue. The response body is the same batch a stream client gets,
    /// with the token riding in WELCOME.
    pub fn join_poll(
        &mut self,
        name: String,
        character_name: String,
        character_index: u32,
        addr: SocketAddr,
    ) -> Result<String, JoinError> {
        if self.is_full() {
            info!("Rejecting poll join from {}: server full", addr);
            return Err(JoinError::Full);
        }

        let token = self.mint_token();
        let id = self.registry.assign_id();
        self.registry.insert(Session {
            id,
            name: name.clone(),
            addr,
            character_name: character_name.clone(),
            character_index,
            transport: Transport::Poll {
                token: token.clone(),
                last_poll: Instant::now(),
                queue: Vec::new(),
            },
        });

        let batch = self.join_batch(id, Some(token)).concat();
        self.announce_join(id, &name, &character_name, character_index);
        Ok(batch)
    }

    /// One poll exchange: refreshes the idle clock, relays an optional
    /// position update, and drains the session's queue in enqueue
    /// order.
    ///
    /// Under non-concurrent calls this yields exactly-once delivery per
    /// queued message. Two syncs racing on one token are not defended
    /// against; the drain is last-writer-wins, matching the reference
    /// behavior.
    pub fn sync(
        &mut self,
        token: &str,
        pos: Option<PosUpdate>,
    ) -> Result<String, SessionError> {
        let id = self
            .registry
            .lookup_by_token(token)
            .ok_or(SessionError::InvalidToken)?;

        if let Some(session) = self.registry.get_mut(id) {
            if let Transport::Poll { last_poll, .. } = &mut session.transport {
                *last_poll = Instant::now();
            }
        }

        if let Some(pos) = pos {
            self.pos(id, pos);
        }

        let Some(session) = self.registry.get_mut(id) else {
            return Ok(String::new());
        };
        match &mut session.transport {
            Transport::Poll { queue, .. } => Ok(std::mem::take(queue).concat()),
            Transport::Stream { .. } => Ok(String::new()),
        }
    }

    /// Chat over the polling transport; same token validation as sync.
    pub fn poll_chat(&mut self, token: &str, text: String) -> Result<(), SessionError> {
        let id = self
            .registry
            .lookup_by_token(token)
            .ok_or(SessionError::InvalidToken)?;
        self.chat(id, text);
        Ok(())
    }

    /// Explicit departure over the polling transport.
    pub fn poll_leave(&mut self, token: &str) -> Result<(), SessionError> {
        let id = self
            .registry
            .lookup_by_token(token)
            .ok_or(SessionError::InvalidToken)?;
        self.remove_session(id);
        Ok(())
    }

    /// Discovery record for the `list` operation:
    /// `name|address|port|count|max|mode`.
    pub fn list_record(&self, advertise_addr: &str, port: u16) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}\n",
            self.config.name,
            advertise_addr,
            port,
            self.registry.len(),
            self.config.max_players,
            TRANSPORT_MODE,
        )
    }

    fn mint_token(&self) -> String {
        // Collisions among ~24 alphanumeric chars are vanishingly rare,
        // but token uniqueness among active sessions is an invariant,
        // so re-roll until it holds.
        loop {
            let token: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(TOKEN_LEN)
                .map(char::from)
                .collect();
            if self.registry.lookup_by_token(&token).is_none() {
                return token;
            }
        }
    }

    // ---- teardown ------------------------------------------------------

    /// Removes a session and announces the departure. Every destruction
    /// path (leave, disconnect, kick, reap) funnels through here, so
    /// observers cannot distinguish them.
    fn remove_session(&mut self, id: u32) -> bool {
        if self.registry.remove(id).is_none() {
            return false;
        }
        let line = Event::DelPlayer { id }.encode();
        self.fan_out(&line, None);
        self.notify.emit(Notification::PlayerLeft { id });
        self.emit_count();
        true
    }

    /// Evicts every poll session idle past `timeout`, returning the
    /// removed ids. Called on a fixed interval by the reaper task.
    pub fn reap(&mut self, now: Instant, timeout: Duration) -> Vec<u32> {
        let idle: Vec<u32> = self
            .registry
            .sessions()
            .filter(|session| session.is_idle(now, timeout))
            .map(|session| session.id)
            .collect();

        for id in &idle {
            debug!("Reaping idle poll session {}", id);
            self.remove_session(*id);
        }
        idle
    }

    // ---- admin interface -----------------------------------------------

    /// Current configuration snapshot.
    pub fn config(&self) -> ServerConfig {
        self.config.clone()
    }

    /// Partial config merge; omitted fields retain prior values.
    pub fn update_config(&mut self, patch: ConfigPatch) {
        self.config.apply(patch);
        self.notify.emit(Notification::ConfigChanged {
            config: self.config.clone(),
        });
    }

    /// Roster snapshot for the dashboard.
    pub fn roster(&self) -> Vec<RosterEntry> {
        self.registry.roster()
    }

    /// Number of active sessions.
    pub fn count(&self) -> usize {
        self.registry.len()
    }

    /// Forcibly removes a session; teardown is identical to an
    /// explicit leave. Returns false if the id was not active.
    pub fn kick(&mut self, id: u32) -> bool {
        self.remove_session(id)
    }

    /// Sends a chat line from the system sender (id 0) to every
    /// session.
    pub fn broadcast_as_admin(&mut self, text: String) {
        let sender_name = self.config.name.clone();
        let line = Event::Chat {
            sender_id: SYSTEM_ID,
            sender_name: sender_name.clone(),
            text: text.clone(),
        }
        .encode();
        self.fan_out(&line, None);
        self.notify.emit(Notification::ChatRelayed {
            sender_id: SYSTEM_ID,
            sender_name,
            text,
        });
    }
}
