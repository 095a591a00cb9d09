//! Relay wire protocol shared between the server and its clients.
//!
//! Messages are newline-terminated text records whose fields are joined
//! by [`DELIMITER`]. The layouts are a compatibility contract with
//! existing clients: field order and the delimiter must not change.
//!
//! There is no escaping mechanism. A field value containing the
//! delimiter desynchronizes parsing on the receiving side; decode then
//! fails on arity and the record is dropped. This is a known protocol
//! limitation kept for wire compatibility.

use std::fmt::Write as _;

/// Field separator for all wire records.
pub const DELIMITER: char = '|';

/// Line terminator for all wire records.
pub const TERMINATOR: u8 = b'\n';

/// Maximum bytes a single record may occupy, terminator included.
///
/// A peer that exceeds this without sending a terminator is considered
/// broken or hostile and its connection/session is torn down.
pub const MAX_LINE_LEN: usize = 4096;

/// Sender id reserved for server-originated messages (MOTD, admin chat).
pub const SYSTEM_ID: u32 = 0;

/// Position and appearance fields carried by POS records.
///
/// The server never interprets `map`; it is relayed verbatim so the
/// protocol stays agnostic to how clients identify their maps.
#[derive(Debug, Clone, PartialEq)]
pub struct PosUpdate {
    pub map: String,
    pub x: i32,
    pub y: i32,
    pub direction: u32,
    pub speed: u32,
    pub character_name: String,
    pub character_index: u32,
}

/// Requests arriving on a persistent stream connection.
///
/// Stream clients are identified by their connection, so no token
/// rides along with POS or CHAT.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// `JOIN|name|characterName|characterIndex`
    Join {
        name: String,
        character_name: String,
        character_index: u32,
    },
    /// `POS|map|x|y|direction|speed|characterName|characterIndex`
    Pos(PosUpdate),
    /// `CHAT|text`
    Chat { text: String },
}

/// Requests arriving on the polling transport.
///
/// Poll sessions have no connection identity; every request after join
/// carries the session token as its leading field.
#[derive(Debug, Clone, PartialEq)]
pub enum PollRequest {
    /// `JOIN|name|characterName|characterIndex`
    Join {
        name: String,
        character_name: String,
        character_index: u32,
    },
    /// `SYNC|token` or `SYNC|token|map|x|y|direction|speed|characterName|characterIndex`
    Sync {
        token: String,
        pos: Option<PosUpdate>,
    },
    /// `CHAT|token|text`
    Chat { token: String, text: String },
    /// `LEAVE|token`
    Leave { token: String },
}

/// Events the server sends to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// `WELCOME|id|serverName` (stream) or `WELCOME|id|serverName|token` (poll)
    Welcome {
        id: u32,
        server_name: String,
        token: Option<String>,
    },
    /// `CHAT|senderId|senderName|text`; sender id 0 is the server itself
    Chat {
        sender_id: u32,
        sender_name: String,
        text: String,
    },
    /// `ADDPLAYER|id|name|characterName|characterIndex`
    AddPlayer {
        id: u32,
        name: String,
        character_name: String,
        character_index: u32,
    },
    /// `DELPLAYER|id`
    DelPlayer { id: u32 },
    /// `POS|senderId|map|x|y|direction|speed|characterName|characterIndex`
    Pos { sender_id: u32, pos: PosUpdate },
}

/// Splits a record into its raw fields, stripping the trailing newline.
pub fn split_record(line: &str) -> Vec<&str> {
    line.trim_end_matches(['\r', '\n'])
        .split(DELIMITER)
        .collect()
}

fn parse_pos(fields: &[&str]) -> Option<PosUpdate> {
    if fields.len() != 7 {
        return None;
    }
    Some(PosUpdate {
        map: fields[0].to_string(),
        x: fields[1].parse().ok()?,
        y: fields[2].parse().ok()?,
        direction: fields[3].parse().ok()?,
        speed: fields[4].parse().ok()?,
        character_name: fields[5].to_string(),
        character_index: fields[6].parse().ok()?,
    })
}

impl Request {
    /// Decodes one stream record. `None` means the record is unknown or
    /// malformed and must be silently dropped; decode failure is never
    /// fatal to the connection.
    pub fn decode(line: &str) -> Option<Request> {
        let fields = split_record(line);
        match *fields.first()? {
            "JOIN" if fields.len() == 4 => Some(Request::Join {
                name: fields[1].to_string(),
                character_name: fields[2].to_string(),
                character_index: fields[3].parse().ok()?,
            }),
            "POS" => parse_pos(&fields[1..]).map(Request::Pos),
            "CHAT" if fields.len() == 2 => Some(Request::Chat {
                text: fields[1].to_string(),
            }),
            _ => None,
        }
    }
}

impl PollRequest {
    /// Decodes one poll payload; same drop-on-failure contract as
    /// [`Request::decode`].
    pub fn decode(line: &str) -> Option<PollRequest> {
        let fields = split_record(line);
        match *fields.first()? {
            "JOIN" if fields.len() == 4 => Some(PollRequest::Join {
                name: fields[1].to_string(),
                character_name: fields[2].to_string(),
                character_index: fields[3].parse().ok()?,
            }),
            "SYNC" if fields.len() == 2 => Some(PollRequest::Sync {
                token: fields[1].to_string(),
                pos: None,
            }),
            "SYNC" if fields.len() == 9 => Some(PollRequest::Sync {
                token: fields[1].to_string(),
                pos: Some(parse_pos(&fields[2..])?),
            }),
            "CHAT" if fields.len() == 3 => Some(PollRequest::Chat {
                token: fields[1].to_string(),
                text: fields[2].to_string(),
            }),
            "LEAVE" if fields.len() == 2 => Some(PollRequest::Leave {
                token: fields[1].to_string(),
            }),
            _ => None,
        }
    }
}

impl Event {
    /// Encodes the event as a newline-terminated record.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        match self {
            Event::Welcome {
                id,
                server_name,
                token,
            } => {
                let _ = write!(out, "WELCOME|{}|{}", id, server_name);
                if let Some(token) = token {
                    let _ = write!(out, "|{}", token);
                }
            }
            Event::Chat {
                sender_id,
                sender_name,
                text,
            } => {
                let _ = write!(out, "CHAT|{}|{}|{}", sender_id, sender_name, text);
            }
            Event::AddPlayer {
                id,
                name,
                character_name,
                character_index,
            } => {
                let _ = write!(
                    out,
                    "ADDPLAYER|{}|{}|{}|{}",
                    id, name, character_name, character_index
                );
            }
            Event::DelPlayer { id } => {
                let _ = write!(out, "DELPLAYER|{}", id);
            }
            Event::Pos { sender_id, pos } => {
                let _ = write!(
                    out,
                    "POS|{}|{}|{}|{}|{}|{}|{}|{}",
                    sender_id,
                    pos.map,
                    pos.x,
                    pos.y,
                    pos.direction,
                    pos.speed,
                    pos.character_name,
                    pos.character_index
                );
            }
        }
        out.push('\n');
        out
    }

    /// Decodes one server event; used by clients and tests.
    pub fn decode(line: &str) -> Option<Event> {
        let fields = split_record(line);
        match *fields.first()? {
            "WELCOME" if fields.len() == 3 || fields.len() == 4 => Some(Event::Welcome {
                id: fields[1].parse().ok()?,
                server_name: fields[2].to_string(),
                token: fields.get(3).map(|t| t.to_string()),
            }),
            "CHAT" if fields.len() == 4 => Some(Event::Chat {
                sender_id: fields[1].parse().ok()?,
                sender_name: fields[2].to_string(),
                text: fields[3].to_string(),
            }),
            "ADDPLAYER" if fields.len() == 5 => Some(Event::AddPlayer {
                id: fields[1].parse().ok()?,
                name: fields[2].to_string(),
                character_name: fields[3].to_string(),
                character_index: fields[4].parse().ok()?,
            }),
            "DELPLAYER" if fields.len() == 2 => Some(Event::DelPlayer {
                id: fields[1].parse().ok()?,
            }),
            "POS" if fields.len() == 9 => Some(Event::Pos {
                sender_id: fields[1].parse().ok()?,
                pos: parse_pos(&fields[2..])?,
            }),
            _ => None,
        }
    }
}

/// Errors produced while accumulating inbound bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// More than [`MAX_LINE_LEN`] bytes arrived without a terminator.
    /// The peer must be disconnected.
    Overflow,
}

/// Accumulates raw bytes until complete newline-terminated records
/// appear, tolerating partial reads.
///
/// Input is treated as UTF-8 with invalid sequences replaced, since the
/// protocol is text-only and a lossy field simply fails decode later.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    buf: Vec<u8>,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes and returns every complete record now
    /// available, in arrival order.
    ///
    /// [`RecvError::Overflow`] is returned once the unterminated tail
    /// exceeds the size cap; the caller must drop the connection.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, RecvError> {
        self.buf.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == TERMINATOR) {
            if pos + 1 > MAX_LINE_LEN {
                return Err(RecvError::Overflow);
            }
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if self.buf.len() > MAX_LINE_LEN {
            return Err(RecvError::Overflow);
        }
        Ok(lines)
    }

    /// Number of buffered bytes not yet forming a complete record.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
