//! Ferry wire format: every datagram exchanged between two Ferry peers.
//!
//! Control messages are plain ASCII tags so that a packet capture reads like
//! the protocol table: `DISCOVER`, `NAME:..,IPS:..`, `DATA_START`, `DATA_END`,
//! `ABORT`. The two high-volume frames, CHUNK and ACK, carry a fixed binary
//! header laid out with zerocopy's network-endian integers. There is no
//! unsafe code in this module.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Well-known UDP port for discovery and transfers.
pub const DEFAULT_PORT: u16 = 3169;

/// Largest datagram either side will read or produce.
pub const MAX_DATAGRAM: usize = 4096;

/// Default chunk payload size.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Largest chunk payload that still fits a datagram after the header.
pub const MAX_CHUNK_PAYLOAD: usize = MAX_DATAGRAM - CHUNK_HEADER_LEN;

pub const CHUNK_MAGIC: [u8; 4] = *b"FCHK";
pub const ACK_MAGIC: [u8; 4] = *b"FACK";

/// Chunk flag: this is the last chunk of the payload.
pub const FLAG_FINAL: u8 = 0x01;

pub const DISCOVER_TAG: &str = "DISCOVER";
pub const DATA_START_TAG: &str = "DATA_START";
pub const DATA_END_TAG: &str = "DATA_END";
pub const ABORT_TAG: &str = "ABORT";

const REPLY_NAME_PREFIX: &str = "NAME:";
const REPLY_IPS_SEPARATOR: &str = ",IPS:";

// ── Binary frames ─────────────────────────────────────────────────────────────

/// Header preceding every chunk payload.
///
/// Wire size: 20 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChunkHeader {
    /// Always `CHUNK_MAGIC`.
    pub magic: [u8; 4],
    /// Session this chunk belongs to.
    pub session_id: [u8; 8],
    /// Dense sequence number, starting at 0.
    pub sequence: U32,
    /// bit 0: final chunk. bits 1-7: reserved, must be zero.
    pub flags: u8,
    /// Reserved, must be zero.
    pub reserved: u8,
    /// Payload length in bytes, not including this header.
    pub length: U16,
}

pub const CHUNK_HEADER_LEN: usize = std::mem::size_of::<ChunkHeader>();
assert_eq_size!(ChunkHeader, [u8; 20]);

/// Cumulative acknowledgement: every chunk up to and including `sequence`
/// has been received.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct AckFrame {
    pub magic: [u8; 4],
    pub session_id: [u8; 8],
    pub sequence: U32,
}

pub const ACK_FRAME_LEN: usize = std::mem::size_of::<AckFrame>();
assert_eq_size!(AckFrame, [u8; 16]);

// ── Session identifiers ───────────────────────────────────────────────────────

/// Opaque token distinguishing overlapping sessions from the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SessionId(pub [u8; 8]);

impl SessionId {
    /// Id assumed for a `DATA_START` that carries none.
    pub const LEGACY: SessionId = SessionId([0u8; 8]);

    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for SessionId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| WireError::InvalidSessionId(s.to_string()))?;
        let id: [u8; 8] = bytes
            .try_into()
            .map_err(|_| WireError::InvalidSessionId(s.to_string()))?;
        Ok(SessionId(id))
    }
}

// ── Payload types ─────────────────────────────────────────────────────────────

/// One sequenced slice of a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub sequence: u32,
    pub payload: Bytes,
    pub is_final: bool,
}

/// Identity advertised in a discovery reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub name: String,
    pub addresses: Vec<IpAddr>,
}

impl PeerIdentity {
    /// `NAME:<name>,IPS:<addr>;<addr>;...`
    pub fn to_reply(&self) -> String {
        let ips: Vec<String> = self.addresses.iter().map(ToString::to_string).collect();
        format!(
            "{REPLY_NAME_PREFIX}{}{REPLY_IPS_SEPARATOR}{}",
            self.name,
            ips.join(";")
        )
    }

    /// Parse a reply. The name may itself contain commas, so the address
    /// list is located from the right.
    pub fn parse_reply(text: &str) -> Result<Self, WireError> {
        let body = text
            .strip_prefix(REPLY_NAME_PREFIX)
            .ok_or_else(|| WireError::MalformedReply(text.to_string()))?;
        let (name, ips) = body
            .rsplit_once(REPLY_IPS_SEPARATOR)
            .ok_or_else(|| WireError::MalformedReply(text.to_string()))?;

        let addresses = ips
            .split(';')
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|_| WireError::InvalidAddress(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PeerIdentity {
            name: name.to_string(),
            addresses,
        })
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_reply())
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Every datagram Ferry understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Discover,
    DiscoverReply(PeerIdentity),
    DataStart {
        session_id: Option<SessionId>,
        total_bytes: Option<u64>,
    },
    Chunk {
        session_id: SessionId,
        chunk: Chunk,
    },
    Ack {
        session_id: SessionId,
        sequence: u32,
    },
    DataEnd {
        session_id: SessionId,
        reason: String,
    },
    Abort {
        session_id: SessionId,
        reason: String,
    },
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Discover => "discover",
            Message::DiscoverReply(_) => "discover_reply",
            Message::DataStart { .. } => "data_start",
            Message::Chunk { .. } => "chunk",
            Message::Ack { .. } => "ack",
            Message::DataEnd { .. } => "data_end",
            Message::Abort { .. } => "abort",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Discover => DISCOVER_TAG.as_bytes().to_vec(),
            Message::DiscoverReply(identity) => identity.to_reply().into_bytes(),
            Message::DataStart {
                session_id,
                total_bytes,
            } => {
                let text = match (session_id, total_bytes) {
                    (None, _) => DATA_START_TAG.to_string(),
                    (Some(id), None) => format!("{DATA_START_TAG}:{id}"),
                    (Some(id), Some(total)) => format!("{DATA_START_TAG}:{id}:{total}"),
                };
                text.into_bytes()
            }
            Message::Chunk { session_id, chunk } => {
                let header = ChunkHeader {
                    magic: CHUNK_MAGIC,
                    session_id: session_id.0,
                    sequence: U32::new(chunk.sequence),
                    flags: if chunk.is_final { FLAG_FINAL } else { 0 },
                    reserved: 0,
                    // Bounded by MAX_CHUNK_PAYLOAD, which the config validates.
                    length: U16::new(chunk.payload.len() as u16),
                };
                let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + chunk.payload.len());
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(&chunk.payload);
                out
            }
            Message::Ack {
                session_id,
                sequence,
            } => AckFrame {
                magic: ACK_MAGIC,
                session_id: session_id.0,
                sequence: U32::new(*sequence),
            }
            .as_bytes()
            .to_vec(),
            Message::DataEnd { session_id, reason } => {
                format!("{DATA_END_TAG}:{session_id}:{reason}").into_bytes()
            }
            Message::Abort { session_id, reason } => {
                format!("{ABORT_TAG}:{session_id}:{reason}").into_bytes()
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
        if bytes.is_empty() {
            return Err(WireError::Empty);
        }
        if bytes.starts_with(&CHUNK_MAGIC) {
            return decode_chunk(bytes);
        }
        if bytes.starts_with(&ACK_MAGIC) {
            return decode_ack(bytes);
        }

        let text = std::str::from_utf8(bytes).map_err(|_| WireError::UnknownMessage)?;

        if text == DISCOVER_TAG {
            return Ok(Message::Discover);
        }
        if text.starts_with(REPLY_NAME_PREFIX) {
            return PeerIdentity::parse_reply(text).map(Message::DiscoverReply);
        }
        if let Some(fields) = tagged(text, DATA_START_TAG) {
            return decode_data_start(fields);
        }
        if let Some(fields) = tagged(text, DATA_END_TAG) {
            let (session_id, reason) = decode_closing(fields)?;
            return Ok(Message::DataEnd { session_id, reason });
        }
        if let Some(fields) = tagged(text, ABORT_TAG) {
            let (session_id, reason) = decode_closing(fields)?;
            return Ok(Message::Abort { session_id, reason });
        }

        Err(WireError::UnknownMessage)
    }
}

/// Returns the text after `tag:` (or "" for the bare tag), or None when
/// `text` is some other message.
fn tagged<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(tag)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix(':')
    }
}

fn decode_data_start(fields: &str) -> Result<Message, WireError> {
    if fields.is_empty() {
        return Ok(Message::DataStart {
            session_id: None,
            total_bytes: None,
        });
    }
    let mut parts = fields.splitn(2, ':');
    let session_id = parts.next().map(SessionId::from_str).transpose()?;
    let total_bytes = parts
        .next()
        .map(|t| {
            t.parse::<u64>()
                .map_err(|_| WireError::InvalidLength(t.to_string()))
        })
        .transpose()?;
    Ok(Message::DataStart {
        session_id,
        total_bytes,
    })
}

/// `DATA_END` and `ABORT` share `[<sid>[:<reason>]]`. Reasons may contain ':'.
fn decode_closing(fields: &str) -> Result<(SessionId, String), WireError> {
    if fields.is_empty() {
        return Ok((SessionId::LEGACY, String::new()));
    }
    let (id, reason) = fields.split_once(':').unwrap_or((fields, ""));
    Ok((id.parse()?, reason.to_string()))
}

fn decode_chunk(bytes: &[u8]) -> Result<Message, WireError> {
    let header = ChunkHeader::read_from_prefix(bytes).ok_or(WireError::Truncated {
        expected: CHUNK_HEADER_LEN,
        actual: bytes.len(),
    })?;

    let flags = header.flags;
    if flags & !FLAG_FINAL != 0 {
        return Err(WireError::ReservedFlagsSet(flags));
    }

    let payload = &bytes[CHUNK_HEADER_LEN..];
    let length = header.length.get() as usize;
    if payload.len() != length {
        return Err(WireError::LengthMismatch {
            declared: length,
            actual: payload.len(),
        });
    }

    Ok(Message::Chunk {
        session_id: SessionId(header.session_id),
        chunk: Chunk {
            sequence: header.sequence.get(),
            payload: Bytes::copy_from_slice(payload),
            is_final: flags & FLAG_FINAL != 0,
        },
    })
}

fn decode_ack(bytes: &[u8]) -> Result<Message, WireError> {
    if bytes.len() != ACK_FRAME_LEN {
        return Err(WireError::Truncated {
            expected: ACK_FRAME_LEN,
            actual: bytes.len(),
        });
    }
    let frame = AckFrame::read_from(bytes).ok_or(WireError::Truncated {
        expected: ACK_FRAME_LEN,
        actual: bytes.len(),
    })?;
    Ok(Message::Ack {
        session_id: SessionId(frame.session_id),
        sequence: frame.sequence.get(),
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting a datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty datagram")]
    Empty,

    #[error("unrecognised message")]
    UnknownMessage,

    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("chunk declares {declared} payload bytes but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("invalid total length: {0:?}")]
    InvalidLength(String),

    #[error("malformed discovery reply: {0:?}")]
    MalformedReply(String),

    #[error("invalid address in discovery reply: {0:?}")]
    InvalidAddress(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
