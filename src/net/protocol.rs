//! Wire protocol
//!
//! Cleartext framed TCP for trusted private networks. Big-endian throughout.
//! Handshake first, then `MSG_TYPE(1) | LENGTH(4) | PAYLOAD` frames in both
//! directions. A DP entry is exactly 68 bytes: x(32) dist(24) kidx(8) pad(4);
//! the herd never travels; `kidx & 1` carries it.

use std::fmt;
use std::io::{self, Read, Write};

use crate::types::{ClientId, Dist, Dp, XCoord, DIST_BYTES, X_BYTES};

/// "KANG"
pub const MAGIC: u32 = 0x4B41_4E47;
pub const VERSION: u16 = 1;
/// Wire size of one DP entry.
pub const DP_WIRE_BYTES: usize = 68;
/// Largest DP_BATCH count a peer may send.
pub const MAX_BATCH: usize = 4096;
const MAX_FRAME: u32 = (4 + DP_WIRE_BYTES * MAX_BATCH) as u32;

const MSG_DP_BATCH: u8 = 0x01;
const MSG_DP_ACK: u8 = 0x02;
const MSG_PING: u8 = 0x03;
const MSG_RANGE_REASSIGN: u8 = 0x04;
const MSG_RESET_KANGAROO: u8 = 0x05;
const MSG_STOP: u8 = 0x06;
const MSG_STATS: u8 = 0x07;

/// Protocol failure. `Io` maps to exit code 2, the rest to exit code 3.
#[derive(Debug)]
pub enum ProtocolError {
    Io(io::Error),
    BadMagic(u32),
    BadVersion(u16),
    BadType(u8),
    BadLength { msg_type: u8, len: u32 },
    Rejected,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Io(e) => write!(f, "i/o failure: {e}"),
            ProtocolError::BadMagic(m) => write!(f, "bad magic 0x{m:08x}"),
            ProtocolError::BadVersion(v) => write!(f, "unsupported protocol version {v}"),
            ProtocolError::BadType(t) => write!(f, "unknown message type 0x{t:02x}"),
            ProtocolError::BadLength { msg_type, len } => {
                write!(f, "impossible length {len} for message 0x{msg_type:02x}")
            }
            ProtocolError::Rejected => write!(f, "server rejected the handshake"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// First bytes a worker sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHello {
    pub client_id: ClientId,
    pub interval_bits: u8,
}

/// Server reply carrying the search parameters and the assigned range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHello {
    pub accepted: bool,
    pub dp_bits: u8,
    pub target_x: [u8; 32],
    pub target_y: [u8; 32],
    pub wild_offset: [u8; 32],
    pub range_start: [u8; 32],
    pub range_end: [u8; 32],
}

/// Steady-state framed messages, both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    DpBatch(Vec<Dp>),
    DpAck { last_sequence: u64 },
    Ping { timestamp: u64 },
    RangeReassign { start: [u8; 32], end: [u8; 32] },
    ResetKangaroo { kidx: u64 },
    Stop { found_key: [u8; 32] },
    Stats { pushed: u64, popped: u64, ops_count: u64 },
}

pub fn write_client_hello<W: Write>(w: &mut W, hello: &ClientHello) -> Result<()> {
    let mut buf = Vec::with_capacity(4 + 2 + 16 + 1);
    buf.extend_from_slice(&MAGIC.to_be_bytes());
    buf.extend_from_slice(&VERSION.to_be_bytes());
    buf.extend_from_slice(&hello.client_id.0);
    buf.push(hello.interval_bits);
    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

pub fn read_client_hello<R: Read>(r: &mut R) -> Result<ClientHello> {
    check_preamble(r)?;
    let mut id = [0u8; 16];
    r.read_exact(&mut id)?;
    let mut n = [0u8; 1];
    r.read_exact(&mut n)?;
    Ok(ClientHello {
        client_id: ClientId(id),
        interval_bits: n[0],
    })
}

pub fn write_server_hello<W: Write>(w: &mut W, hello: &ServerHello) -> Result<()> {
    let mut buf = Vec::with_capacity(4 + 2 + 2 + 32 * 5);
    buf.extend_from_slice(&MAGIC.to_be_bytes());
    buf.extend_from_slice(&VERSION.to_be_bytes());
    buf.push(hello.accepted as u8);
    buf.push(hello.dp_bits);
    buf.extend_from_slice(&hello.target_x);
    buf.extend_from_slice(&hello.target_y);
    buf.extend_from_slice(&hello.wild_offset);
    buf.extend_from_slice(&hello.range_start);
    buf.extend_from_slice(&hello.range_end);
    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

pub fn read_server_hello<R: Read>(r: &mut R) -> Result<ServerHello> {
    check_preamble(r)?;
    let mut head = [0u8; 2];
    r.read_exact(&mut head)?;
    let mut hello = ServerHello {
        accepted: head[0] != 0,
        dp_bits: head[1],
        target_x: [0; 32],
        target_y: [0; 32],
        wild_offset: [0; 32],
        range_start: [0; 32],
        range_end: [0; 32],
    };
    r.read_exact(&mut hello.target_x)?;
    r.read_exact(&mut hello.target_y)?;
    r.read_exact(&mut hello.wild_offset)?;
    r.read_exact(&mut hello.range_start)?;
    r.read_exact(&mut hello.range_end)?;
    Ok(hello)
}

fn check_preamble<R: Read>(r: &mut R) -> Result<()> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    let magic = u32::from_be_bytes(magic);
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let mut version = [0u8; 2];
    r.read_exact(&mut version)?;
    let version = u16::from_be_bytes(version);
    if version != VERSION {
        return Err(ProtocolError::BadVersion(version));
    }
    Ok(())
}

fn encode_dp(buf: &mut Vec<u8>, dp: &Dp) {
    buf.extend_from_slice(&dp.x.to_be_bytes());
    buf.extend_from_slice(&dp.dist.to_be_bytes());
    buf.extend_from_slice(&dp.kidx.to_be_bytes());
    buf.extend_from_slice(&[0u8; 4]);
}

fn decode_dp(bytes: &[u8]) -> Dp {
    debug_assert_eq!(bytes.len(), DP_WIRE_BYTES);
    let mut x = [0u8; X_BYTES];
    x.copy_from_slice(&bytes[0..32]);
    let mut dist = [0u8; DIST_BYTES];
    dist.copy_from_slice(&bytes[32..56]);
    let mut kidx = [0u8; 8];
    kidx.copy_from_slice(&bytes[56..64]);
    Dp {
        x: XCoord::from_be_bytes(&x),
        dist: Dist::from_be_bytes(&dist),
        kidx: u64::from_be_bytes(kidx),
    }
}

/// Serialize a message to one frame.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let (msg_type, payload) = match msg {
        Message::DpBatch(dps) => {
            let mut p = Vec::with_capacity(4 + DP_WIRE_BYTES * dps.len());
            p.extend_from_slice(&(dps.len() as u32).to_be_bytes());
            for dp in dps {
                encode_dp(&mut p, dp);
            }
            (MSG_DP_BATCH, p)
        }
        Message::DpAck { last_sequence } => (MSG_DP_ACK, last_sequence.to_be_bytes().to_vec()),
        Message::Ping { timestamp } => (MSG_PING, timestamp.to_be_bytes().to_vec()),
        Message::RangeReassign { start, end } => {
            let mut p = Vec::with_capacity(64);
            p.extend_from_slice(start);
            p.extend_from_slice(end);
            (MSG_RANGE_REASSIGN, p)
        }
        Message::ResetKangaroo { kidx } => (MSG_RESET_KANGAROO, kidx.to_be_bytes().to_vec()),
        Message::Stop { found_key } => (MSG_STOP, found_key.to_vec()),
        Message::Stats {
            pushed,
            popped,
            ops_count,
        } => {
            let mut p = Vec::with_capacity(24);
            p.extend_from_slice(&pushed.to_be_bytes());
            p.extend_from_slice(&popped.to_be_bytes());
            p.extend_from_slice(&ops_count.to_be_bytes());
            (MSG_STATS, p)
        }
    };
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(msg_type);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

pub fn write_message<W: Write>(w: &mut W, msg: &Message) -> Result<()> {
    w.write_all(&encode_message(msg))?;
    w.flush()?;
    Ok(())
}

pub fn read_message<R: Read>(r: &mut R) -> Result<Message> {
    let mut head = [0u8; 5];
    r.read_exact(&mut head)?;
    let msg_type = head[0];
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]);
    if len > MAX_FRAME {
        return Err(ProtocolError::BadLength { msg_type, len });
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    parse_payload(msg_type, &payload)
}

fn parse_payload(msg_type: u8, payload: &[u8]) -> Result<Message> {
    let bad_len = || ProtocolError::BadLength {
        msg_type,
        len: payload.len() as u32,
    };
    match msg_type {
        MSG_DP_BATCH => {
            if payload.len() < 4 {
                return Err(bad_len());
            }
            let count = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            if count as usize > MAX_BATCH
                || payload.len() != 4 + DP_WIRE_BYTES * count as usize
            {
                return Err(bad_len());
            }
            let dps = payload[4..]
                .chunks_exact(DP_WIRE_BYTES)
                .map(decode_dp)
                .collect();
            Ok(Message::DpBatch(dps))
        }
        MSG_DP_ACK => {
            if payload.len() != 8 {
                return Err(bad_len());
            }
            Ok(Message::DpAck {
                last_sequence: u64_field(payload, 0),
            })
        }
        MSG_PING => {
            if payload.len() != 8 {
                return Err(bad_len());
            }
            Ok(Message::Ping {
                timestamp: u64_field(payload, 0),
            })
        }
        MSG_RANGE_REASSIGN => {
            if payload.len() != 64 {
                return Err(bad_len());
            }
            let mut start = [0u8; 32];
            let mut end = [0u8; 32];
            start.copy_from_slice(&payload[0..32]);
            end.copy_from_slice(&payload[32..64]);
            Ok(Message::RangeReassign { start, end })
        }
        MSG_RESET_KANGAROO => {
            if payload.len() != 8 {
                return Err(bad_len());
            }
            Ok(Message::ResetKangaroo {
                kidx: u64_field(payload, 0),
            })
        }
        MSG_STOP => {
            if payload.len() != 32 {
                return Err(bad_len());
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(payload);
            Ok(Message::Stop { found_key: key })
        }
        MSG_STATS => {
            if payload.len() != 24 {
                return Err(bad_len());
            }
            Ok(Message::Stats {
                pushed: u64_field(payload, 0),
                popped: u64_field(payload, 8),
                ops_count: u64_field(payload, 16),
            })
        }
        other => Err(ProtocolError::BadType(other)),
    }
}

fn u64_field(payload: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&payload[offset..offset + 8]);
    u64::from_be_bytes(buf)
}
