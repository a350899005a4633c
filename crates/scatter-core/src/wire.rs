//! Scatter wire format — the datagram every peer exchanges.
//!
//! ```text
//! offset 0   : u32  checksum    = low32(FNV-1a-64(message_id ∥ payload))
//! offset 4   : u64  message_id  = (now_usec & 0xFFFF_FFFF) << 32 | rand32
//! offset 12  : u8   flags       bit 0 = ACK, bits 1-7 reserved
//! offset 13  : ..   payload     0..=MAX_PAYLOAD bytes
//! ```
//!
//! All integers are little-endian. The message_id bytes fed to the
//! checksum are the same 8 little-endian bytes that go on the wire.
//!
//! `resource_id` and `endpoint` are local routing hints. Neither is
//! transmitted; on receive `endpoint` is filled in with the sender.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rand::RngCore;

use crate::endpoint::Endpoint;
use crate::object_id::ObjectId;

pub const CHECKSUM_OFFSET: usize = 0;
pub const MESSAGE_ID_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 12;
pub const PAYLOAD_OFFSET: usize = 13;

/// Fixed prefix preceding every payload.
pub const HEADER_SIZE: usize = PAYLOAD_OFFSET;

/// Largest datagram any peer sends or accepts.
pub const MAX_MESSAGE_SIZE: usize = 8192;

/// Largest payload that fits in one datagram.
pub const MAX_PAYLOAD: usize = MAX_MESSAGE_SIZE - HEADER_SIZE;

/// Flag bit: this message acknowledges the message with the same id.
pub const FLAG_ACK: u8 = 0x01;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a 64-bit over a sequence of byte slices, as if concatenated.
pub fn fnv1a64(parts: &[&[u8]]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for part in parts {
        for byte in *part {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

/// Checksum carried at offset 0.
pub fn checksum(message_id: u64, payload: &[u8]) -> u32 {
    fnv1a64(&[&message_id.to_le_bytes(), payload]) as u32
}

/// Roughly time-ordered, collision-resistant message id.
pub fn new_message_id() -> u64 {
    let usec = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    ((usec & 0xFFFF_FFFF) << 32) | u64::from(rand::thread_rng().next_u32())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: u64,
    pub flags: u8,
    checksum: u32,
    pub payload: Bytes,
    /// Routing key for ring-addressed sends.
    pub resource_id: Option<ObjectId>,
    /// Explicit target on send, sender on receive.
    pub endpoint: Option<Endpoint>,
}

impl Message {
    /// A request routed by consistent hash of `resource_id`.
    pub fn to_resource(resource_id: ObjectId, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id: 0,
            flags: 0,
            checksum: 0,
            payload: payload.into(),
            resource_id: Some(resource_id),
            endpoint: None,
        }
    }

    /// A message for one specific peer.
    pub fn to_endpoint(endpoint: Endpoint, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id: 0,
            flags: 0,
            checksum: 0,
            payload: payload.into(),
            resource_id: None,
            endpoint: Some(endpoint),
        }
    }

    /// Acknowledge `request`, addressed back to whoever sent it.
    pub fn ack_for(request: &Message, payload: impl Into<Bytes>) -> Self {
        Self {
            message_id: request.message_id,
            flags: FLAG_ACK,
            checksum: 0,
            payload: payload.into(),
            resource_id: None,
            endpoint: request.endpoint,
        }
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Recompute the checksum over the current id and payload.
    pub fn seal(&mut self) {
        self.checksum = checksum(self.message_id, &self.payload);
    }

    pub fn check_checksum(&self) -> bool {
        self.checksum == checksum(self.message_id, &self.payload)
    }

    /// Serialize header and payload. The stored checksum is written as is;
    /// call `seal` first.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(self.payload.len()));
        }
        let mut buf = vec![0u8; HEADER_SIZE + self.payload.len()];
        buf[CHECKSUM_OFFSET..MESSAGE_ID_OFFSET].copy_from_slice(&self.checksum.to_le_bytes());
        buf[MESSAGE_ID_OFFSET..FLAGS_OFFSET].copy_from_slice(&self.message_id.to_le_bytes());
        buf[FLAGS_OFFSET] = self.flags;
        buf[PAYLOAD_OFFSET..].copy_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a received datagram. The checksum is read but not verified.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Undersized(buf.len()));
        }
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::PayloadTooLarge(buf.len() - HEADER_SIZE));
        }
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&buf[CHECKSUM_OFFSET..MESSAGE_ID_OFFSET]);
        let mut message_id = [0u8; 8];
        message_id.copy_from_slice(&buf[MESSAGE_ID_OFFSET..FLAGS_OFFSET]);
        Ok(Self {
            message_id: u64::from_le_bytes(message_id),
            flags: buf[FLAGS_OFFSET],
            checksum: u32::from_le_bytes(checksum),
            payload: Bytes::copy_from_slice(&buf[PAYLOAD_OFFSET..]),
            resource_id: None,
            endpoint: None,
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram of {0} bytes is shorter than the {HEADER_SIZE}-byte header")]
    Undersized(usize),

    #[error("payload length {0} exceeds maximum {MAX_PAYLOAD}")]
    PayloadTooLarge(usize),

    #[error("malformed work request: {0}")]
    MalformedRequest(&'static str),

    #[error("malformed work response: {0}")]
    MalformedResponse(&'static str),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
