//! Object identifiers for the content-addressable store.
//!
//! An id is 64 lowercase hex characters. Temporary objects use the same
//! length with a leading `t` in place of the first hex digit. Ids double
//! as the consistent-hash routing key for work items, so two requests
//! naming the same input land on the same worker.
//!
//! On-disk and remote layout splits the id into four segments:
//!   {id[0..2]}/{id[2..4]}/{id[4..6]}/{id[6..]}

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Length of an id in ASCII characters.
pub const OBJECT_ID_LEN: usize = 64;

/// Leading byte marking an ephemeral object.
pub const TEMP_MARKER: u8 = b't';

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

const fn well_known(last: u8) -> ObjectId {
    let mut bytes = [b'0'; OBJECT_ID_LEN];
    bytes[OBJECT_ID_LEN - 1] = last;
    ObjectId(bytes)
}

impl ObjectId {
    /// Newline-separated list of client endpoints.
    pub const CLIENT_PEER_LIST: ObjectId = well_known(b'1');

    /// Newline-separated list of worker endpoints.
    pub const WORKER_PEER_LIST: ObjectId = well_known(b'2');

    /// A fresh id from 256 random bits.
    pub fn random() -> Self {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        Self::from_digest(&raw)
    }

    /// A fresh id for an object nobody else will ever look up by content.
    pub fn temporary() -> Self {
        let mut id = Self::random();
        id.0[0] = TEMP_MARKER;
        id
    }

    /// Deterministic output id for running `command` over `input`.
    ///
    ///   id = hex(SHA-256(input ∥ command))
    ///
    /// Re-running identical work names the same output object.
    pub fn derive(input: &ObjectId, command: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(input.0);
        hasher.update(command);
        let digest: [u8; 32] = hasher.finalize().into();
        Self::from_digest(&digest)
    }

    fn from_digest(digest: &[u8; 32]) -> Self {
        let mut bytes = [0u8; OBJECT_ID_LEN];
        // hex::encode_to_slice only fails on a length mismatch, and 32 * 2 == 64.
        let _ = hex::encode_to_slice(digest, &mut bytes);
        Self(bytes)
    }

    /// Parse an id from its on-wire ASCII bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ObjectIdError> {
        if bytes.len() != OBJECT_ID_LEN {
            return Err(ObjectIdError::Length(bytes.len()));
        }
        let body = if bytes[0] == TEMP_MARKER {
            &bytes[1..]
        } else {
            bytes
        };
        if let Some(pos) = body.iter().position(|b| !is_lower_hex(*b)) {
            let offset = OBJECT_ID_LEN - body.len() + pos;
            return Err(ObjectIdError::InvalidChar(bytes[offset] as char, offset));
        }
        let mut id = [0u8; OBJECT_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Construction guarantees ASCII.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }

    pub fn is_temporary(&self) -> bool {
        self.0[0] == TEMP_MARKER
    }

    /// Path segments bounding directory fan-out to 256 entries per level.
    pub fn path_segments(&self) -> [&str; 4] {
        let s = self.as_str();
        [&s[0..2], &s[2..4], &s[4..6], &s[6..]]
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.as_str()[..16]
    }
}

fn is_lower_hex(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.as_str())
    }
}

impl FromStr for ObjectId {
    type Err = ObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.trim().as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectIdError {
    #[error("object id must be {OBJECT_ID_LEN} characters, got {0}")]
    Length(usize),

    #[error("invalid character {0:?} at offset {1} in object id")]
    InvalidChar(char, usize),
}
