//! Work item payloads carried inside `Message`s.
//!
//! Request:  resource_id (64 bytes) ∥ 0x00 ∥ command ∥ 0x00
//! Response: result flag (1 byte)   ∥ output_id (64 bytes) ∥ 0x00   when flag = 0
//!           result flag (1 byte)   ∥ error text           ∥ 0x00   when flag = 1
//!
//! A response always travels as the ACK of its request, so the request id
//! is the message id and is not repeated in the payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::object_id::{ObjectId, OBJECT_ID_LEN};
use crate::wire::WireError;

pub const RESULT_OK: u8 = 0;
pub const RESULT_ERROR: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRequest {
    pub resource_id: ObjectId,
    pub command: Bytes,
}

impl WorkRequest {
    pub fn new(resource_id: ObjectId, command: impl Into<Bytes>) -> Self {
        Self {
            resource_id,
            command: command.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.command.contains(&0) {
            return Err(WireError::MalformedRequest("command contains a NUL byte"));
        }
        let mut buf = BytesMut::with_capacity(OBJECT_ID_LEN + self.command.len() + 2);
        buf.put_slice(self.resource_id.as_bytes());
        buf.put_u8(0);
        buf.put_slice(&self.command);
        buf.put_u8(0);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < OBJECT_ID_LEN + 2 {
            return Err(WireError::MalformedRequest("too short"));
        }
        if payload[OBJECT_ID_LEN] != 0 {
            return Err(WireError::MalformedRequest("resource id not NUL-terminated"));
        }
        let (body, last) = payload.split_at(payload.len() - 1);
        if last[0] != 0 {
            return Err(WireError::MalformedRequest("command not NUL-terminated"));
        }
        let command = &body[OBJECT_ID_LEN + 1..];
        if command.contains(&0) {
            return Err(WireError::MalformedRequest("command contains a NUL byte"));
        }
        let resource_id = ObjectId::from_bytes(&payload[..OBJECT_ID_LEN])
            .map_err(|_| WireError::MalformedRequest("invalid resource id"))?;
        Ok(Self {
            resource_id,
            command: Bytes::copy_from_slice(command),
        })
    }
}

/// What a worker reports back for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// The handler wrote its result under this id.
    Done(ObjectId),
    /// The request was malformed or the handler failed.
    Failed(String),
}

impl WorkOutcome {
    pub fn encode(&self) -> Bytes {
        match self {
            WorkOutcome::Done(id) => {
                let mut buf = BytesMut::with_capacity(OBJECT_ID_LEN + 2);
                buf.put_u8(RESULT_OK);
                buf.put_slice(id.as_bytes());
                buf.put_u8(0);
                buf.freeze()
            }
            WorkOutcome::Failed(text) => {
                // Interior NULs would truncate the text on the far side.
                let text = text.replace('\0', " ");
                let mut buf = BytesMut::with_capacity(text.len() + 2);
                buf.put_u8(RESULT_ERROR);
                buf.put_slice(text.as_bytes());
                buf.put_u8(0);
                buf.freeze()
            }
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < 2 {
            return Err(WireError::MalformedResponse("too short"));
        }
        if payload[payload.len() - 1] != 0 {
            return Err(WireError::MalformedResponse("not NUL-terminated"));
        }
        let body = &payload[1..payload.len() - 1];
        match payload[0] {
            RESULT_OK => ObjectId::from_bytes(body)
                .map(WorkOutcome::Done)
                .map_err(|_| WireError::MalformedResponse("invalid output id")),
            RESULT_ERROR => Ok(WorkOutcome::Failed(
                String::from_utf8_lossy(body).into_owned(),
            )),
            _ => Err(WireError::MalformedResponse("unknown result flag")),
        }
    }
}

/// Encoder/decoder for whatever command language the workers execute.
///
/// The dispatch layer treats commands as opaque bytes; implementations
/// live with the engine that interprets them.
pub trait CommandCodec {
    type Command;

    fn encode_command(&self, command: &Self::Command) -> Result<Bytes, WireError>;

    fn decode_command(&self, bytes: &[u8]) -> Result<Self::Command, WireError>;
}

/// Commands that are plain UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCommands;

impl CommandCodec for TextCommands {
    type Command = String;

    fn encode_command(&self, command: &String) -> Result<Bytes, WireError> {
        if command.contains('\0') {
            return Err(WireError::MalformedRequest("command contains a NUL byte"));
        }
        Ok(Bytes::copy_from_slice(command.as_bytes()))
    }

    fn decode_command(&self, bytes: &[u8]) -> Result<String, WireError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|_| WireError::MalformedRequest("command is not UTF-8"))
    }
}
