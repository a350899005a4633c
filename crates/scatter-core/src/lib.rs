//! scatter-core — shared value types, wire format, and configuration.
//! All other Scatter crates depend on this one.

pub mod config;
pub mod endpoint;
pub mod object_id;
pub mod wire;
pub mod work;

pub use endpoint::{Endpoint, EndpointError};
pub use object_id::{ObjectId, ObjectIdError};
pub use wire::{Message, WireError};
pub use work::{CommandCodec, TextCommands, WorkOutcome, WorkRequest};
