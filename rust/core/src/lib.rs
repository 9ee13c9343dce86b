//! Studio Link - Core Module
//!
//! Payload codec, message kinds, roles and configuration shared by both
//! ends of the link. Nothing here touches the operating system; the
//! transport lives in `studio-link-shm`.

pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod shape;

pub use codec::{decode, encode, Decode, Encode, Enum, PayloadReader, PayloadWriter, Vec2, WireEnum};
pub use config::{AdapterConfig, Backing, HEADER_SIZE};
pub use error::{CodecError, ConfigError, Result};
pub use message::{MessageKind, Role, PROTOCOL_VERSION};
pub use shape::{Shape, Value};
