//! Studio Link
//!
//! Duplex message link between an editor process and the host process it
//! inspects, carried over a pair of shared memory segments.
//!
//! The codec and configuration live in [`studio_link_core`], the transport
//! in [`studio_link_shm`]; this crate re-exports both and holds the command
//! line tool.

pub mod cli;

pub use studio_link_core;
pub use studio_link_shm;

pub use studio_link_core::{
    AdapterConfig, Backing, CodecError, Decode, Encode, MessageKind, PayloadReader, PayloadWriter,
    Role, Shape, Value,
};
pub use studio_link_shm::{Adapter, MessageHandler, Outbox, SharedMemoryError};
