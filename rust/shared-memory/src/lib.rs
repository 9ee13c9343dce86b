//! Studio Link - Shared Memory Module
//!
//! Duplex message transport between two processes over a pair of named
//! shared memory segments, one per direction, guarded by a cross-process
//! lock and polled by an [`Adapter`] on each side.

pub mod adapter;
pub mod error;
pub mod lock;
pub mod platform;
pub mod protocol;
pub mod region;

pub use adapter::{
    Adapter, AdapterMetricsSnapshot, MessageHandler, Outbox, ResetCause, TickOutcome,
};
pub use error::{Result, SharedMemoryError};
pub use lock::{CrossProcessGuard, CrossProcessLock};
pub use platform::PlatformUtils;
pub use protocol::{ReadReport, SegmentHeader, SegmentStats, SharedSegment};
pub use region::{RegionKind, SharedMemoryRegion};
