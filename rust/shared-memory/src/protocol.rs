//! Shared segment framing
//!
//! Byte layout of one segment, all integers little-endian:
//!
//! ```text
//! [u32 write_offset][u8 message_count][kind u8, payload]...
//! ```
//!
//! `write_offset` is relative to the first message. Payloads carry no
//! length prefix: the reader learns where a message ends by decoding it.
//! Nothing is ever written past `capacity - safety_margin`.

use crate::region::SharedMemoryRegion;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use studio_link_core::codec::PayloadReader;
use studio_link_core::{AdapterConfig, CodecError, MessageKind, HEADER_SIZE};
use tracing::{error, trace};

/// Decoded segment header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub write_offset: u32,
    pub message_count: u8,
}

impl SegmentHeader {
    pub fn parse(bytes: &[u8]) -> Self {
        let mut offset = [0u8; 4];
        offset.copy_from_slice(&bytes[..4]);
        Self {
            write_offset: u32::from_le_bytes(offset),
            message_count: bytes[4],
        }
    }

    pub fn store(&self, bytes: &mut [u8]) {
        bytes[..4].copy_from_slice(&self.write_offset.to_le_bytes());
        bytes[4] = self.message_count;
    }
}

/// Outcome of draining a segment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadReport {
    /// Messages handed to the visitor
    pub delivered: usize,
    /// Why reading stopped early on damaged data
    pub corruption: Option<String>,
    /// The visitor asked to stop
    pub interrupted: bool,
}

/// Point-in-time view of a segment, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentStats {
    pub name: String,
    pub capacity: usize,
    pub write_offset: u32,
    pub message_count: u8,
    pub free_bytes: usize,
    pub max_messages: usize,
}

/// One direction of traffic
#[derive(Debug)]
pub struct SharedSegment {
    region: SharedMemoryRegion,
    capacity: usize,
    max_offset: usize,
    max_messages: usize,
}

impl SharedSegment {
    /// Map the named segment. The header is left as found; callers zero it
    /// with [`reset_header`](Self::reset_header) while holding the lock.
    pub fn open(name: &str, config: &AdapterConfig) -> Result<Self> {
        let region = SharedMemoryRegion::open_or_create(name, config.capacity, config.backing)?;
        Ok(Self::from_region(region, config))
    }

    pub fn from_region(region: SharedMemoryRegion, config: &AdapterConfig) -> Self {
        let capacity = config.capacity.min(region.len());
        Self {
            region,
            capacity,
            max_offset: capacity.saturating_sub(config.safety_margin),
            max_messages: config.max_messages.min(u8::MAX as usize),
        }
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn read_header(&self) -> SegmentHeader {
        SegmentHeader::parse(self.region.as_slice())
    }

    fn write_header(&mut self, header: SegmentHeader) {
        header.store(self.region.as_slice_mut());
    }

    /// Mark the segment empty so the writer can start over
    pub fn reset_header(&mut self) {
        self.write_header(SegmentHeader::default());
    }

    /// Walk up to `limit` stored messages in write order.
    ///
    /// The visitor gets each message's kind and a reader positioned at its
    /// payload. It must consume exactly that payload, since the next message
    /// starts wherever it stops. A `None` kind, a read past the last written
    /// byte or a decode error ends the walk and is reported as corruption.
    pub fn read_messages<F>(&self, limit: usize, mut visitor: F) -> ReadReport
    where
        F: FnMut(MessageKind, &mut PayloadReader<'_>) -> std::result::Result<ControlFlow<()>, CodecError>,
    {
        let header = self.read_header();
        let mut report = ReadReport::default();

        let declared = (header.message_count as usize).min(limit);
        if declared == 0 {
            return report;
        }

        let end = (HEADER_SIZE + header.write_offset as usize).min(self.max_offset);
        let data = &self.region.as_slice()[HEADER_SIZE..end.max(HEADER_SIZE)];
        let mut cursor = 0;

        while report.delivered < declared {
            if cursor >= data.len() {
                report.corruption = Some(format!(
                    "{} of {} messages fit before offset {}",
                    report.delivered, header.message_count, header.write_offset
                ));
                break;
            }

            let kind = MessageKind(data[cursor]);
            if kind == MessageKind::NONE {
                report.corruption = Some(format!("None kind at offset {}", cursor));
                break;
            }

            let mut reader = PayloadReader::new(&data[cursor + 1..]);
            let flow = visitor(kind, &mut reader);
            cursor += 1 + reader.position();

            match flow {
                Ok(ControlFlow::Continue(())) => {
                    report.delivered += 1;
                    trace!("Read {} from {}", kind, self.name());
                }
                Ok(ControlFlow::Break(())) => {
                    report.delivered += 1;
                    report.interrupted = true;
                    break;
                }
                Err(err) => {
                    report.corruption = Some(format!("message {} ({}): {}", report.delivered, kind, err));
                    break;
                }
            }
        }

        if let Some(reason) = &report.corruption {
            error!(
                "Corrupt segment {}, discarding remaining messages: {}",
                self.name(),
                reason
            );
        }

        report
    }

    /// Append one message. Returns `false` without touching the segment when
    /// it would exceed the message cap or cross the safety margin.
    pub fn append_message(&mut self, kind: MessageKind, payload: &[u8]) -> bool {
        let header = self.read_header();
        if header.message_count as usize >= self.max_messages {
            return false;
        }

        let start = HEADER_SIZE + header.write_offset as usize;
        let end = start + 1 + payload.len();
        if end > self.max_offset {
            return false;
        }

        let bytes = self.region.as_slice_mut();
        bytes[start] = kind.as_u8();
        bytes[start + 1..end].copy_from_slice(payload);

        self.write_header(SegmentHeader {
            write_offset: (end - HEADER_SIZE) as u32,
            message_count: header.message_count + 1,
        });
        true
    }

    pub fn stats(&self) -> SegmentStats {
        let header = self.read_header();
        let used = HEADER_SIZE + header.write_offset as usize;
        SegmentStats {
            name: self.name().to_string(),
            capacity: self.capacity,
            write_offset: header.write_offset,
            message_count: header.message_count,
            free_bytes: self.max_offset.saturating_sub(used),
            max_messages: self.max_messages,
        }
    }
}
