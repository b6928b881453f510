//! Contract with the underlying IIO access layer.
//!
//! The daemon treats the kernel-facing library as an external capability
//! behind these object-safe traits: create/destroy buffers and blocks,
//! enqueue/dequeue (blocking, honoring `cancel`), enable/disable, and
//! attribute access. The session core never caches pointers into kernel
//! memory: block data is only reachable through an owned [`IioBlock`],
//! and a block moves with its owner.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::mask::ChannelMask;

/// Which attribute namespace an attribute index resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrSource {
    /// Device-level attribute.
    Device,
    /// Debug attribute.
    Debug,
    /// Attribute of the buffer with the given index.
    Buffer(u16),
    /// Attribute of the channel with the given index.
    Channel(u16),
}

/// One hardware event record; exactly 16 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IioEvent {
    /// Event identifier (type, channel, direction packed by the kernel).
    pub id: u64,
    /// Event timestamp in nanoseconds.
    pub timestamp: i64,
}

impl IioEvent {
    /// Wire size of an event record.
    pub const WIRE_SIZE: usize = 16;

    /// Encode little-endian.
    #[must_use]
    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[..8].copy_from_slice(&self.id.to_le_bytes());
        out[8..].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    /// Decode little-endian.
    #[must_use]
    pub fn from_wire(raw: &[u8; Self::WIRE_SIZE]) -> Self {
        Self {
            id: u64::from_le_bytes(raw[..8].try_into().unwrap()),
            timestamp: i64::from_le_bytes(raw[8..].try_into().unwrap()),
        }
    }
}

/// A single IIO context (one per daemon instance).
pub trait IioContext: Send + Sync {
    /// Context name.
    fn name(&self) -> &str;

    /// The serialized, compressed context description served by `PRINT`.
    /// Serialization and compression happen outside the session core.
    fn description(&self) -> Bytes;

    /// Number of devices in the context.
    fn nb_devices(&self) -> usize;

    /// Device by index.
    fn device(&self, idx: usize) -> Option<Arc<dyn IioDevice>>;

    /// Set the kernel-side I/O deadline for this context.
    fn set_timeout(&self, timeout_ms: u32) -> Result<()>;
}

/// One device within the context.
pub trait IioDevice: Send + Sync {
    /// Stable device identifier (e.g. `iio:device0`).
    fn id(&self) -> &str;

    /// Index of this device in the context.
    fn index(&self) -> usize;

    /// Whether buffers on this device consume samples (TX) rather than
    /// produce them (RX).
    fn is_output(&self) -> bool;

    /// Number of scan channels.
    fn nb_channels(&self) -> usize;

    /// Bytes per sample for one channel.
    fn sample_size(&self, chn: usize) -> Result<usize>;

    /// Number of attributes in a namespace.
    fn nb_attrs(&self, src: AttrSource) -> usize;

    /// Read attribute `idx` of `src` into `dst`, returning the byte count.
    fn read_attr(&self, src: AttrSource, idx: u16, dst: &mut [u8]) -> Result<usize>;

    /// Write `data` to attribute `idx` of `src`, returning the byte count.
    fn write_attr(&self, src: AttrSource, idx: u16, data: &[u8]) -> Result<usize>;

    /// Index of the current trigger device, if any.
    fn trigger(&self) -> Result<Option<usize>>;

    /// Set or clear the trigger.
    fn set_trigger(&self, trigger: Option<usize>) -> Result<()>;

    /// Create the kernel sample buffer `idx` with the channels of `mask`
    /// enabled. The mask is rewritten in place to the set of channels the
    /// kernel actually honored.
    fn create_buffer(&self, idx: u16, mask: &mut ChannelMask) -> Result<Arc<dyn IioBuffer>>;

    /// Open an event stream on this device.
    fn create_event_stream(&self) -> Result<Arc<dyn IioEventStream>>;
}

/// A kernel sample buffer.
pub trait IioBuffer: Send + Sync {
    /// Start the kernel side of the buffer.
    fn enable(&self) -> Result<()>;

    /// Stop the kernel side of the buffer.
    fn disable(&self) -> Result<()>;

    /// Unblock any pending dequeue; later enqueue/dequeue calls fail.
    fn cancel(&self);

    /// Allocate a block of `size` bytes backed by this buffer.
    fn create_block(&self, size: usize) -> Result<Box<dyn IioBlock>>;
}

/// A fixed-size transfer block owned by a buffer.
pub trait IioBlock: Send {
    /// Allocated size in bytes.
    fn capacity(&self) -> usize;

    /// The block's memory.
    fn data(&mut self) -> &mut [u8];

    /// Hand the block to the kernel for one transfer.
    fn enqueue(&mut self, bytes_used: usize, cyclic: bool) -> Result<()>;

    /// Wait for the kernel to complete the transfer; returns the number of
    /// valid bytes. Blocks until completion, buffer cancellation, or the
    /// context timeout.
    fn dequeue(&mut self) -> Result<usize>;
}

/// An asynchronous hardware event stream.
pub trait IioEventStream: Send + Sync {
    /// Read one event. With `nonblock` the call returns `WouldBlock`
    /// instead of waiting.
    fn read_event(&self, nonblock: bool) -> Result<IioEvent>;

    /// Unblock a pending read; later reads fail with `Cancelled`.
    fn cancel(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_round_trip() {
        let ev = IioEvent {
            id: 0x0102_0304_0506_0708,
            timestamp: -42,
        };
        let wire = ev.to_wire();
        assert_eq!(wire.len(), 16);
        assert_eq!(IioEvent::from_wire(&wire), ev);
        // Little-endian: low byte of id first.
        assert_eq!(wire[0], 0x08);
    }
}
