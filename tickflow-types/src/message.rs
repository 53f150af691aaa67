//! The fixed-size message envelope carried between nodes.
//!
//! A `Message` is exactly one cache line. Ownership across the broker
//! boundary is by copy, so producer and consumer never share mutable state.
//! Payloads that fit the inline window are carried in place; larger payloads
//! are parked in the producing node's arena and referenced by an
//! [`ArenaHandle`] stamped with the slot generation.

use bytemuck::{Pod, Zeroable};

use crate::ids::MessageSeq;

/// Cache line size the message layout is built around.
pub const CACHE_LINE: usize = 64;

/// Bytes available for an inline payload.
pub const INLINE_PAYLOAD: usize = 36;

/// Destination hint meaning "every subscribed port".
pub const BROADCAST_PORT: u16 = 0xffff;

/// Payload discriminant. Values below [`TypeTag::USER_BASE`] are reserved for
/// the built-in kinds; the rest of the u8 space is user-defined.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct TypeTag(pub u8);

unsafe impl Zeroable for TypeTag {}
unsafe impl Pod for TypeTag {}

impl TypeTag {
    pub const TICK: TypeTag = TypeTag(0);
    pub const BAR: TypeTag = TypeTag(1);
    pub const CONTROL: TypeTag = TypeTag(2);
    pub const BATCH: TypeTag = TypeTag(3);
    pub const SYNC: TypeTag = TypeTag(4);
    pub const INTERP: TypeTag = TypeTag(5);
    /// Matches any tag during schema checks.
    pub const ANY: TypeTag = TypeTag(0xfe);

    pub const USER_BASE: u8 = 0x10;

    pub const fn user(n: u8) -> TypeTag {
        TypeTag(Self::USER_BASE + n)
    }

    pub fn accepts(self, other: TypeTag) -> bool {
        self == TypeTag::ANY || other == TypeTag::ANY || self == other
    }
}

/// Message flag bits.
pub mod flags {
    /// Payload holds an [`super::ArenaHandle`] instead of inline bytes.
    pub const ARENA: u8 = 0b0000_0001;
    /// Synchronized event produced for a gap, filled or sentinel.
    pub const GAP_FILL: u8 = 0b0000_0010;
    /// Sentinel emitted in place of a dropped follower value.
    pub const SENTINEL: u8 = 0b0000_0100;
}

/// Reference into a producing node's payload arena: slot index plus the
/// generation observed at write time. The referent is valid until the owning
/// node's next emission reuses the slot; consumers copy before then and
/// detect late reads by generation mismatch.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct ArenaHandle {
    pub slot: u32,
    pub generation: u32,
}

/// Raised when a payload does not fit the inline window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("payload of {0} bytes exceeds the {INLINE_PAYLOAD}-byte inline window")]
pub struct PayloadTooLarge(pub usize);

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(C, align(64))]
pub struct Message {
    /// Raw bits of the emitting node's `NodeId`; zero for external producers.
    pub source: u64,
    /// Monotonic per-producer sequence.
    pub seq: u64,
    /// Wall or exchange timestamp, nanoseconds.
    pub timestamp_ns: u64,
    pub kind: TypeTag,
    pub flags: u8,
    /// Destination hint: an input port, or [`BROADCAST_PORT`].
    pub port: u16,
    pub payload: [u8; INLINE_PAYLOAD],
}

// Field order keeps every field naturally aligned with zero implicit padding,
// which is what makes the manual Pod impl below sound.
const _: () = assert!(std::mem::size_of::<Message>() == CACHE_LINE);
const _: () = assert!(std::mem::align_of::<Message>() == CACHE_LINE);

unsafe impl Zeroable for Message {}
unsafe impl Pod for Message {}

impl Message {
    pub fn new(kind: TypeTag, timestamp_ns: u64) -> Message {
        Message {
            source: 0,
            seq: 0,
            timestamp_ns,
            kind,
            flags: 0,
            port: BROADCAST_PORT,
            payload: [0; INLINE_PAYLOAD],
        }
    }

    /// Builds a message with `bytes` copied into the inline window.
    pub fn with_payload(
        kind: TypeTag,
        timestamp_ns: u64,
        bytes: &[u8],
    ) -> Result<Message, PayloadTooLarge> {
        let mut message = Message::new(kind, timestamp_ns);
        message.write_payload(bytes)?;
        Ok(message)
    }

    /// Builds a message carrying an arena reference in place of inline bytes.
    pub fn with_arena(kind: TypeTag, timestamp_ns: u64, handle: ArenaHandle) -> Message {
        let mut message = Message::new(kind, timestamp_ns);
        message.flags |= flags::ARENA;
        message.payload[..std::mem::size_of::<ArenaHandle>()]
            .copy_from_slice(bytemuck::bytes_of(&handle));
        message
    }

    pub fn write_payload(&mut self, bytes: &[u8]) -> Result<(), PayloadTooLarge> {
        if bytes.len() > INLINE_PAYLOAD {
            return Err(PayloadTooLarge(bytes.len()));
        }
        self.payload[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Reinterprets the front of the payload as a POD value.
    pub fn payload_as<T: Pod>(&self) -> Option<&T> {
        let size = std::mem::size_of::<T>();
        if size > INLINE_PAYLOAD {
            return None;
        }
        bytemuck::try_from_bytes(&self.payload[..size]).ok()
    }

    pub fn arena_handle(&self) -> Option<ArenaHandle> {
        if self.flags & flags::ARENA == 0 {
            return None;
        }
        self.payload_as::<ArenaHandle>().copied()
    }

    pub fn is_sentinel(&self) -> bool {
        self.flags & flags::SENTINEL != 0
    }

    pub fn stamp(&mut self, source: u64, seq: MessageSeq) {
        self.source = source;
        self.seq = seq.0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}
