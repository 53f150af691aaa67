//! Opaque 64-bit handles used across the engine.
//!
//! Every handle packs a slot index into the low 32 bits and a generation tag
//! into the high 32 bits. Allocators bump the generation whenever a slot is
//! reused, so a handle held past the death of its referent no longer matches
//! the slot and is rejected instead of silently aliasing the new occupant.

use std::fmt::{Debug, Display, Formatter};

macro_rules! versioned_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Never-allocated sentinel (generation zero is reserved).
            pub const NIL: $name = $name(0);

            pub const fn is_nil(self) -> bool {
                self.0 == 0
            }

            pub const fn from_parts(index: u32, generation: u32) -> Self {
                Self(((generation as u64) << 32) | index as u64)
            }

            pub const fn from_u64(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn as_u64(self) -> u64 {
                self.0
            }

            pub const fn index(self) -> u32 {
                self.0 as u32
            }

            pub const fn generation(self) -> u32 {
                (self.0 >> 32) as u32
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}v{}", $prefix, self.index(), self.generation())
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                Display::fmt(self, f)
            }
        }
    };
}

versioned_id!(
    /// Handle of a node record in the node pool.
    NodeId,
    "n"
);
versioned_id!(
    /// Handle of a dataflow graph instance.
    DagId,
    "g"
);
versioned_id!(
    /// Handle of a tenant session. Sessions own disjoint sets of dags.
    SessionId,
    "s"
);
versioned_id!(
    /// Handle of a registered input stream.
    StreamId,
    "st"
);
versioned_id!(
    /// Handle of a broker subscription.
    SubscriptionId,
    "sub"
);

/// Monotonic per-producer message sequence number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct MessageSeq(pub u64);

impl MessageSeq {
    pub fn next(&mut self) -> MessageSeq {
        let current = *self;
        self.0 += 1;
        current
    }
}

impl Display for MessageSeq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_parts() {
        let id = NodeId::from_parts(42, 7);
        assert_eq!(id.index(), 42);
        assert_eq!(id.generation(), 7);
        assert_eq!(NodeId::from_u64(id.as_u64()), id);
    }

    #[test]
    fn generation_distinguishes_reused_slots() {
        let old = NodeId::from_parts(3, 1);
        let new = NodeId::from_parts(3, 2);
        assert_ne!(old, new);
        assert_eq!(old.index(), new.index());
    }

    #[test]
    fn seq_is_monotonic() {
        let mut seq = MessageSeq::default();
        assert_eq!(seq.next(), MessageSeq(0));
        assert_eq!(seq.next(), MessageSeq(1));
    }
}
