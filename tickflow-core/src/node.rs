//! The processing-unit contract: the boundary between the engine core and
//! the behaviors it schedules.

use std::fmt::Debug;

use tickflow_types::ids::{DagId, NodeId};
use tickflow_types::market::Tick;
use tickflow_types::message::{ArenaHandle, Message, TypeTag};

use crate::OutputChannelForwarder;

pub type PortHandle = u16;

/// The conventional single port of one-in/one-out units. Doubles as the
/// broadcast destination hint on emitted messages.
pub const DEFAULT_PORT_HANDLE: PortHandle = 0xffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Tick,
    Batch,
    Interpolation,
    Data,
    Synchronizer,
    External,
}

impl UnitKind {
    pub const fn as_tag(self) -> u8 {
        match self {
            UnitKind::Tick => 0,
            UnitKind::Batch => 1,
            UnitKind::Interpolation => 2,
            UnitKind::Data => 3,
            UnitKind::Synchronizer => 4,
            UnitKind::External => 5,
        }
    }

    pub const fn from_tag(tag: u8) -> UnitKind {
        match tag {
            0 => UnitKind::Tick,
            1 => UnitKind::Batch,
            2 => UnitKind::Interpolation,
            3 => UnitKind::Data,
            4 => UnitKind::Synchronizer,
            _ => UnitKind::External,
        }
    }
}

/// Outcome of one `process` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitStatus {
    Ok,
    /// Retryable; the executor re-queues the node a bounded number of times.
    Transient,
    /// The node is poisoned and never dispatched again.
    Permanent,
    /// The whole dag is cancelled.
    Fatal,
}

/// Placement hint handed to a unit when it is attached to a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NumaHint {
    #[default]
    Any,
    Node(u16),
}

/// Counters a unit reports through `metrics`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnitMetrics {
    pub messages_in: u64,
    pub messages_out: u64,
    pub errors: u64,
}

/// Resolves arena handles carried by oversized-payload messages.
pub trait BlobResolver {
    /// Copies the referenced bytes into `dst`, returning the copied length,
    /// or `None` if the handle is stale or unknown.
    fn resolve(&self, source: u64, handle: ArenaHandle, dst: &mut [u8]) -> Option<usize>;
}

/// A resolver for contexts with no arenas (tests, detached units).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBlobs;

impl BlobResolver for NoBlobs {
    fn resolve(&self, _source: u64, _handle: ArenaHandle, _dst: &mut [u8]) -> Option<usize> {
        None
    }
}

/// View of the messages delivered to a node since its previous dispatch.
pub struct Inputs<'a> {
    messages: &'a [Message],
    blobs: &'a dyn BlobResolver,
}

impl<'a> Inputs<'a> {
    pub fn new(messages: &'a [Message], blobs: &'a dyn BlobResolver) -> Inputs<'a> {
        Inputs { messages, blobs }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Messages delivered on one input port.
    pub fn on_port(&self, port: PortHandle) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(move |m| m.port == port)
    }

    /// Copies an arena payload into `dst`. Returns `None` when the producer
    /// has already recycled the slot.
    pub fn resolve_blob(&self, message: &Message, dst: &mut [u8]) -> Option<usize> {
        let handle = message.arena_handle()?;
        self.blobs.resolve(message.source, handle, dst)
    }
}

/// Behavior attached to a dag node.
///
/// `process` runs on a scheduler worker: it must not block and must not
/// allocate. Anything a unit needs at dispatch time is set up in
/// `on_attach`.
#[enum_dispatch::enum_dispatch]
pub trait ProcessingUnit: Send + Debug {
    fn kind(&self) -> UnitKind;

    /// Expected payload tag per input port. A single-entry schema is
    /// homogeneous: it applies to every input port.
    fn input_schema(&self) -> &[TypeTag];

    /// Emitted payload tag per output port.
    fn output_schema(&self) -> &[TypeTag];

    fn on_attach(&mut self, _node: NodeId, _dag: DagId, _numa: NumaHint) {}

    fn process(&mut self, inputs: &Inputs, fw: &mut dyn OutputChannelForwarder) -> UnitStatus;

    fn on_detach(&mut self) {}

    fn metrics(&self) -> UnitMetrics {
        UnitMetrics::default()
    }

    /// Opaque local-state snapshot; the engine passes it through untouched.
    fn snapshot(&self) -> Option<Vec<u8>> {
        None
    }

    fn restore(&mut self, _snapshot: &[u8]) {}
}

/// Gap-filling capability exposed by synchronizer-facing units.
pub trait GapFill: Send + Debug {
    /// Produces the value of a stream at `timestamp_ns` from its last two
    /// observations.
    fn fill(&self, prev: &Tick, last: &Tick, timestamp_ns: u64) -> Tick;
}

/// Looks up the payload tag a schema prescribes for `port`.
pub fn schema_tag(schema: &[TypeTag], port: PortHandle) -> Option<TypeTag> {
    if schema.len() == 1 || port == DEFAULT_PORT_HANDLE {
        return schema.first().copied();
    }
    schema.get(port as usize).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tag_round_trips() {
        for kind in [
            UnitKind::Tick,
            UnitKind::Batch,
            UnitKind::Interpolation,
            UnitKind::Data,
            UnitKind::Synchronizer,
            UnitKind::External,
        ] {
            assert_eq!(UnitKind::from_tag(kind.as_tag()), kind);
        }
    }

    #[test]
    fn homogeneous_schema_covers_every_port() {
        let schema = [TypeTag::TICK];
        assert_eq!(schema_tag(&schema, 0), Some(TypeTag::TICK));
        assert_eq!(schema_tag(&schema, 63), Some(TypeTag::TICK));
        assert_eq!(schema_tag(&schema, DEFAULT_PORT_HANDLE), Some(TypeTag::TICK));
    }

    #[test]
    fn multi_port_schema_is_indexed() {
        let schema = [TypeTag::TICK, TypeTag::BAR];
        assert_eq!(schema_tag(&schema, 1), Some(TypeTag::BAR));
        assert_eq!(schema_tag(&schema, 2), None);
        assert_eq!(schema_tag(&schema, DEFAULT_PORT_HANDLE), Some(TypeTag::TICK));
    }

    #[test]
    fn inputs_filter_by_port() {
        let mut a = Message::new(TypeTag::TICK, 1);
        a.port = 0;
        let mut b = Message::new(TypeTag::TICK, 2);
        b.port = 1;
        let messages = [a, b, a];
        let inputs = Inputs::new(&messages, &NoBlobs);
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs.on_port(0).count(), 2);
        assert_eq!(inputs.on_port(1).count(), 1);
    }
}
