//! Built-in processing units.
//!
//! The closed set of built-in behaviors is dispatched statically through an
//! enum; externally supplied behaviors ride along in a boxed arm.

pub mod batch;
pub mod data;
pub mod interpolation;
pub mod tick;

pub use batch::BatchUnit;
pub use data::DataUnit;
pub use interpolation::InterpolationUnit;
pub use tick::TickUnit;

use tickflow_types::config::FillStrategy;
use tickflow_types::ids::{DagId, NodeId};
use tickflow_types::message::TypeTag;

use crate::node::{Inputs, NumaHint, ProcessingUnit, UnitKind, UnitMetrics, UnitStatus};
use crate::sync::{StreamSynchronizer, SyncConfig};
use crate::OutputChannelForwarder;

/// Externally supplied behavior attached through the orchestrator.
#[derive(Debug)]
pub struct ExternalUnit(pub Box<dyn ProcessingUnit>);

impl ProcessingUnit for ExternalUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::External
    }

    fn input_schema(&self) -> &[TypeTag] {
        self.0.input_schema()
    }

    fn output_schema(&self) -> &[TypeTag] {
        self.0.output_schema()
    }

    fn on_attach(&mut self, node: NodeId, dag: DagId, numa: NumaHint) {
        self.0.on_attach(node, dag, numa);
    }

    fn process(&mut self, inputs: &Inputs, fw: &mut dyn OutputChannelForwarder) -> UnitStatus {
        self.0.process(inputs, fw)
    }

    fn on_detach(&mut self) {
        self.0.on_detach();
    }

    fn metrics(&self) -> UnitMetrics {
        self.0.metrics()
    }

    fn snapshot(&self) -> Option<Vec<u8>> {
        self.0.snapshot()
    }

    fn restore(&mut self, snapshot: &[u8]) {
        self.0.restore(snapshot);
    }
}

/// Behavior stored per node. Built-ins dispatch statically.
#[enum_dispatch::enum_dispatch(ProcessingUnit)]
#[derive(Debug)]
pub enum UnitBehavior {
    Tick(TickUnit),
    Batch(BatchUnit),
    Interpolation(InterpolationUnit),
    Data(DataUnit),
    Synchronizer(StreamSynchronizer),
    External(ExternalUnit),
}

/// What callers hand to `add_node`: the unit kind plus its configuration.
#[derive(Debug)]
pub enum UnitSpec {
    Tick,
    Batch { ticks_per_bar: u32 },
    Interpolation { strategy: FillStrategy },
    Data { tag: TypeTag },
    Synchronizer(SyncConfig),
    External(Box<dyn ProcessingUnit>),
}

impl UnitSpec {
    pub fn kind(&self) -> UnitKind {
        match self {
            UnitSpec::Tick => UnitKind::Tick,
            UnitSpec::Batch { .. } => UnitKind::Batch,
            UnitSpec::Interpolation { .. } => UnitKind::Interpolation,
            UnitSpec::Data { .. } => UnitKind::Data,
            UnitSpec::Synchronizer(_) => UnitKind::Synchronizer,
            UnitSpec::External(_) => UnitKind::External,
        }
    }

    pub(crate) fn build(self) -> UnitBehavior {
        match self {
            UnitSpec::Tick => UnitBehavior::Tick(TickUnit::new()),
            UnitSpec::Batch { ticks_per_bar } => {
                UnitBehavior::Batch(BatchUnit::new(ticks_per_bar))
            }
            UnitSpec::Interpolation { strategy } => {
                UnitBehavior::Interpolation(InterpolationUnit::new(strategy))
            }
            UnitSpec::Data { tag } => UnitBehavior::Data(DataUnit::new(tag)),
            UnitSpec::Synchronizer(config) => {
                UnitBehavior::Synchronizer(StreamSynchronizer::new(config))
            }
            UnitSpec::External(unit) => UnitBehavior::External(ExternalUnit(unit)),
        }
    }
}
