//! Schema-checked forwarding unit.

use tickflow_types::message::TypeTag;

use crate::node::{Inputs, ProcessingUnit, UnitKind, UnitMetrics, UnitStatus, DEFAULT_PORT_HANDLE};
use crate::OutputChannelForwarder;

/// Forwards messages whose payload tag matches the configured one; anything
/// else is dropped and counted. Useful as a typed junction between
/// heterogeneous stages.
#[derive(Debug)]
pub struct DataUnit {
    schema: [TypeTag; 1],
    messages_in: u64,
    messages_out: u64,
    errors: u64,
}

impl DataUnit {
    pub fn new(tag: TypeTag) -> DataUnit {
        DataUnit {
            schema: [tag],
            messages_in: 0,
            messages_out: 0,
            errors: 0,
        }
    }
}

impl ProcessingUnit for DataUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::Data
    }

    fn input_schema(&self) -> &[TypeTag] {
        &self.schema
    }

    fn output_schema(&self) -> &[TypeTag] {
        &self.schema
    }

    fn process(&mut self, inputs: &Inputs, fw: &mut dyn OutputChannelForwarder) -> UnitStatus {
        for message in inputs.iter() {
            self.messages_in += 1;
            if !self.schema[0].accepts(message.kind) {
                self.errors += 1;
                continue;
            }
            fw.send(*message, DEFAULT_PORT_HANDLE);
            self.messages_out += 1;
        }
        UnitStatus::Ok
    }

    fn metrics(&self) -> UnitMetrics {
        UnitMetrics {
            messages_in: self.messages_in,
            messages_out: self.messages_out,
            errors: self.errors,
        }
    }
}
