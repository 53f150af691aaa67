//! Per-tick normalization unit.

use tickflow_types::market::Tick;
use tickflow_types::message::TypeTag;

use crate::node::{Inputs, ProcessingUnit, UnitKind, UnitMetrics, UnitStatus, DEFAULT_PORT_HANDLE};
use crate::OutputChannelForwarder;

const TICK_SCHEMA: [TypeTag; 1] = [TypeTag::TICK];

/// Forwards well-formed ticks and drops the rest. Out-of-order ticks (older
/// than the last forwarded one) are dropped too, so downstream units can rely
/// on per-stream monotonic timestamps.
#[derive(Debug, Default)]
pub struct TickUnit {
    last_ns: u64,
    messages_in: u64,
    messages_out: u64,
    errors: u64,
}

impl TickUnit {
    pub fn new() -> TickUnit {
        TickUnit::default()
    }
}

impl ProcessingUnit for TickUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::Tick
    }

    fn input_schema(&self) -> &[TypeTag] {
        &TICK_SCHEMA
    }

    fn output_schema(&self) -> &[TypeTag] {
        &TICK_SCHEMA
    }

    fn process(&mut self, inputs: &Inputs, fw: &mut dyn OutputChannelForwarder) -> UnitStatus {
        for message in inputs.iter() {
            self.messages_in += 1;
            if message.kind != TypeTag::TICK {
                self.errors += 1;
                continue;
            }
            let Some(tick) = message.payload_as::<Tick>() else {
                self.errors += 1;
                continue;
            };
            if !tick.price.is_finite() || tick.timestamp_ns < self.last_ns {
                self.errors += 1;
                continue;
            }
            self.last_ns = tick.timestamp_ns;
            let mut out = *message;
            out.port = DEFAULT_PORT_HANDLE;
            fw.send(out, DEFAULT_PORT_HANDLE);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NoBlobs;
    use crate::tests::units::CollectingForwarder;
    use tickflow_types::bytemuck;
    use tickflow_types::message::Message;

    fn tick_message(timestamp_ns: u64, price: f64) -> Message {
        let tick = Tick::new(timestamp_ns, price, 1.0);
        Message::with_payload(TypeTag::TICK, timestamp_ns, bytemuck::bytes_of(&tick)).unwrap()
    }

    #[test]
    fn forwards_in_order_ticks() {
        let mut unit = TickUnit::new();
        let messages = [tick_message(10, 1.0), tick_message(20, 2.0)];
        let mut fw = CollectingForwarder::default();
        let status = unit.process(&Inputs::new(&messages, &NoBlobs), &mut fw);
        assert_eq!(status, UnitStatus::Ok);
        assert_eq!(fw.sent.len(), 2);
        assert_eq!(unit.metrics().messages_out, 2);
    }

    #[test]
    fn drops_stale_and_non_finite_ticks() {
        let mut unit = TickUnit::new();
        let messages = [
            tick_message(100, 1.0),
            tick_message(50, 1.0),
            tick_message(200, f64::INFINITY),
        ];
        let mut fw = CollectingForwarder::default();
        unit.process(&Inputs::new(&messages, &NoBlobs), &mut fw);
        assert_eq!(fw.sent.len(), 1);
        assert_eq!(unit.metrics().errors, 2);
    }
}
