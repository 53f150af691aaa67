//! Tick-to-bar aggregation unit.

use tickflow_types::bytemuck;
use tickflow_types::market::{Bar, Tick};
use tickflow_types::message::TypeTag;

use crate::node::{Inputs, ProcessingUnit, UnitKind, UnitMetrics, UnitStatus, DEFAULT_PORT_HANDLE};
use crate::OutputChannelForwarder;

const INPUT_SCHEMA: [TypeTag; 1] = [TypeTag::TICK];
const OUTPUT_SCHEMA: [TypeTag; 1] = [TypeTag::BAR];

/// Folds every `ticks_per_bar` ticks into one bar. Bars exceed the inline
/// payload window, so completed bars leave through the arena.
#[derive(Debug)]
pub struct BatchUnit {
    ticks_per_bar: u32,
    current: Option<Bar>,
    count: u32,
    messages_in: u64,
    messages_out: u64,
    errors: u64,
}

impl BatchUnit {
    pub fn new(ticks_per_bar: u32) -> BatchUnit {
        BatchUnit {
            ticks_per_bar: ticks_per_bar.max(1),
            current: None,
            count: 0,
            messages_in: 0,
            messages_out: 0,
            errors: 0,
        }
    }
}

impl ProcessingUnit for BatchUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::Batch
    }

    fn input_schema(&self) -> &[TypeTag] {
        &INPUT_SCHEMA
    }

    fn output_schema(&self) -> &[TypeTag] {
        &OUTPUT_SCHEMA
    }

    fn process(&mut self, inputs: &Inputs, fw: &mut dyn OutputChannelForwarder) -> UnitStatus {
        for message in inputs.iter() {
            self.messages_in += 1;
            let Some(tick) = message
                .payload_as::<Tick>()
                .filter(|_| message.kind == TypeTag::TICK)
                .copied()
            else {
                self.errors += 1;
                continue;
            };

            match self.current.as_mut() {
                Some(bar) => bar.absorb(&tick),
                None => self.current = Some(Bar::opening(&tick)),
            }
            self.count += 1;

            if self.count >= self.ticks_per_bar {
                let bar = self.current.take().expect("bar exists after absorb");
                self.count = 0;
                if fw
                    .send_blob(
                        TypeTag::BAR,
                        bar.close_ns,
                        bytemuck::bytes_of(&bar),
                        DEFAULT_PORT_HANDLE,
                    )
                    .is_err()
                {
                    self.errors += 1;
                    return UnitStatus::Transient;
                }
                self.messages_out += 1;
            }
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
    use tickflow_types::message::Message;

    fn tick_message(timestamp_ns: u64, price: f64) -> Message {
        let tick = Tick::new(timestamp_ns, price, 1.0);
        Message::with_payload(TypeTag::TICK, timestamp_ns, bytemuck::bytes_of(&tick)).unwrap()
    }

    #[test]
    fn emits_one_bar_per_batch() {
        let mut unit = BatchUnit::new(3);
        let messages = [
            tick_message(10, 100.0),
            tick_message(20, 103.0),
            tick_message(30, 98.0),
            tick_message(40, 99.0),
        ];
        let mut fw = CollectingForwarder::default();
        unit.process(&Inputs::new(&messages, &NoBlobs), &mut fw);

        assert_eq!(fw.blobs.len(), 1);
        let (kind, _, bytes, _) = &fw.blobs[0];
        assert_eq!(*kind, TypeTag::BAR);
        let bar: &Bar = bytemuck::from_bytes(bytes);
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 103.0);
        assert_eq!(bar.low, 98.0);
        assert_eq!(bar.close, 98.0);
        // The fourth tick opened the next bar.
        assert_eq!(unit.count, 1);
    }
}
