//! Gap-filling kernels and the interpolation unit.
//!
//! The kernels project a stream's value to an arbitrary timestamp from its
//! last two observations. The synchronizer delegates follower fills here;
//! the standalone unit additionally densifies a single stream by emitting
//! synthetic ticks across detected gaps.

use tickflow_types::bytemuck;
use tickflow_types::config::FillStrategy;
use tickflow_types::market::{tick_flags, Tick};
use tickflow_types::message::{Message, TypeTag};

use crate::node::{
    GapFill, Inputs, ProcessingUnit, UnitKind, UnitMetrics, UnitStatus, DEFAULT_PORT_HANDLE,
};
use crate::OutputChannelForwarder;

const TICK_SCHEMA: [TypeTag; 1] = [TypeTag::TICK];

/// Synthetic ticks emitted per gap at most; wider gaps are filled sparsely.
const MAX_FILL_PER_GAP: u64 = 16;

/// Projects the value at `timestamp_ns` from the two most recent ticks.
pub fn fill_tick(strategy: FillStrategy, prev: &Tick, last: &Tick, timestamp_ns: u64) -> Tick {
    let synthetic = |price: f64| Tick {
        timestamp_ns,
        price,
        volume: 0.0,
        flags: tick_flags::SYNTHETIC,
        reserved: 0,
    };

    match strategy {
        FillStrategy::OldTick => synthetic(last.price),
        FillStrategy::Hold => {
            let mut tick = *last;
            tick.flags |= tick_flags::SYNTHETIC;
            tick
        }
        FillStrategy::Linear => synthetic(linear(prev, last, timestamp_ns)),
        FillStrategy::Cubic => synthetic(cubic(prev, last, timestamp_ns)),
        FillStrategy::Drop => Tick::sentinel(timestamp_ns),
    }
}

fn linear(prev: &Tick, last: &Tick, timestamp_ns: u64) -> f64 {
    let span = last.timestamp_ns.saturating_sub(prev.timestamp_ns);
    if span == 0 {
        return last.price;
    }
    let slope = (last.price - prev.price) / span as f64;
    let dt = timestamp_ns as f64 - last.timestamp_ns as f64;
    last.price + slope * dt
}

/// Hermite blend between the two observations; beyond `last` it degrades to
/// linear so extrapolation stays bounded.
fn cubic(prev: &Tick, last: &Tick, timestamp_ns: u64) -> f64 {
    if timestamp_ns >= last.timestamp_ns {
        return linear(prev, last, timestamp_ns);
    }
    let span = last.timestamp_ns.saturating_sub(prev.timestamp_ns);
    if span == 0 {
        return last.price;
    }
    let t = (timestamp_ns.saturating_sub(prev.timestamp_ns)) as f64 / span as f64;
    let smooth = t * t * (3.0 - 2.0 * t);
    prev.price + (last.price - prev.price) * smooth
}

/// Kernel wrapper handed to synchronizers as their fill collaborator.
#[derive(Debug, Clone, Copy)]
pub struct FillKernel {
    strategy: FillStrategy,
}

impl FillKernel {
    pub fn new(strategy: FillStrategy) -> FillKernel {
        FillKernel { strategy }
    }
}

impl GapFill for FillKernel {
    fn fill(&self, prev: &Tick, last: &Tick, timestamp_ns: u64) -> Tick {
        fill_tick(self.strategy, prev, last, timestamp_ns)
    }
}

/// Densifies one stream: replays observed ticks and fills gaps wider than
/// `gap_ns` with synthetic ticks spaced `gap_ns` apart.
#[derive(Debug)]
pub struct InterpolationUnit {
    strategy: FillStrategy,
    gap_ns: u64,
    prev: Option<Tick>,
    last: Option<Tick>,
    messages_in: u64,
    messages_out: u64,
    errors: u64,
}

impl InterpolationUnit {
    pub fn new(strategy: FillStrategy) -> InterpolationUnit {
        InterpolationUnit::with_gap(strategy, 1_000_000)
    }

    pub fn with_gap(strategy: FillStrategy, gap_ns: u64) -> InterpolationUnit {
        InterpolationUnit {
            strategy,
            gap_ns: gap_ns.max(1),
            prev: None,
            last: None,
            messages_in: 0,
            messages_out: 0,
            errors: 0,
        }
    }

    fn emit(&mut self, tick: Tick, fw: &mut dyn OutputChannelForwarder) {
        let message = Message::with_payload(
            if tick.flags & tick_flags::SYNTHETIC != 0 {
                TypeTag::INTERP
            } else {
                TypeTag::TICK
            },
            tick.timestamp_ns,
            bytemuck::bytes_of(&tick),
        )
        .expect("tick fits the inline window");
        fw.send(message, DEFAULT_PORT_HANDLE);
        self.messages_out += 1;
    }
}

impl ProcessingUnit for InterpolationUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::Interpolation
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
            let Some(tick) = message
                .payload_as::<Tick>()
                .filter(|_| message.kind == TypeTag::TICK)
                .copied()
            else {
                self.errors += 1;
                continue;
            };

            if let (Some(prev), Some(last)) = (self.prev, self.last) {
                let gap = tick.timestamp_ns.saturating_sub(last.timestamp_ns);
                if gap > self.gap_ns && !matches!(self.strategy, FillStrategy::Drop) {
                    let steps = (gap / self.gap_ns).min(MAX_FILL_PER_GAP);
                    let stride = gap / (steps + 1);
                    for step in 1..=steps {
                        let at = last.timestamp_ns + stride * step;
                        let filled = fill_tick(self.strategy, &prev, &last, at);
                        self.emit(filled, fw);
                    }
                }
            }

            self.prev = self.last;
            self.last = Some(tick);
            self.emit(tick, fw);
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
