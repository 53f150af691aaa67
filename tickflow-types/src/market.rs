//! Market data payloads. Both types are POD so they can be copied in and out
//! of message payload windows without serialization.

use bytemuck::{Pod, Zeroable};

/// Tick flag bits.
pub mod tick_flags {
    /// Tick closes the bar it belongs to.
    pub const BAR_CLOSE: u32 = 0b0001;
    /// Tick was synthesized by a fill kernel rather than observed.
    pub const SYNTHETIC: u32 = 0b0010;
}

/// A single trade or quote observation. 32 bytes; fits the inline window.
#[derive(Clone, Copy, Debug, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct Tick {
    pub timestamp_ns: u64,
    pub price: f64,
    pub volume: f64,
    pub flags: u32,
    pub reserved: u32,
}

impl Tick {
    pub fn new(timestamp_ns: u64, price: f64, volume: f64) -> Tick {
        Tick {
            timestamp_ns,
            price,
            volume,
            flags: 0,
            reserved: 0,
        }
    }

    /// NaN-priced placeholder emitted when a follower value is dropped but
    /// the caller asked for sentinel events.
    pub fn sentinel(timestamp_ns: u64) -> Tick {
        Tick {
            timestamp_ns,
            price: f64::NAN,
            volume: 0.0,
            flags: tick_flags::SYNTHETIC,
            reserved: 0,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.price.is_nan()
    }
}

/// An aggregated bar. 56 bytes; always travels through the payload arena.
#[derive(Clone, Copy, Debug, PartialEq, Zeroable, Pod)]
#[repr(C)]
pub struct Bar {
    pub open_ns: u64,
    pub close_ns: u64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Starts a bar from its first tick.
    pub fn opening(tick: &Tick) -> Bar {
        Bar {
            open_ns: tick.timestamp_ns,
            close_ns: tick.timestamp_ns,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
        }
    }

    /// Folds one more tick into the bar.
    pub fn absorb(&mut self, tick: &Tick) {
        self.close_ns = tick.timestamp_ns;
        self.close = tick.price;
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.volume += tick.volume;
    }
}

const _: () = assert!(std::mem::size_of::<Tick>() == 32);
const _: () = assert!(std::mem::size_of::<Bar>() == 56);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_absorbs_ticks() {
        let mut bar = Bar::opening(&Tick::new(10, 100.0, 1.0));
        bar.absorb(&Tick::new(20, 104.0, 2.0));
        bar.absorb(&Tick::new(30, 99.0, 1.0));
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 104.0);
        assert_eq!(bar.low, 99.0);
        assert_eq!(bar.close, 99.0);
        assert_eq!(bar.volume, 4.0);
        assert_eq!(bar.close_ns, 30);
    }

    #[test]
    fn sentinel_is_recognizable() {
        assert!(Tick::sentinel(5).is_sentinel());
        assert!(!Tick::new(5, 1.0, 1.0).is_sentinel());
    }
}
