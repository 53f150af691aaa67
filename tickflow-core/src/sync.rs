//! Leader/follower stream synchronization.
//!
//! The synchronizer is a processing unit whose input ports are raw streams:
//! the tick arriving on port `p` belongs to stream slot `p`. On every leader
//! tick it emits one synchronized event carrying, for every active stream,
//! the latest observed tick or a fill produced by the configured gap-fill
//! collaborator.

use tickflow_types::bytemuck::{self, Pod, Zeroable};
use tickflow_types::config::{DropPolicy, EngineConfig, FillStrategy, LeaderMode};
use tickflow_types::ids::{DagId, NodeId};
use tickflow_types::log::debug;
use tickflow_types::market::Tick;
use tickflow_types::message::TypeTag;

use crate::node::{
    GapFill, Inputs, NumaHint, ProcessingUnit, UnitKind, UnitMetrics, UnitStatus,
    DEFAULT_PORT_HANDLE,
};
use crate::units::interpolation::FillKernel;
use crate::OutputChannelForwarder;

const TICK_SCHEMA: [TypeTag; 1] = [TypeTag::TICK];
const SYNC_SCHEMA: [TypeTag; 1] = [TypeTag::SYNC];

mod state_flags {
    pub const ACTIVE: u32 = 0b0001;
    pub const GAP: u32 = 0b0010;
    pub const SYNCED: u32 = 0b0100;
    pub const LEADER: u32 = 0b1000;
}

/// Per-stream bookkeeping. Two cache lines.
#[repr(C, align(64))]
#[derive(Clone, Copy, Debug)]
pub struct StreamState {
    latest_ns: u64,
    last_bar_ns: u64,
    prev: Tick,
    last: Tick,
    window_start_ns: u64,
    window_count: u32,
    prev_window_count: u32,
    flags: u32,
}

const _: () = assert!(std::mem::size_of::<StreamState>() == 128);

impl StreamState {
    fn empty() -> StreamState {
        StreamState {
            latest_ns: 0,
            last_bar_ns: 0,
            prev: Tick::new(0, 0.0, 0.0),
            last: Tick::new(0, 0.0, 0.0),
            window_start_ns: 0,
            window_count: 0,
            prev_window_count: 0,
            flags: 0,
        }
    }

    fn is_active(&self) -> bool {
        self.flags & state_flags::ACTIVE != 0
    }

    /// Recent tick count over roughly the last two window spans.
    fn recent_rate(&self) -> u64 {
        self.window_count as u64 + self.prev_window_count as u64
    }

    fn observe(&mut self, tick: Tick, window_ns: u64) {
        self.prev = self.last;
        self.last = tick;
        self.latest_ns = tick.timestamp_ns;
        self.flags |= state_flags::ACTIVE;
        if tick.flags & tickflow_types::market::tick_flags::BAR_CLOSE != 0 {
            self.last_bar_ns = tick.timestamp_ns;
        }

        if self.window_start_ns == 0 {
            self.window_start_ns = tick.timestamp_ns;
        } else if tick.timestamp_ns.saturating_sub(self.window_start_ns) >= window_ns {
            self.prev_window_count = self.window_count;
            self.window_count = 0;
            self.window_start_ns = tick.timestamp_ns;
        }
        self.window_count += 1;
    }
}

/// Header of a synchronized event payload; followed by `stream_count` ticks,
/// one per stream slot in port order.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(C)]
pub struct SyncHeader {
    pub leader_ts: u64,
    pub leader: u32,
    pub stream_count: u32,
}

// 16 bytes, naturally aligned, no padding.
unsafe impl Zeroable for SyncHeader {}
unsafe impl Pod for SyncHeader {}

/// Decodes a synchronized event payload copied out of the arena.
pub fn decode_sync_event(bytes: &[u8]) -> Option<(SyncHeader, Vec<Tick>)> {
    let header_len = std::mem::size_of::<SyncHeader>();
    if bytes.len() < header_len {
        return None;
    }
    let header: SyncHeader = bytemuck::pod_read_unaligned(&bytes[..header_len]);
    let tick_len = std::mem::size_of::<Tick>();
    let expected = header_len + header.stream_count as usize * tick_len;
    if bytes.len() < expected {
        return None;
    }
    let ticks = bytes[header_len..expected]
        .chunks_exact(tick_len)
        .map(bytemuck::pod_read_unaligned)
        .collect();
    Some((header, ticks))
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub leader_mode: LeaderMode,
    pub fill_strategy: FillStrategy,
    pub drop_policy: DropPolicy,
    pub max_lag_ns: u64,
    pub buffer_window_ns: u64,
    /// Emit one event per this many leader ticks.
    pub sync_frequency: u64,
    pub max_streams: usize,
    /// Stream slot that leads under `LeaderMode::FixedLeader`.
    pub fixed_leader: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig::from_engine(&EngineConfig::default())
    }
}

impl SyncConfig {
    pub fn from_engine(config: &EngineConfig) -> SyncConfig {
        SyncConfig {
            leader_mode: config.leader_mode,
            fill_strategy: config.fill_strategy,
            drop_policy: config.drop_policy,
            max_lag_ns: config.max_lag_ns,
            buffer_window_ns: config.buffer_window_ns,
            sync_frequency: config.sync_frequency.max(1),
            max_streams: config.max_streams,
            fixed_leader: 0,
        }
    }
}

#[derive(Debug)]
pub struct StreamSynchronizer {
    config: SyncConfig,
    streams: Box<[StreamState]>,
    filler: Box<dyn GapFill>,
    /// Current leader slot.
    leader: u16,
    last_emitted_ns: u64,
    leader_ticks: u64,
    suppressed: u64,
    scratch: Vec<u8>,
    node: NodeId,
    messages_in: u64,
    messages_out: u64,
    errors: u64,
}

impl StreamSynchronizer {
    pub fn new(config: SyncConfig) -> StreamSynchronizer {
        let filler = Box::new(FillKernel::new(config.fill_strategy));
        StreamSynchronizer::with_filler(config, filler)
    }

    /// Installs a custom gap-fill collaborator in place of the built-in
    /// kernels.
    pub fn with_filler(config: SyncConfig, filler: Box<dyn GapFill>) -> StreamSynchronizer {
        let max_streams = config.max_streams;
        let scratch_len =
            std::mem::size_of::<SyncHeader>() + max_streams * std::mem::size_of::<Tick>();
        StreamSynchronizer {
            leader: config.fixed_leader,
            config,
            streams: vec![StreamState::empty(); max_streams].into_boxed_slice(),
            filler,
            last_emitted_ns: 0,
            leader_ticks: 0,
            suppressed: 0,
            scratch: vec![0; scratch_len],
            node: NodeId::NIL,
            messages_in: 0,
            messages_out: 0,
            errors: 0,
        }
    }

    /// Events whose emission the `Drop`/`Suppress` policy swallowed.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    fn elect_leader(&mut self) {
        let previous = self.leader;
        self.leader = match self.config.leader_mode {
            LeaderMode::FixedLeader => self.config.fixed_leader,
            LeaderMode::HighestRate => self
                .streams
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_active())
                .max_by_key(|(i, s)| (s.recent_rate(), std::cmp::Reverse(*i)))
                .map(|(i, _)| i as u16)
                .unwrap_or(0),
            // Without touching the clock on the hot path, the stream with
            // the newest data is the one trailing wall-clock the least.
            LeaderMode::LowestLag => self
                .streams
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_active())
                .max_by_key(|(i, s)| (s.latest_ns, std::cmp::Reverse(*i)))
                .map(|(i, _)| i as u16)
                .unwrap_or(0),
        };
        if self.leader != previous {
            debug!("stream leader moved {previous} -> {}", self.leader);
            if let Some(state) = self.streams.get_mut(previous as usize) {
                state.flags &= !state_flags::LEADER;
            }
            if let Some(state) = self.streams.get_mut(self.leader as usize) {
                state.flags |= state_flags::LEADER;
            }
        }
    }

    /// Builds and sends one synchronized event at the leader's timestamp.
    /// Returns false when the event was suppressed by the drop policy.
    fn emit_event(&mut self, leader_ts: u64, fw: &mut dyn OutputChannelForwarder) -> bool {
        let Self {
            config,
            streams,
            filler,
            scratch,
            leader,
            last_emitted_ns,
            suppressed,
            messages_out,
            errors,
            ..
        } = self;

        let leader = *leader as usize;
        let stream_count = streams
            .iter()
            .rposition(StreamState::is_active)
            .map_or(0, |highest| highest + 1);

        let header = SyncHeader {
            leader_ts,
            leader: leader as u32,
            stream_count: stream_count as u32,
        };
        let header_len = std::mem::size_of::<SyncHeader>();
        scratch[..header_len].copy_from_slice(bytemuck::bytes_of(&header));

        for (slot, state) in streams.iter_mut().take(stream_count).enumerate() {
            let tick = if slot == leader {
                state.last
            } else if state.latest_ns + config.max_lag_ns < leader_ts {
                state.flags |= state_flags::GAP;
                if matches!(config.fill_strategy, FillStrategy::Drop) {
                    match config.drop_policy {
                        DropPolicy::Suppress => {
                            *suppressed += 1;
                            return false;
                        }
                        DropPolicy::Sentinel => Tick::sentinel(leader_ts),
                    }
                } else {
                    filler.fill(&state.prev, &state.last, leader_ts)
                }
            } else {
                state.flags &= !state_flags::GAP;
                let mut tick = state.last;
                // A follower never appears newer than the leader.
                tick.timestamp_ns = tick.timestamp_ns.min(leader_ts);
                tick
            };
            debug_assert!(tick.timestamp_ns <= leader_ts || slot == leader);
            let offset = header_len + slot * std::mem::size_of::<Tick>();
            scratch[offset..offset + std::mem::size_of::<Tick>()]
                .copy_from_slice(bytemuck::bytes_of(&tick));
            state.flags |= state_flags::SYNCED;
        }

        // Emitted timestamps never move backward even if leadership hops
        // between streams with skewed clocks.
        let event_ts = leader_ts.max(*last_emitted_ns);
        *last_emitted_ns = event_ts;

        let payload_len = header_len + stream_count * std::mem::size_of::<Tick>();
        match fw.send_blob(TypeTag::SYNC, event_ts, &scratch[..payload_len], DEFAULT_PORT_HANDLE) {
            Ok(()) => {
                *messages_out += 1;
                true
            }
            Err(_) => {
                *errors += 1;
                false
            }
        }
    }
}

impl ProcessingUnit for StreamSynchronizer {
    fn kind(&self) -> UnitKind {
        UnitKind::Synchronizer
    }

    fn input_schema(&self) -> &[TypeTag] {
        &TICK_SCHEMA
    }

    fn output_schema(&self) -> &[TypeTag] {
        &SYNC_SCHEMA
    }

    fn on_attach(&mut self, node: NodeId, _dag: DagId, _numa: NumaHint) {
        self.node = node;
    }

    fn process(&mut self, inputs: &Inputs, fw: &mut dyn OutputChannelForwarder) -> UnitStatus {
        for message in inputs.iter() {
            self.messages_in += 1;
            let slot = message.port as usize;
            if message.kind != TypeTag::TICK || slot >= self.streams.len() {
                self.errors += 1;
                continue;
            }
            let Some(tick) = message.payload_as::<Tick>().copied() else {
                self.errors += 1;
                continue;
            };

            self.streams[slot].observe(tick, self.config.buffer_window_ns);
            self.elect_leader();

            if slot == self.leader as usize {
                self.leader_ticks += 1;
                if self.leader_ticks % self.config.sync_frequency == 0 {
                    self.emit_event(tick.timestamp_ns, fw);
                }
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
