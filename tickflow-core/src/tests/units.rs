//! Reusable test units and forwarders.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tickflow_types::bytemuck;
use tickflow_types::market::Tick;
use tickflow_types::message::{Message, TypeTag};
use tickflow_types::parking_lot::Mutex;

use crate::errors::ExecutionError;
use crate::node::{Inputs, PortHandle, ProcessingUnit, UnitKind, UnitStatus};
use crate::sync::{decode_sync_event, SyncHeader};
use crate::OutputChannelForwarder;

const ANY_SCHEMA: [TypeTag; 1] = [TypeTag::ANY];

/// Builds a tick message the way external feeds do.
pub fn tick_message(timestamp_ns: u64, price: f64) -> Message {
    let tick = Tick::new(timestamp_ns, price, 1.0);
    Message::with_payload(TypeTag::TICK, timestamp_ns, bytemuck::bytes_of(&tick)).unwrap()
}

/// Captures everything a unit emits, for direct `process` tests.
#[derive(Default)]
pub struct CollectingForwarder {
    pub sent: Vec<Message>,
    pub blobs: Vec<(TypeTag, u64, Vec<u8>, PortHandle)>,
}

impl OutputChannelForwarder for CollectingForwarder {
    fn send(&mut self, message: Message, _port: PortHandle) {
        self.sent.push(message);
    }

    fn send_blob(
        &mut self,
        kind: TypeTag,
        timestamp_ns: u64,
        bytes: &[u8],
        port: PortHandle,
    ) -> Result<(), ExecutionError> {
        self.blobs.push((kind, timestamp_ns, bytes.to_vec(), port));
        Ok(())
    }
}

/// Terminal unit recording every dispatch as one group of messages.
#[derive(Debug)]
pub struct RecordingUnit {
    pub groups: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl RecordingUnit {
    pub fn new() -> (RecordingUnit, Arc<Mutex<Vec<Vec<Message>>>>) {
        let groups = Arc::new(Mutex::new(Vec::new()));
        (
            RecordingUnit {
                groups: Arc::clone(&groups),
            },
            groups,
        )
    }
}

impl ProcessingUnit for RecordingUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::External
    }

    fn input_schema(&self) -> &[TypeTag] {
        &ANY_SCHEMA
    }

    fn output_schema(&self) -> &[TypeTag] {
        &ANY_SCHEMA
    }

    fn process(&mut self, inputs: &Inputs, _fw: &mut dyn OutputChannelForwarder) -> UnitStatus {
        if !inputs.is_empty() {
            self.groups.lock().push(inputs.iter().copied().collect());
        }
        UnitStatus::Ok
    }
}

/// Terminal unit that resolves synchronized-event blobs while they are
/// still live and records the decoded events.
#[derive(Debug)]
pub struct SyncRecordingUnit {
    pub events: Arc<Mutex<Vec<(u64, SyncHeader, Vec<Tick>)>>>,
}

impl SyncRecordingUnit {
    #[allow(clippy::type_complexity)]
    pub fn new() -> (
        SyncRecordingUnit,
        Arc<Mutex<Vec<(u64, SyncHeader, Vec<Tick>)>>>,
    ) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            SyncRecordingUnit {
                events: Arc::clone(&events),
            },
            events,
        )
    }
}

impl ProcessingUnit for SyncRecordingUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::External
    }

    fn input_schema(&self) -> &[TypeTag] {
        &ANY_SCHEMA
    }

    fn output_schema(&self) -> &[TypeTag] {
        &ANY_SCHEMA
    }

    fn process(&mut self, inputs: &Inputs, _fw: &mut dyn OutputChannelForwarder) -> UnitStatus {
        let mut buffer = [0u8; 4096];
        for message in inputs.iter() {
            if message.kind != TypeTag::SYNC {
                continue;
            }
            let Some(len) = inputs.resolve_blob(message, &mut buffer) else {
                continue;
            };
            if let Some((header, ticks)) = decode_sync_event(&buffer[..len]) {
                self.events
                    .lock()
                    .push((message.timestamp_ns, header, ticks));
            }
        }
        UnitStatus::Ok
    }
}

/// Fails in a configurable way after forwarding a few messages.
#[derive(Debug)]
pub struct FailingUnit {
    fail_with: UnitStatus,
    ok_dispatches: u64,
    seen: u64,
}

impl FailingUnit {
    pub fn new(fail_with: UnitStatus, ok_dispatches: u64) -> FailingUnit {
        FailingUnit {
            fail_with,
            ok_dispatches,
            seen: 0,
        }
    }
}

impl ProcessingUnit for FailingUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::External
    }

    fn input_schema(&self) -> &[TypeTag] {
        &ANY_SCHEMA
    }

    fn output_schema(&self) -> &[TypeTag] {
        &ANY_SCHEMA
    }

    fn process(&mut self, inputs: &Inputs, fw: &mut dyn OutputChannelForwarder) -> UnitStatus {
        self.seen += 1;
        if self.seen <= self.ok_dispatches {
            for message in inputs.iter() {
                fw.send(*message, crate::node::DEFAULT_PORT_HANDLE);
            }
            return UnitStatus::Ok;
        }
        self.fail_with
    }
}

/// Detects overlapping dispatches of the same node.
#[derive(Debug)]
pub struct GuardCheckUnit {
    busy: AtomicBool,
    pub violations: Arc<AtomicU64>,
    pub dispatches: Arc<AtomicU64>,
}

impl GuardCheckUnit {
    pub fn new() -> (GuardCheckUnit, Arc<AtomicU64>, Arc<AtomicU64>) {
        let violations = Arc::new(AtomicU64::new(0));
        let dispatches = Arc::new(AtomicU64::new(0));
        (
            GuardCheckUnit {
                busy: AtomicBool::new(false),
                violations: Arc::clone(&violations),
                dispatches: Arc::clone(&dispatches),
            },
            violations,
            dispatches,
        )
    }
}

impl ProcessingUnit for GuardCheckUnit {
    fn kind(&self) -> UnitKind {
        UnitKind::External
    }

    fn input_schema(&self) -> &[TypeTag] {
        &ANY_SCHEMA
    }

    fn output_schema(&self) -> &[TypeTag] {
        &ANY_SCHEMA
    }

    fn process(&mut self, _inputs: &Inputs, _fw: &mut dyn OutputChannelForwarder) -> UnitStatus {
        if self.busy.swap(true, Ordering::AcqRel) {
            self.violations.fetch_add(1, Ordering::Relaxed);
        }
        std::thread::yield_now();
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        self.busy.store(false, Ordering::Release);
        UnitStatus::Ok
    }
}
