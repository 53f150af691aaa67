//! Leader/follower synchronization and arena-backed payloads, end to end.

use std::time::Duration;

use tickflow_types::config::{EngineConfig, ExecutionMode, FillStrategy, LeaderMode};
use tickflow_types::message::TypeTag;

use crate::broker::Topic;
use crate::node::DEFAULT_PORT_HANDLE;
use crate::orchestrator::Runtime;
use crate::tests::units::{tick_message, SyncRecordingUnit};
use crate::tests::wait_until;
use crate::units::UnitSpec;

fn runtime() -> Runtime {
    let config = EngineConfig {
        node_pool_capacity: 32,
        queue_capacity: 4096,
        worker_count: 2,
        execution_mode: ExecutionMode::Streaming,
        max_lag_ns: 10_000_000,
        ..Default::default()
    };
    Runtime::initialize(config).unwrap()
}

#[test]
fn three_streams_highest_rate_leader() {
    let runtime = runtime();
    let session = runtime.create_session();
    let dag = runtime.create_dag(session);

    let fast = runtime.create_stream();
    let mid = runtime.create_stream();
    let slow = runtime.create_stream();

    let profile = runtime
        .sync_profile(dag)
        .stream(fast)
        .stream(mid)
        .stream(slow)
        .leader_mode(LeaderMode::HighestRate)
        .fill_strategy(FillStrategy::OldTick)
        .max_lag_ns(10_000_000)
        .attach()
        .unwrap();

    let (sink_unit, events) = SyncRecordingUnit::new();
    let sink = runtime
        .add_node(dag, UnitSpec::External(Box::new(sink_unit)))
        .unwrap();
    runtime
        .connect(dag, profile.node, DEFAULT_PORT_HANDLE, sink, 0)
        .unwrap();
    runtime.finalize(dag).unwrap();
    runtime.start(dag).unwrap();

    // Activate every stream, then run the fast stream at 10x the mid rate
    // and 100x the slow rate over one simulated second.
    let ms = 1_000_000u64;
    runtime.publish(mid, tick_message(ms, 50.0)).unwrap();
    runtime.publish(slow, tick_message(2 * ms, 200.0)).unwrap();
    let mut leader_ticks = 1u64; // the first mid tick led and emitted
    for i in 0..100u64 {
        let ts = 10 * ms + i * 10 * ms;
        runtime.publish(fast, tick_message(ts, 100.0 + i as f64)).unwrap();
        leader_ticks += 1;
        if i % 10 == 0 {
            runtime
                .publish(mid, tick_message(ts + ms, 50.0 + i as f64))
                .unwrap();
        }
        // Keep the sink within the arena's recycling slack.
        std::thread::sleep(Duration::from_micros(50));
    }

    // One synchronized event per leader tick; the sink may miss a few whose
    // arena slots were recycled while it lagged.
    assert!(wait_until(Duration::from_secs(10), || {
        events.lock().len() as u64 >= leader_ticks - 5
    }));
    runtime
        .stop(dag, crate::executor::StopMode::Drain)
        .unwrap();
    assert_eq!(
        runtime.unit_metrics(profile.node).unwrap().messages_out,
        leader_ticks
    );
    let events = events.lock();

    let mut previous_ts = 0;
    for (event_ts, header, ticks) in events.iter() {
        assert!(*event_ts >= previous_ts, "synchronized timestamps regressed");
        previous_ts = *event_ts;
        assert_eq!(ticks.len(), header.stream_count as usize);
        for tick in ticks {
            assert!(tick.timestamp_ns <= header.leader_ts);
        }
    }
    // Steady state: every event carries a value for all three streams.
    let (_, last_header, last_ticks) = events.last().unwrap();
    assert_eq!(last_header.stream_count, 3);
    assert_eq!(last_ticks.len(), 3);
    assert_eq!(last_header.leader, 0);

    runtime.shutdown().unwrap();
}

#[test]
fn bars_flow_through_the_arena() {
    let runtime = runtime();
    let session = runtime.create_session();
    let dag = runtime.create_dag(session);

    let batch = runtime
        .add_node(dag, UnitSpec::Batch { ticks_per_bar: 10 })
        .unwrap();
    let (sink_unit, groups) = crate::tests::units::RecordingUnit::new();
    let sink = runtime
        .add_node(dag, UnitSpec::External(Box::new(sink_unit)))
        .unwrap();
    runtime
        .connect(dag, batch, DEFAULT_PORT_HANDLE, sink, 0)
        .unwrap();
    runtime.finalize(dag).unwrap();

    let stream = runtime.create_stream();
    runtime.subscribe(Topic::stream(stream), batch, 0).unwrap();
    runtime.start(dag).unwrap();
    for ts in 1..=40u64 {
        runtime.publish(stream, tick_message(ts, ts as f64)).unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || {
        groups.lock().iter().flatten().count() == 4
    }));
    let groups = groups.lock();
    for message in groups.iter().flatten() {
        assert_eq!(message.kind, TypeTag::BAR);
        assert!(message.arena_handle().is_some());
    }

    runtime.shutdown().unwrap();
}
