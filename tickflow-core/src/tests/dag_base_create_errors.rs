//! Builder-level validation: lifecycle rules, limits and cycle detection.

use std::sync::Arc;

use tickflow_types::ids::SessionId;
use tickflow_types::message::TypeTag;

use crate::broker::MessageBroker;
use crate::dag::{DagManager, DagState};
use crate::errors::ExecutionError;
use crate::node::DEFAULT_PORT_HANDLE;
use crate::pool::NodePool;
use crate::units::UnitSpec;

fn manager(pool_capacity: usize) -> DagManager {
    let pool = Arc::new(NodePool::with_capacity(pool_capacity));
    let broker = Arc::new(MessageBroker::new(64, false));
    DagManager::new(pool, broker, 2, 2)
}

fn session() -> SessionId {
    SessionId::from_parts(1, 1)
}

#[test]
fn cycle_is_reported_with_its_back_edge() {
    let manager = manager(8);
    let dag = manager.create_dag(session());
    let a = manager.add_node(dag, UnitSpec::Tick).unwrap();
    let b = manager.add_node(dag, UnitSpec::Tick).unwrap();
    let c = manager.add_node(dag, UnitSpec::Tick).unwrap();
    manager.connect(dag, a, DEFAULT_PORT_HANDLE, b, 0).unwrap();
    manager.connect(dag, b, DEFAULT_PORT_HANDLE, c, 0).unwrap();
    manager.connect(dag, c, DEFAULT_PORT_HANDLE, a, 0).unwrap();

    assert_eq!(
        manager.finalize(dag),
        Err(ExecutionError::CycleDetected { from: c, to: a })
    );
    // The dag stays in Building so the caller can tear it down.
    assert_eq!(manager.entry(dag).unwrap().state(), DagState::Building);
}

#[test]
fn self_loop_is_a_cycle() {
    let manager = manager(4);
    let dag = manager.create_dag(session());
    let a = manager.add_node(dag, UnitSpec::Tick).unwrap();
    manager.connect(dag, a, DEFAULT_PORT_HANDLE, a, 0).unwrap();
    assert_eq!(
        manager.finalize(dag),
        Err(ExecutionError::CycleDetected { from: a, to: a })
    );
}

#[test]
fn pool_exhaustion_then_reuse_after_destroy() {
    let manager = manager(4);
    let first = manager.create_dag(session());
    let _a = manager.add_node(first, UnitSpec::Tick).unwrap();
    let _b = manager.add_node(first, UnitSpec::Tick).unwrap();

    let second = manager.create_dag(session());
    let _c = manager.add_node(second, UnitSpec::Tick).unwrap();
    let _d = manager.add_node(second, UnitSpec::Tick).unwrap();
    assert_eq!(
        manager.add_node(second, UnitSpec::Tick).unwrap_err(),
        ExecutionError::PoolExhausted
    );

    // Destroying the two-node dag frees capacity.
    manager.destroy(first).unwrap();
    manager.add_node(second, UnitSpec::Tick).unwrap();
    manager.add_node(second, UnitSpec::Tick).unwrap();
}

#[test]
fn destroy_twice_reports_unknown_dag() {
    let manager = manager(4);
    let dag = manager.create_dag(session());
    manager.add_node(dag, UnitSpec::Tick).unwrap();
    manager.destroy(dag).unwrap();
    assert_eq!(manager.destroy(dag), Err(ExecutionError::UnknownDag(dag)));
}

#[test]
fn stale_node_handles_are_rejected() {
    let manager = manager(4);
    let dead = manager.create_dag(session());
    let stale = manager.add_node(dead, UnitSpec::Tick).unwrap();
    manager.destroy(dead).unwrap();

    let dag = manager.create_dag(session());
    let live = manager.add_node(dag, UnitSpec::Tick).unwrap();
    assert_eq!(
        manager.connect(dag, stale, DEFAULT_PORT_HANDLE, live, 0),
        Err(ExecutionError::UnknownNode(stale))
    );
}

#[test]
fn fan_limits_are_enforced() {
    // manager() caps fan-in and fan-out at 2.
    let manager = manager(8);
    let dag = manager.create_dag(session());
    let src = manager.add_node(dag, UnitSpec::Tick).unwrap();
    let a = manager.add_node(dag, UnitSpec::Tick).unwrap();
    let b = manager.add_node(dag, UnitSpec::Tick).unwrap();
    let c = manager.add_node(dag, UnitSpec::Tick).unwrap();

    manager.connect(dag, src, DEFAULT_PORT_HANDLE, a, 0).unwrap();
    manager.connect(dag, src, DEFAULT_PORT_HANDLE, b, 0).unwrap();
    assert_eq!(
        manager.connect(dag, src, DEFAULT_PORT_HANDLE, c, 0),
        Err(ExecutionError::FanOutExceeded(src))
    );

    let sink = manager.add_node(dag, UnitSpec::Tick).unwrap();
    manager.connect(dag, a, DEFAULT_PORT_HANDLE, sink, 0).unwrap();
    manager.connect(dag, b, DEFAULT_PORT_HANDLE, sink, 0).unwrap();
    assert_eq!(
        manager.connect(dag, c, DEFAULT_PORT_HANDLE, sink, 0),
        Err(ExecutionError::FanInExceeded(sink))
    );
}

#[test]
fn topology_is_frozen_after_finalize() {
    let manager = manager(8);
    let dag = manager.create_dag(session());
    let a = manager.add_node(dag, UnitSpec::Tick).unwrap();
    let b = manager.add_node(dag, UnitSpec::Tick).unwrap();
    manager.connect(dag, a, DEFAULT_PORT_HANDLE, b, 0).unwrap();
    manager.finalize(dag).unwrap();

    assert_eq!(
        manager.add_node(dag, UnitSpec::Tick).unwrap_err(),
        ExecutionError::ForbiddenWhileFinalized(dag)
    );
    assert_eq!(
        manager.connect(dag, a, DEFAULT_PORT_HANDLE, b, 0),
        Err(ExecutionError::ForbiddenWhileFinalized(dag))
    );
}

#[test]
fn mismatched_schemas_cannot_connect() {
    let manager = manager(4);
    let dag = manager.create_dag(session());
    let ticks = manager.add_node(dag, UnitSpec::Tick).unwrap();
    let bars = manager
        .add_node(
            dag,
            UnitSpec::Data {
                tag: TypeTag::BAR,
            },
        )
        .unwrap();
    assert_eq!(
        manager.connect(dag, ticks, DEFAULT_PORT_HANDLE, bars, 0),
        Err(ExecutionError::SchemaMismatch {
            src: ticks,
            src_port: DEFAULT_PORT_HANDLE,
            dst: bars,
            dst_port: 0,
        })
    );
}

#[test]
fn topological_order_is_deterministic_and_complete() {
    let manager = manager(8);
    let dag = manager.create_dag(session());
    let a = manager.add_node(dag, UnitSpec::Tick).unwrap();
    let b = manager.add_node(dag, UnitSpec::Tick).unwrap();
    let c = manager.add_node(dag, UnitSpec::Tick).unwrap();
    let d = manager.add_node(dag, UnitSpec::Tick).unwrap();
    // Diamond: a -> {b, c} -> d.
    manager.connect(dag, a, DEFAULT_PORT_HANDLE, b, 0).unwrap();
    manager.connect(dag, a, DEFAULT_PORT_HANDLE, c, 0).unwrap();
    manager.connect(dag, b, DEFAULT_PORT_HANDLE, d, 0).unwrap();
    manager.connect(dag, c, DEFAULT_PORT_HANDLE, d, 1).unwrap();
    manager.finalize(dag).unwrap();

    let plan = manager.entry(dag).unwrap().plan().unwrap();
    // Ascending-id tie break puts b before c.
    assert_eq!(plan.topo, vec![a, b, c, d]);
    assert_eq!(plan.sources, vec![a]);
}
