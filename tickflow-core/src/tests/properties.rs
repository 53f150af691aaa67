//! Property-style checks over the builder and queues.

use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use tickflow_types::ids::SessionId;

use crate::broker::MessageBroker;
use crate::dag::DagManager;
use crate::errors::ExecutionError;
use crate::node::DEFAULT_PORT_HANDLE;
use crate::pool::NodePool;
use crate::queue::spsc::Ring;
use crate::units::UnitSpec;

fn manager(pool_capacity: usize) -> DagManager {
    let pool = Arc::new(NodePool::with_capacity(pool_capacity));
    let broker = Arc::new(MessageBroker::new(64, false));
    DagManager::new(pool, broker, 8, 8)
}

proptest! {
    /// Any forward-edge graph finalizes, and the cached order contains every
    /// node exactly once with each predecessor ahead of its successor.
    #[test]
    fn toposort_linearizes_every_acyclic_graph(
        edges in prop::collection::vec((0usize..10, 0usize..10), 0..40)
    ) {
        let manager = manager(16);
        let dag = manager.create_dag(SessionId::from_parts(1, 1));
        let nodes: Vec<_> = (0..10)
            .map(|_| manager.add_node(dag, UnitSpec::Tick).unwrap())
            .collect();

        let mut added = HashSet::new();
        let mut accepted = Vec::new();
        for (from, to) in edges {
            if from >= to || !added.insert((from, to)) {
                continue;
            }
            // Fan limits may reject some edges; only accepted ones must be
            // honored by the order.
            if manager
                .connect(dag, nodes[from], DEFAULT_PORT_HANDLE, nodes[to], 0)
                .is_ok()
            {
                accepted.push((from, to));
            }
        }

        manager.finalize(dag).unwrap();
        let plan = manager.entry(dag).unwrap().plan().unwrap();

        let mut seen = plan.topo.clone();
        seen.sort();
        let mut expected = nodes.clone();
        expected.sort();
        prop_assert_eq!(seen, expected);

        let position: std::collections::HashMap<_, _> = plan
            .topo
            .iter()
            .enumerate()
            .map(|(position, id)| (*id, position))
            .collect();
        for (from, to) in accepted {
            prop_assert!(position[&nodes[from]] < position[&nodes[to]]);
        }
    }

    /// Closing any chain back onto its head is always caught at finalize.
    #[test]
    fn back_edges_always_fail_finalize(length in 3usize..8) {
        let manager = manager(16);
        let dag = manager.create_dag(SessionId::from_parts(1, 1));
        let nodes: Vec<_> = (0..length)
            .map(|_| manager.add_node(dag, UnitSpec::Tick).unwrap())
            .collect();
        for pair in nodes.windows(2) {
            manager
                .connect(dag, pair[0], DEFAULT_PORT_HANDLE, pair[1], 0)
                .unwrap();
        }
        manager
            .connect(dag, nodes[length - 1], DEFAULT_PORT_HANDLE, nodes[0], 0)
            .unwrap();

        prop_assert_eq!(
            manager.finalize(dag),
            Err(ExecutionError::CycleDetected {
                from: nodes[length - 1],
                to: nodes[0],
            })
        );
    }

    /// Whatever interleaving of pushes and pops happens, the popped sequence
    /// is exactly a prefix-respecting replay of the pushed one.
    #[test]
    fn spsc_pops_replay_pushes_in_order(ops in prop::collection::vec(any::<bool>(), 0..200)) {
        let ring = Ring::with_capacity(8);
        let mut next_push = 0u64;
        let mut next_pop = 0u64;
        for push in ops {
            if push {
                if ring.push(next_push).is_ok() {
                    next_push += 1;
                }
            } else if let Some(value) = ring.pop() {
                prop_assert_eq!(value, next_pop);
                next_pop += 1;
            }
        }
        prop_assert!(next_pop <= next_push);
    }
}
