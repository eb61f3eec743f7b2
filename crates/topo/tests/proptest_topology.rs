//! Property-based tests for topology completion over random DAGs.

use kiln_topo::Topology;
use proptest::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Random DAG as per-node dependency lists (deps point at earlier
/// indices only), plus a random notify order over all nodes.
fn dag_with_order() -> impl Strategy<Value = (Vec<Vec<usize>>, Vec<usize>)> {
    (1..20usize).prop_flat_map(|n| {
        let mut per_node: Vec<BoxedStrategy<Vec<usize>>> = Vec::with_capacity(n);
        for i in 0..n {
            if i == 0 {
                per_node.push(Just(Vec::new()).boxed());
            } else {
                per_node.push(prop::collection::vec(0..i, 0..=i.min(3)).boxed());
            }
        }
        let order = Just((0..n).collect::<Vec<usize>>()).prop_shuffle();
        (per_node, order)
    })
}

fn key(i: usize) -> String {
    format!("t{i}")
}

proptest! {
    /// For any DAG, once every node has signalled completion, every ready
    /// callback fired exactly once and nothing is left uncompleted.
    #[test]
    fn prop_every_callback_fires_exactly_once((deps, order) in dag_with_order()) {
        let n = deps.len();
        let topo = Topology::new();
        let fired: Vec<Arc<AtomicUsize>> =
            (0..n).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        for i in 0..n {
            topo.add_node(key(i), i).unwrap();
        }
        for (i, node_deps) in deps.iter().enumerate() {
            let keys: Vec<String> = node_deps.iter().map(|&d| key(d)).collect();
            let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            topo.add_deps(&key(i), &refs).unwrap();
        }
        for i in 0..n {
            let counter = fired[i].clone();
            topo.schedule_node(&key(i), move |payload| {
                assert_eq!(payload, i);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        for &i in &order {
            topo.notify_dependants(&key(i)).unwrap();
        }

        for (i, counter) in fired.iter().enumerate() {
            prop_assert_eq!(counter.load(Ordering::SeqCst), 1, "node {} fired", i);
        }
        prop_assert!(topo.get_uncompleted().is_empty());
        prop_assert!(topo.get_unscheduled().is_empty());
        prop_assert_eq!(topo.replay().len(), n);
    }

    /// A merged group reports completion only after all members have
    /// individually signalled, in any order.
    #[test]
    fn prop_merged_group_completes_last(
        (k, order) in (2..6usize).prop_flat_map(|k| {
            (Just(k), Just((0..k).collect::<Vec<usize>>()).prop_shuffle())
        })
    ) {
        let topo = Topology::new();
        for i in 0..k {
            topo.add_node(format!("m{i}"), 0usize).unwrap();
        }
        for i in 1..k {
            topo.merge_nodes("m0", &format!("m{i}")).unwrap();
        }
        topo.add_node("down", 0usize).unwrap();
        topo.add_deps("down", &["m0"]).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        topo.schedule_node("down", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        for (seen, &i) in order.iter().enumerate() {
            prop_assert_eq!(fired.load(Ordering::SeqCst), 0);
            prop_assert!(!topo.get_uncompleted().is_empty());
            topo.notify_dependants(&format!("m{i}")).unwrap();
            if seen + 1 < k {
                prop_assert_eq!(fired.load(Ordering::SeqCst), 0);
            }
        }
        prop_assert_eq!(fired.load(Ordering::SeqCst), 1);

        let log = topo.replay();
        prop_assert_eq!(log.len(), 1);
        prop_assert_eq!(log[0].members.len(), k);
    }
}
