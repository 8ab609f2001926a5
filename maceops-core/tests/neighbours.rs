use maceops_core::{Error, Graph, NeighbourIndex, PAD};
use proptest::prelude::*;

#[test]
fn spills_into_consecutive_buckets() {
    let receiver = [0, 0, 0, 0, 0, 2, 2];
    let index = NeighbourIndex::build(&receiver, 4, 2).unwrap();

    assert_eq!(index.nnodes(), 4);
    assert_eq!(index.nedges(), 7);
    assert_eq!(index.num_buckets(), 4);
    assert_eq!(index.buckets(0), 0..3);
    assert_eq!(index.buckets(1), 3..3);
    assert_eq!(index.buckets(2), 3..4);
    assert_eq!(index.buckets(3), 4..4);

    assert_eq!(index.bucket(0), &[0, 1]);
    assert_eq!(index.bucket(1), &[2, 3]);
    assert_eq!(index.bucket(2), &[4]);
    assert_eq!(index.padded_bucket(2), &[4, PAD]);
    assert_eq!(index.bucket(3), &[5, 6]);
    assert_eq!(
        (0..4).map(|b| index.bucket_node(b)).collect::<Vec<_>>(),
        vec![0, 0, 0, 2]
    );
}

#[test]
fn counts_match_in_degree() {
    let graph = Graph::new(5, vec![4, 3, 2, 1, 0, 0], vec![0, 1, 1, 1, 3, 4]).unwrap();
    let index = graph.receiver_index(64).unwrap();
    for n in 0..5 {
        assert_eq!(index.count(n), graph.in_degree(n));
    }
    assert_eq!(index.count(2), 0);
    assert!(index.buckets(2).is_empty());
    assert_eq!(index.edges(1).collect::<Vec<_>>(), vec![1, 2, 3]);
}

#[test]
fn unsorted_receiver_is_invalid() {
    let err = NeighbourIndex::build(&[0, 2, 1], 3, 4).unwrap_err();
    assert!(matches!(err.inner(), Error::InvalidGraph(_)), "{err}");
}

#[test]
fn out_of_range_receiver_is_invalid() {
    let err = NeighbourIndex::build(&[0, 3], 3, 4).unwrap_err();
    assert!(matches!(err.inner(), Error::InvalidGraph(_)), "{err}");
}

#[test]
fn zero_capacity_is_unsupported() {
    let err = NeighbourIndex::build(&[0, 1], 2, 0).unwrap_err();
    assert!(matches!(err.inner(), Error::UnsupportedConfiguration(_)), "{err}");
}

#[test]
fn empty_graph_has_no_buckets() {
    let index = NeighbourIndex::build(&[], 3, 8).unwrap();
    assert_eq!(index.num_buckets(), 0);
    assert!((0..3).all(|n| index.count(n) == 0));
}

#[test]
fn group_by_keeps_edge_order_per_node() {
    let sender = [2, 0, 2, 1, 0, 2];
    let index = NeighbourIndex::group_by(&sender, 3, 2).unwrap();
    assert_eq!(index.edges(0).collect::<Vec<_>>(), vec![1, 4]);
    assert_eq!(index.edges(1).collect::<Vec<_>>(), vec![3]);
    assert_eq!(index.edges(2).collect::<Vec<_>>(), vec![0, 2, 5]);
    assert_eq!(index.buckets(2).len(), 2);
}

proptest! {
    #[test]
    fn every_edge_is_listed_once_under_its_key(
        keys in prop::collection::vec(0u32..12, 0..200),
        capacity in 1usize..9,
    ) {
        let index = NeighbourIndex::group_by(&keys, 12, capacity).unwrap();
        let mut seen = vec![false; keys.len()];
        for node in 0..12 {
            let edges: Vec<u32> = index.edges(node).collect();
            prop_assert_eq!(edges.len(), index.count(node));
            prop_assert!(edges.windows(2).all(|w| w[0] < w[1]));
            for e in edges {
                prop_assert_eq!(keys[e as usize] as usize, node);
                prop_assert!(!seen[e as usize]);
                seen[e as usize] = true;
            }
            for b in index.buckets(node) {
                prop_assert_eq!(index.bucket_node(b), node);
                prop_assert!(!index.bucket(b).is_empty());
                prop_assert!(index.bucket(b).len() <= capacity);
            }
        }
        prop_assert!(seen.into_iter().all(|s| s));
    }
}
