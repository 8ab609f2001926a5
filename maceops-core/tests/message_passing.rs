use approx::assert_relative_eq;
use maceops_core::{
    DegreeLayout, Device, Error, Graph, InvariantMessagePassing, KernelConfig, Tensor,
};
use proptest::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Random graph with `nedges` edges whose receivers are sorted.
fn random_graph(nnodes: usize, nedges: usize, seed: u64) -> Graph {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut receiver: Vec<u32> = (0..nedges)
        .map(|_| rng.random_range(0..nnodes as u32))
        .collect();
    receiver.sort_unstable();
    let sender = (0..nedges)
        .map(|_| rng.random_range(0..nnodes as u32))
        .collect();
    Graph::new(nnodes, sender, receiver).unwrap()
}

/// Per-node sum over incoming edges, evaluated directly.
fn naive_forward(
    layout: &DegreeLayout,
    channels: usize,
    graph: &Graph,
    x: &[f64],
    y: &[f64],
    r: &[f64],
) -> Vec<f64> {
    let (m_dim, l_dim) = (layout.num_components(), layout.num_degrees());
    let mut out = vec![0.0; graph.nnodes() * m_dim * channels];
    for (i, &n) in graph.receiver().iter().enumerate() {
        for m in 0..m_dim {
            let l = layout.degree_of(m);
            for c in 0..channels {
                out[(n as usize * m_dim + m) * channels + c] +=
                    x[i * channels + c] * y[i * m_dim + m] * r[(i * l_dim + l) * channels + c];
            }
        }
    }
    out
}

struct Inputs {
    x: Tensor<f64>,
    y: Tensor<f64>,
    r: Tensor<f64>,
}

fn random_inputs(layout: &DegreeLayout, channels: usize, graph: &Graph, seed: u64, dev: &Device) -> Inputs {
    let e = graph.nedges();
    Inputs {
        x: Tensor::randn_seeded((e, channels), 0.0, 1.0, seed, dev).unwrap(),
        y: Tensor::randn_seeded((e, layout.num_components()), 0.0, 1.0, seed + 1, dev).unwrap(),
        r: Tensor::randn_seeded((e, layout.num_degrees(), channels), 0.0, 1.0, seed + 2, dev)
            .unwrap(),
    }
}

/// `sum(forward(x, y, r) * g)`
fn loss(tp: &InvariantMessagePassing, graph: &Graph, x: &[f64], y: &[f64], r: &[f64], g: &[f64], dims: &Inputs) -> f64 {
    let dev = Device::Cpu;
    let x = Tensor::from_slice(x, dims.x.shape().clone(), &dev).unwrap();
    let y = Tensor::from_slice(y, dims.y.shape().clone(), &dev).unwrap();
    let r = Tensor::from_slice(r, dims.r.shape().clone(), &dev).unwrap();
    let out = tp.forward(&x, &y, &r, graph).unwrap().to_vec().unwrap();
    out.iter().zip(g).map(|(o, g)| o * g).sum()
}

macro_rules! test_for_device {
    ($dev:expr, $name:ident) => {
        mod $name {
            use super::*;

            fn device() -> Device {
                $dev
            }

            #[test]
            fn three_node_scenario() {
                let dev = device();
                let graph = Graph::from_edges(3, &[(0, 1), (1, 1), (2, 2)]).unwrap();
                let tp = InvariantMessagePassing::new(DegreeLayout::new(0), 1).unwrap();
                let x = Tensor::<f32>::from_vec(vec![2.0, 3.0, 5.0], (3, 1), &dev).unwrap();
                let y = Tensor::<f32>::ones((3, 1), &dev).unwrap();
                let r = Tensor::<f32>::ones((3, 1, 1), &dev).unwrap();

                let out = tp.forward(&x, &y, &r, &graph).unwrap();
                assert_eq!(out.dims(), &[3, 1, 1]);
                assert_eq!(out.to_vec().unwrap(), vec![0.0, 5.0, 5.0]);
            }

            #[test]
            fn forward_matches_naive_sum() {
                let dev = device();
                let layout = DegreeLayout::new(3);
                let channels = 8;
                let graph = random_graph(40, 300, 7);
                let inputs = random_inputs(&layout, channels, &graph, 11, &dev);
                let tp = InvariantMessagePassing::new(layout.clone(), channels).unwrap();

                let out = tp
                    .forward(&inputs.x, &inputs.y, &inputs.r, &graph)
                    .unwrap()
                    .to_vec()
                    .unwrap();
                let expected = naive_forward(
                    &layout,
                    channels,
                    &graph,
                    &inputs.x.to_vec().unwrap(),
                    &inputs.y.to_vec().unwrap(),
                    &inputs.r.to_vec().unwrap(),
                );
                for (o, e) in out.iter().zip(&expected) {
                    assert_relative_eq!(*o, *e, epsilon = 1e-10, max_relative = 1e-9);
                }
            }

            #[test]
            fn forward_f32_within_tolerance() {
                let dev = device();
                let layout = DegreeLayout::new(2);
                let channels = 4;
                let graph = random_graph(12, 80, 3);
                let e = graph.nedges();
                let x = Tensor::<f32>::rand_seeded((e, channels), -1.0, 1.0, 1, &dev).unwrap();
                let y = Tensor::<f32>::rand_seeded((e, 9), -1.0, 1.0, 2, &dev).unwrap();
                let r = Tensor::<f32>::rand_seeded((e, 3, channels), -1.0, 1.0, 3, &dev).unwrap();
                let tp = InvariantMessagePassing::new(layout.clone(), channels).unwrap();

                let out = tp.forward(&x, &y, &r, &graph).unwrap().to_vec().unwrap();
                let widen = |t: &Tensor<f32>| -> Vec<f64> {
                    t.to_vec().unwrap().into_iter().map(f64::from).collect()
                };
                let expected = naive_forward(&layout, channels, &graph, &widen(&x), &widen(&y), &widen(&r));
                for (o, e) in out.iter().zip(&expected) {
                    assert_relative_eq!(*o as f64, *e, epsilon = 1e-5, max_relative = 1e-5);
                }
            }

            #[test]
            fn nodes_without_edges_are_zero() {
                let dev = device();
                let graph = Graph::from_edges(4, &[(0, 1), (2, 1)]).unwrap();
                let tp = InvariantMessagePassing::new(DegreeLayout::new(1), 2).unwrap();
                let x = Tensor::<f64>::ones((2, 2), &dev).unwrap();
                let y = Tensor::<f64>::ones((2, 4), &dev).unwrap();
                let r = Tensor::<f64>::ones((2, 2, 2), &dev).unwrap();
                let out = tp.forward(&x, &y, &r, &graph).unwrap().to_vec().unwrap();
                assert!(out[..8].iter().all(|&v| v == 0.0));
                assert!(out[8..16].iter().all(|&v| v == 2.0));
                assert!(out[16..].iter().all(|&v| v == 0.0));
            }

            #[test]
            fn radial_degree_axis_is_checked() {
                let dev = device();
                let graph = Graph::from_edges(2, &[(0, 1)]).unwrap();
                let tp = InvariantMessagePassing::new(DegreeLayout::new(1), 1).unwrap();
                let x = Tensor::<f32>::ones((1, 1), &dev).unwrap();
                let y = Tensor::<f32>::ones((1, 4), &dev).unwrap();
                let r = Tensor::<f32>::ones((1, 1, 1), &dev).unwrap();
                let err = tp.forward(&x, &y, &r, &graph).unwrap_err();
                assert!(matches!(err.inner(), Error::ShapeMismatch { .. }), "{err}");
            }

            #[test]
            fn backward_matches_cpu_reference() {
                let dev = device();
                let layout = DegreeLayout::new(2);
                let channels = 3;
                let graph = random_graph(10, 50, 5);
                let inputs = random_inputs(&layout, channels, &graph, 21, &dev);
                let g = Tensor::<f64>::randn_seeded((10, 9, channels), 0.0, 1.0, 4, &dev).unwrap();
                let tp = InvariantMessagePassing::new(layout, channels).unwrap();

                let on_dev = tp.backward(&inputs.x, &inputs.y, &inputs.r, &graph, &g).unwrap();
                let cpu = Device::Cpu;
                let on_cpu = tp
                    .backward(
                        &inputs.x.to_device(&cpu).unwrap(),
                        &inputs.y.to_device(&cpu).unwrap(),
                        &inputs.r.to_device(&cpu).unwrap(),
                        &graph,
                        &g.to_device(&cpu).unwrap(),
                    )
                    .unwrap();
                for (a, b) in [
                    (&on_dev.edge_feature, &on_cpu.edge_feature),
                    (&on_dev.edge_harmonic, &on_cpu.edge_harmonic),
                    (&on_dev.edge_radial, &on_cpu.edge_radial),
                ] {
                    assert_eq!(a.dims(), b.dims());
                    for (x, y) in a.to_vec().unwrap().iter().zip(b.to_vec().unwrap()) {
                        assert_relative_eq!(*x, y, epsilon = 1e-10, max_relative = 1e-9);
                    }
                }
            }
        }
    };
}

test_for_device!(Device::Cpu, cpu_tests);
#[cfg(feature = "cuda")]
test_for_device!(Device::cuda(0).unwrap(), cuda_tests);

#[test]
fn unsorted_receiver_is_rejected() {
    let err = Graph::new(3, vec![0, 1, 2], vec![1, 0, 2]).unwrap_err();
    assert!(matches!(err.inner(), Error::InvalidGraph(_)), "{err}");
}

#[test]
fn out_of_range_sender_is_rejected() {
    let err = Graph::new(2, vec![0, 5], vec![0, 1]).unwrap_err();
    assert!(matches!(err.inner(), Error::InvalidGraph(_)), "{err}");
}

#[test]
fn backward_matches_finite_differences() {
    let layout = DegreeLayout::new(1);
    let channels = 2;
    let graph = random_graph(5, 12, 9);
    let dev = Device::Cpu;
    let inputs = random_inputs(&layout, channels, &graph, 31, &dev);
    let g = Tensor::<f64>::randn_seeded((5, 4, channels), 0.0, 1.0, 8, &dev).unwrap();
    let tp = InvariantMessagePassing::new(layout, channels).unwrap();
    let grads = tp.backward(&inputs.x, &inputs.y, &inputs.r, &graph, &g).unwrap();

    let (x, y, r, gv) = (
        inputs.x.to_vec().unwrap(),
        inputs.y.to_vec().unwrap(),
        inputs.r.to_vec().unwrap(),
        g.to_vec().unwrap(),
    );
    let h = 1e-6;
    let check = |which: usize, analytic: Vec<f64>| {
        for (k, expected) in analytic.iter().enumerate() {
            let mut plus = [x.clone(), y.clone(), r.clone()];
            let mut minus = [x.clone(), y.clone(), r.clone()];
            plus[which][k] += h;
            minus[which][k] -= h;
            let fd = (loss(&tp, &graph, &plus[0], &plus[1], &plus[2], &gv, &inputs)
                - loss(&tp, &graph, &minus[0], &minus[1], &minus[2], &gv, &inputs))
                / (2.0 * h);
            assert_relative_eq!(fd, *expected, epsilon = 1e-6, max_relative = 1e-5);
        }
    };
    check(0, grads.edge_feature.to_vec().unwrap());
    check(1, grads.edge_harmonic.to_vec().unwrap());
    check(2, grads.edge_radial.to_vec().unwrap());
}

#[test]
fn node_forward_gathers_by_sender() {
    let layout = DegreeLayout::new(1);
    let channels = 3;
    let graph = random_graph(6, 20, 13);
    let dev = Device::Cpu;
    let inputs = random_inputs(&layout, channels, &graph, 41, &dev);
    let nodes = Tensor::<f64>::randn_seeded((6, channels), 0.0, 1.0, 5, &dev).unwrap();
    let tp = InvariantMessagePassing::new(layout, channels).unwrap();

    let node_data = nodes.to_vec().unwrap();
    let gathered: Vec<f64> = graph
        .sender()
        .iter()
        .flat_map(|&s| node_data[s as usize * channels..(s as usize + 1) * channels].to_vec())
        .collect();
    let gathered = Tensor::from_vec(gathered, (graph.nedges(), channels), &dev).unwrap();

    let a = tp.forward_nodes(&nodes, &inputs.y, &inputs.r, &graph).unwrap();
    let b = tp.forward(&gathered, &inputs.y, &inputs.r, &graph).unwrap();
    assert_eq!(a.to_vec().unwrap(), b.to_vec().unwrap());
}

#[test]
fn node_backward_sums_edge_gradients_per_sender() {
    let layout = DegreeLayout::new(2);
    let channels = 4;
    let graph = random_graph(8, 70, 17);
    let dev = Device::Cpu;
    let inputs = random_inputs(&layout, channels, &graph, 51, &dev);
    let nodes = Tensor::<f64>::randn_seeded((8, channels), 0.0, 1.0, 6, &dev).unwrap();
    let g = Tensor::<f64>::randn_seeded((8, 9, channels), 0.0, 1.0, 7, &dev).unwrap();
    let config = KernelConfig::default().with_bucket_capacity(3);
    let tp = InvariantMessagePassing::with_config(layout, channels, config).unwrap();
    let index = tp.sender_index(&graph).unwrap();

    let grads = tp
        .backward_nodes(&nodes, &inputs.y, &inputs.r, &graph, &index, &g)
        .unwrap();

    let node_data = nodes.to_vec().unwrap();
    let gathered: Vec<f64> = graph
        .sender()
        .iter()
        .flat_map(|&s| node_data[s as usize * channels..(s as usize + 1) * channels].to_vec())
        .collect();
    let gathered = Tensor::from_vec(gathered, (graph.nedges(), channels), &dev).unwrap();
    let edge = tp.backward(&gathered, &inputs.y, &inputs.r, &graph, &g).unwrap();
    let per_edge = edge.edge_feature.to_vec().unwrap();

    let mut expected = vec![0.0; 8 * channels];
    for (i, &s) in graph.sender().iter().enumerate() {
        for c in 0..channels {
            expected[s as usize * channels + c] += per_edge[i * channels + c];
        }
    }
    assert_eq!(grads.node_feature.dims(), &[8, channels]);
    for (a, b) in grads.node_feature.to_vec().unwrap().iter().zip(&expected) {
        assert_relative_eq!(*a, *b, epsilon = 1e-10, max_relative = 1e-9);
    }
    assert_eq!(
        grads.edge_radial.to_vec().unwrap(),
        edge.edge_radial.to_vec().unwrap()
    );
}

#[test]
fn node_backward_is_deterministic_across_thread_counts() {
    let layout = DegreeLayout::new(1);
    let channels = 5;
    let graph = random_graph(16, 200, 23);
    let dev = Device::Cpu;
    let inputs = random_inputs(&layout, channels, &graph, 61, &dev);
    let nodes = Tensor::<f32>::randn_seeded((16, channels), 0.0, 1.0, 2, &dev).unwrap();
    let g = Tensor::<f32>::randn_seeded((16, 4, channels), 0.0, 1.0, 3, &dev).unwrap();
    let y = Tensor::<f32>::from_vec(
        inputs.y.to_vec().unwrap().into_iter().map(|v| v as f32).collect(),
        inputs.y.shape().clone(),
        &dev,
    )
    .unwrap();
    let r = Tensor::<f32>::from_vec(
        inputs.r.to_vec().unwrap().into_iter().map(|v| v as f32).collect(),
        inputs.r.shape().clone(),
        &dev,
    )
    .unwrap();

    let run = |threads: usize| {
        let config = KernelConfig::default()
            .with_bucket_capacity(4)
            .with_num_threads(threads);
        let tp = InvariantMessagePassing::with_config(layout.clone(), channels, config).unwrap();
        let index = tp.sender_index(&graph).unwrap();
        tp.backward_nodes(&nodes, &y, &r, &graph, &index, &g)
            .unwrap()
            .node_feature
            .to_vec()
            .unwrap()
    };
    assert_eq!(run(1), run(4));
}

#[test]
fn sender_index_must_match_graph() {
    let graph = random_graph(6, 10, 1);
    let other = random_graph(7, 10, 1);
    let tp = InvariantMessagePassing::new(DegreeLayout::new(0), 1).unwrap();
    let dev = Device::Cpu;
    let nodes = Tensor::<f32>::ones((6, 1), &dev).unwrap();
    let y = Tensor::<f32>::ones((10, 1), &dev).unwrap();
    let r = Tensor::<f32>::ones((10, 1, 1), &dev).unwrap();
    let g = Tensor::<f32>::ones((6, 1, 1), &dev).unwrap();
    let index = other.sender_index(64).unwrap();
    let err = tp
        .backward_nodes(&nodes, &y, &r, &graph, &index, &g)
        .unwrap_err();
    assert!(matches!(err.inner(), Error::ShapeMismatch { .. }), "{err}");
}

#[test]
fn node_backward_checks_operands_before_gathering() {
    let graph = random_graph(6, 10, 2);
    let tp = InvariantMessagePassing::new(DegreeLayout::new(1), 2).unwrap();
    let dev = Device::Cpu;
    let index = tp.sender_index(&graph).unwrap();
    let nodes = Tensor::<f32>::ones((5, 2), &dev).unwrap();
    let y = Tensor::<f32>::ones((10, 4), &dev).unwrap();
    let r = Tensor::<f32>::ones((10, 2, 2), &dev).unwrap();
    let g = Tensor::<f32>::ones((6, 3, 2), &dev).unwrap();

    let err = tp
        .backward_nodes(&nodes, &y, &r, &graph, &index, &g)
        .unwrap_err();
    match err.inner() {
        Error::ShapeMismatch { op, .. } => {
            assert_eq!(*op, "InvariantMessagePassing::backward_nodes", "{err}")
        }
        other => panic!("unexpected error {other}"),
    }

    let r = Tensor::<f32>::ones((10, 3, 2), &dev).unwrap();
    let err = tp.forward_nodes(&nodes, &y, &r, &graph).unwrap_err();
    match err.inner() {
        Error::ShapeMismatch { op, .. } => {
            assert_eq!(*op, "InvariantMessagePassing::forward_nodes", "{err}")
        }
        other => panic!("unexpected error {other}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn segmented_reduction_matches_naive(
        nnodes in 1usize..24,
        nedges in 0usize..120,
        lmax in 0usize..3,
        channels in 1usize..6,
        min_rows in 1usize..5,
        seed in any::<u64>(),
    ) {
        let layout = DegreeLayout::new(lmax);
        let graph = random_graph(nnodes, nedges, seed);
        let dev = Device::Cpu;
        let inputs = random_inputs(&layout, channels, &graph, seed ^ 0x5eed, &dev);
        let config = KernelConfig::default().with_min_rows_per_task(min_rows);
        let tp = InvariantMessagePassing::with_config(layout.clone(), channels, config).unwrap();

        let out = tp.forward(&inputs.x, &inputs.y, &inputs.r, &graph).unwrap().to_vec().unwrap();
        let expected = naive_forward(
            &layout,
            channels,
            &graph,
            &inputs.x.to_vec().unwrap(),
            &inputs.y.to_vec().unwrap(),
            &inputs.r.to_vec().unwrap(),
        );
        prop_assert_eq!(out.len(), expected.len());
        for (o, e) in out.iter().zip(&expected) {
            prop_assert!((o - e).abs() <= 1e-9 * (1.0 + e.abs()), "{} vs {}", o, e);
        }
    }
}
