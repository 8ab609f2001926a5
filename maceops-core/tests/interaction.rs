use approx::assert_relative_eq;
use maceops_core::{
    DegreeLayout, Device, ElementalLinear, Error, Graph, InvariantInteraction,
    InvariantMessagePassing, InvariantResidualInteraction, Linear, LinearInstruction, Tensor,
};

const C_IN: usize = 4;
const C: usize = 3;
const ELEMENTS: usize = 2;

fn layers(seed: u64) -> (Linear<f64>, InvariantMessagePassing, Linear<f64>, ElementalLinear<f64>) {
    let dev = Device::Cpu;
    let layout = DegreeLayout::new(1);
    let up_w = Tensor::randn_seeded((1, C_IN, C), 0.0, 1.0, seed, &dev).unwrap();
    let linear_up = Linear::dense(DegreeLayout::new(0), C_IN, C, &up_w).unwrap();
    let tp = InvariantMessagePassing::new(layout.clone(), C).unwrap();
    let w = Tensor::randn_seeded((2, C, C), 0.0, 1.0, seed + 1, &dev).unwrap();
    let linear = Linear::dense(layout.clone(), C, C, &w).unwrap();
    let instructions = vec![
        LinearInstruction::normalized(0, C),
        LinearInstruction::normalized(1, C),
    ];
    let skip_w = Tensor::randn_seeded((ELEMENTS, 2 * C * C), 0.0, 1.0, seed + 2, &dev).unwrap();
    let skip = ElementalLinear::new(layout, C, C, ELEMENTS, instructions, &skip_w).unwrap();
    (linear_up, tp, linear, skip)
}

#[test]
fn forward_composes_the_layers() {
    let dev = Device::Cpu;
    let graph = Graph::from_edges(4, &[(1, 0), (2, 0), (0, 1), (3, 2), (0, 2), (1, 2)]).unwrap();
    let element = [0u32, 1, 1, 0];
    let nodes = Tensor::<f64>::randn_seeded((4, C_IN), 0.0, 1.0, 1, &dev).unwrap();
    let y = Tensor::<f64>::randn_seeded((6, 4), 0.0, 1.0, 2, &dev).unwrap();
    let r = Tensor::<f64>::randn_seeded((6, 2, C), 0.0, 1.0, 3, &dev).unwrap();
    let (linear_up, tp, linear, skip) = layers(10);
    let avg = 2.5;

    let up = linear_up
        .forward(&nodes.reshape((4, 1, C_IN)).unwrap())
        .unwrap()
        .reshape((4, C))
        .unwrap();
    let message = tp.forward_nodes(&up, &y, &r, &graph).unwrap();
    let message = linear.forward(&message).unwrap();
    let scaled: Vec<f64> = message.to_vec().unwrap().iter().map(|v| v / avg).collect();
    let scaled = Tensor::from_vec(scaled, (4, 4, C), &dev).unwrap();
    let expected = skip.forward(&scaled, &element).unwrap().to_vec().unwrap();

    let block = InvariantInteraction::new(linear_up, tp, linear, Some(skip), avg).unwrap();
    let out = block.forward(&nodes, &element, &y, &r, &graph).unwrap();
    assert_eq!(out.dims(), &[4, 4, C]);
    for (a, b) in out.to_vec().unwrap().iter().zip(&expected) {
        assert_relative_eq!(*a, *b, epsilon = 1e-12, max_relative = 1e-10);
    }
    // Node 3 receives nothing.
    assert!(out.to_vec().unwrap()[3 * 4 * C..].iter().all(|&v| v == 0.0));
}

#[test]
fn rejects_incompatible_layers() {
    let (linear_up, tp, linear, skip) = layers(20);
    let err = InvariantInteraction::new(
        linear_up.clone(),
        tp.clone(),
        linear.clone(),
        Some(skip.clone()),
        0.0,
    )
    .unwrap_err();
    assert!(matches!(err.inner(), Error::UnsupportedConfiguration(_)), "{err}");

    let wide = InvariantMessagePassing::new(DegreeLayout::new(2), C).unwrap();
    let err = InvariantInteraction::new(linear_up.clone(), wide, linear.clone(), None, 1.0)
        .unwrap_err();
    assert!(matches!(err.inner(), Error::UnsupportedConfiguration(_)), "{err}");

    let err = InvariantInteraction::new(linear.clone(), tp, linear, Some(skip), 1.0).unwrap_err();
    assert!(matches!(err.inner(), Error::UnsupportedConfiguration(_)), "{err}");
}

#[test]
fn element_length_is_checked_without_a_skip() {
    let dev = Device::Cpu;
    let graph = Graph::from_edges(3, &[(1, 0), (2, 0), (0, 1)]).unwrap();
    let nodes = Tensor::<f64>::randn_seeded((3, C_IN), 0.0, 1.0, 4, &dev).unwrap();
    let y = Tensor::<f64>::randn_seeded((3, 4), 0.0, 1.0, 5, &dev).unwrap();
    let r = Tensor::<f64>::randn_seeded((3, 2, C), 0.0, 1.0, 6, &dev).unwrap();
    let (linear_up, tp, linear, skip) = layers(30);

    let block = InvariantInteraction::new(linear_up.clone(), tp.clone(), linear.clone(), None, 1.0)
        .unwrap();
    let err = block.forward(&nodes, &[], &y, &r, &graph).unwrap_err();
    assert!(matches!(err.inner(), Error::ShapeMismatch { .. }), "{err}");
    assert_eq!(block.forward(&nodes, &[0, 0, 0], &y, &r, &graph).unwrap().dims(), &[3, 4, C]);

    let block = InvariantInteraction::new(linear_up, tp, linear, Some(skip), 1.0).unwrap();
    let err = block.forward(&nodes, &[0, 1, 2], &y, &r, &graph).unwrap_err();
    assert!(matches!(err.inner(), Error::UnsupportedConfiguration(_)), "{err}");
}

fn residual_skip(seed: u64) -> ElementalLinear<f64> {
    let w = Tensor::randn_seeded((ELEMENTS, C_IN * 5), 0.0, 1.0, seed, &Device::Cpu).unwrap();
    let instructions = vec![LinearInstruction::normalized(0, C_IN)];
    ElementalLinear::new(DegreeLayout::new(0), C_IN, 5, ELEMENTS, instructions, &w).unwrap()
}

#[test]
fn residual_returns_message_and_skip() {
    let dev = Device::Cpu;
    let graph = Graph::from_edges(4, &[(1, 0), (2, 0), (0, 1), (3, 2), (0, 2), (1, 2)]).unwrap();
    let element = [1u32, 0, 1, 1];
    let nodes = Tensor::<f64>::randn_seeded((4, C_IN), 0.0, 1.0, 7, &dev).unwrap();
    let y = Tensor::<f64>::randn_seeded((6, 4), 0.0, 1.0, 8, &dev).unwrap();
    let r = Tensor::<f64>::randn_seeded((6, 2, C), 0.0, 1.0, 9, &dev).unwrap();
    let (linear_up, tp, linear, _) = layers(40);
    let skip = residual_skip(41);
    let avg = 3.0;

    let expected_sc = skip
        .forward(&nodes.reshape((4, 1, C_IN)).unwrap(), &element)
        .unwrap()
        .to_vec()
        .unwrap();
    let plain = InvariantInteraction::new(linear_up.clone(), tp.clone(), linear.clone(), None, avg)
        .unwrap();
    let expected_message = plain.forward(&nodes, &element, &y, &r, &graph).unwrap().to_vec().unwrap();

    let block = InvariantResidualInteraction::new(linear_up, tp, linear, skip, avg).unwrap();
    let (message, sc) = block.forward(&nodes, &element, &y, &r, &graph).unwrap();
    assert_eq!(message.dims(), &[4, 4, C]);
    assert_eq!(sc.dims(), &[4, 5]);
    assert_eq!(message.to_vec().unwrap(), expected_message);
    for (a, b) in sc.to_vec().unwrap().iter().zip(&expected_sc) {
        assert_relative_eq!(*a, *b, epsilon = 1e-12, max_relative = 1e-10);
    }
    // The skip sees the raw features, so an isolated node still has one.
    assert!(sc.to_vec().unwrap()[3 * 5..].iter().any(|&v| v != 0.0));
    assert!(message.to_vec().unwrap()[3 * 4 * C..].iter().all(|&v| v == 0.0));

    let err = block.forward(&nodes, &element[..3], &y, &r, &graph).unwrap_err();
    assert!(matches!(err.inner(), Error::ShapeMismatch { .. }), "{err}");
}

#[test]
fn residual_skip_must_take_scalar_features() {
    let (linear_up, tp, linear, skip) = layers(50);
    let err = InvariantResidualInteraction::new(linear_up, tp, linear, skip, 1.0).unwrap_err();
    assert!(matches!(err.inner(), Error::UnsupportedConfiguration(_)), "{err}");
}
