use approx::assert_relative_eq;
use maceops_core::{CubicSpline, Device, Error, Tensor};

fn sampled(n: usize, channels: usize) -> (Tensor<f64>, Tensor<f64>) {
    let grid: Vec<f64> = (0..n).map(|k| 0.5 + 4.5 * k as f64 / (n - 1) as f64).collect();
    let values = grid
        .iter()
        .flat_map(|&r| (0..channels).map(move |f| ((f + 1) as f64 * r).sin() / r))
        .collect();
    (
        Tensor::from_vec(grid, n, &Device::Cpu).unwrap(),
        Tensor::from_vec(values, (n, channels), &Device::Cpu).unwrap(),
    )
}

#[test]
fn reproduces_values_at_knots() {
    let (grid, values) = sampled(20, 3);
    let spline = CubicSpline::fit(&grid, &values).unwrap();
    let out = spline.evaluate(&grid).unwrap();
    assert_eq!(out.dims(), &[20, 3]);
    for (a, b) in out.to_vec().unwrap().iter().zip(values.to_vec().unwrap()) {
        assert_relative_eq!(*a, b, epsilon = 1e-12);
    }
}

#[test]
fn linear_data_stays_linear() {
    let grid = Tensor::<f64>::from_vec(vec![0.0, 1.0, 3.0, 4.0], 4, &Device::Cpu).unwrap();
    let values = Tensor::<f64>::from_vec(vec![1.0, 3.0, 7.0, 9.0], (4, 1), &Device::Cpu).unwrap();
    let spline = CubicSpline::fit(&grid, &values).unwrap();
    let x = Tensor::<f64>::from_vec(vec![0.25, 2.0, 3.5, 4.0], 4, &Device::Cpu).unwrap();
    let (v, d) = spline.evaluate_with_derivative(&x).unwrap();
    for (a, b) in v.to_vec().unwrap().iter().zip([1.5, 5.0, 8.0, 9.0]) {
        assert_relative_eq!(*a, b, epsilon = 1e-12);
    }
    assert!(d.to_vec().unwrap().iter().all(|&s| (s - 2.0).abs() < 1e-12));
}

#[test]
fn coefficients_layout() {
    let (grid, values) = sampled(6, 2);
    let spline = CubicSpline::fit(&grid, &values).unwrap();
    let coeffs = spline.coefficients().unwrap();
    assert_eq!(coeffs.dims(), &[6, 2, 4]);
    let c = coeffs.to_vec().unwrap();
    let y = values.to_vec().unwrap();
    for k in 0..6 {
        for f in 0..2 {
            assert_eq!(c[(k * 2 + f) * 4], y[k * 2 + f]);
        }
    }
    // Natural boundary: zero curvature at both ends.
    assert_eq!(c[2], 0.0);
    assert_eq!(c[(5 * 2) * 4 + 2], 0.0);
    assert_eq!(c[(5 * 2) * 4 + 3], 0.0);
}

#[test]
fn derivative_matches_finite_differences() {
    let (grid, values) = sampled(16, 2);
    let spline = CubicSpline::fit(&grid, &values).unwrap();
    let xs = vec![0.6, 1.37, 2.9, 3.333, 4.8];
    let h = 1e-6;
    let x = Tensor::from_vec(xs.clone(), xs.len(), &Device::Cpu).unwrap();
    let plus = Tensor::from_vec(xs.iter().map(|v| v + h).collect(), xs.len(), &Device::Cpu).unwrap();
    let minus = Tensor::from_vec(xs.iter().map(|v| v - h).collect(), xs.len(), &Device::Cpu).unwrap();

    let (_, d) = spline.evaluate_with_derivative(&x).unwrap();
    let p = spline.evaluate(&plus).unwrap().to_vec().unwrap();
    let m = spline.evaluate(&minus).unwrap().to_vec().unwrap();
    for (i, analytic) in d.to_vec().unwrap().iter().enumerate() {
        let fd = (p[i] - m[i]) / (2.0 * h);
        assert_relative_eq!(fd, *analytic, epsilon = 1e-6, max_relative = 1e-5);
    }
}

#[test]
fn backward_contracts_channels() {
    let (grid, values) = sampled(10, 3);
    let spline = CubicSpline::fit(&grid, &values).unwrap();
    let x = Tensor::from_vec(vec![1.0, 2.5, 4.25], 3, &Device::Cpu).unwrap();
    let g = Tensor::from_vec(
        vec![1.0, 0.0, -1.0, 0.5, 0.5, 0.5, 2.0, -3.0, 1.0],
        (3, 3),
        &Device::Cpu,
    )
    .unwrap();
    let (_, d) = spline.evaluate_with_derivative(&x).unwrap();
    let grad = spline.backward(&x, &g).unwrap();
    assert_eq!(grad.dims(), &[3]);

    let (d, g) = (d.to_vec().unwrap(), g.to_vec().unwrap());
    for (e, got) in grad.to_vec().unwrap().iter().enumerate() {
        let expected: f64 = (0..3).map(|f| g[e * 3 + f] * d[e * 3 + f]).sum();
        assert_relative_eq!(*got, expected, epsilon = 1e-12);
    }
}

#[test]
fn queries_outside_domain_fail() {
    let (grid, values) = sampled(8, 1);
    let spline = CubicSpline::fit(&grid, &values).unwrap();
    for bad in [0.49, 5.01, f64::NAN] {
        let x = Tensor::from_vec(vec![1.0, bad], 2, &Device::Cpu).unwrap();
        let err = spline.evaluate(&x).unwrap_err();
        assert!(matches!(err.inner(), Error::OutOfDomain { .. }), "{err}");
    }
}

#[test]
fn rejects_bad_grids() {
    let values = Tensor::<f32>::ones((3, 1), &Device::Cpu).unwrap();
    let grid = Tensor::<f32>::from_vec(vec![0.0, 1.0, 1.0], 3, &Device::Cpu).unwrap();
    let err = CubicSpline::fit(&grid, &values).unwrap_err();
    assert!(matches!(err.inner(), Error::UnsupportedConfiguration(_)), "{err}");

    let single = Tensor::<f32>::from_vec(vec![0.0], 1, &Device::Cpu).unwrap();
    let one = Tensor::<f32>::ones((1, 1), &Device::Cpu).unwrap();
    let err = CubicSpline::fit(&single, &one).unwrap_err();
    assert!(matches!(err.inner(), Error::UnsupportedConfiguration(_)), "{err}");

    let wrong = Tensor::<f32>::ones((2, 1), &Device::Cpu).unwrap();
    let err = CubicSpline::fit(&grid, &wrong).unwrap_err();
    assert!(matches!(err.inner(), Error::ShapeMismatch { .. }), "{err}");
}

#[test]
fn two_knots_interpolate_linearly() {
    let grid = Tensor::<f32>::from_vec(vec![1.0, 2.0], 2, &Device::Cpu).unwrap();
    let values = Tensor::<f32>::from_vec(vec![0.0, 4.0], (2, 1), &Device::Cpu).unwrap();
    let spline = CubicSpline::fit(&grid, &values).unwrap();
    let x = Tensor::<f32>::from_vec(vec![1.25, 2.0], 2, &Device::Cpu).unwrap();
    assert_eq!(spline.evaluate(&x).unwrap().to_vec().unwrap(), vec![1.0, 4.0]);
}

#[test]
fn errors_name_the_failing_operation() {
    let (grid, values) = sampled(5, 2);
    let spline = CubicSpline::fit(&grid, &values).unwrap();
    let x = Tensor::<f64>::full(1.0, (3, 1), &Device::Cpu).unwrap();
    let g = Tensor::<f64>::ones((3, 2), &Device::Cpu).unwrap();

    let op_of = |err: Error| match err.inner() {
        Error::ShapeMismatch { op, .. } => *op,
        other => panic!("unexpected error {other}"),
    };
    assert_eq!(op_of(spline.backward(&x, &g).unwrap_err()), "CubicSpline::backward");
    assert_eq!(
        op_of(spline.evaluate_with_derivative(&x).unwrap_err()),
        "CubicSpline::evaluate_with_derivative"
    );
    assert_eq!(op_of(spline.evaluate(&x).unwrap_err()), "CubicSpline::evaluate");
}
