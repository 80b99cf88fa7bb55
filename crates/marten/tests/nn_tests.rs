// Layer tests — networks assembled from marten-nn layers, checked end to end

use marten::nn::{
    categorical_cross_entropy_grad_to, categorical_cross_entropy_loss, mse_grad_to, mse_loss,
};
use marten::prelude::*;
use marten::ErrorKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn t(data: &[f64], shape: impl Into<Shape>) -> Result<CpuTensor> {
    CpuTensor::from_f64_slice(data, shape, DType::F64, &CpuDevice)
}

fn zeros(shape: impl Into<Shape>) -> Result<CpuTensor> {
    CpuTensor::zeros(shape, DType::F64, &CpuDevice)
}

fn random(rng: &mut StdRng, n: usize) -> Vec<f64> {
    (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol * a.abs().max(b.abs()).max(1.0)
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expected).enumerate() {
        assert!(approx_eq(*g, *e, tol), "index {i}: got {g}, expected {e}");
    }
}

/// Loss of `model` on `x` against `target`.
fn loss_at(model: &mut Sequential<CpuBackend>, x: &[f64], shape: &Shape, target: &CpuTensor) -> Result<f64> {
    let pred = model.forward(&t(x, shape.clone())?)?;
    mse_loss(&pred, target)
}

// Whole networks

#[test]
fn test_cnn_forward_backward_shapes() -> Result<()> {
    let dev = CpuDevice;
    let mut model = Sequential::<CpuBackend>::new()
        .add(Conv2d::new(1, 4, [3, 3], [1, 1], [1, 1], true, DType::F64, &dev)?)
        .add(ReLU::new(DType::F64, &dev))
        .add(MaxPool2d::new([2, 2], [2, 2], [0, 0], DType::F64, &dev)?)
        .add(Flatten::new(DType::F64, &dev))
        .add(Dense::new(4 * 4 * 4, 3, true, DType::F64, &dev)?)
        .add(Softmax::new(1, DType::F64, &dev));
    let input = Shape::from((2, 1, 8, 8));
    assert_eq!(model.output_shape(&input)?, Shape::from((2, 3)));
    model.init(&input)?;

    let x = CpuTensor::randn(input.clone(), DType::F64, &dev)?;
    let y = model.forward(&x)?;
    assert_eq!(y.dims(), &[2, 3]);
    for row in y.to_f64_vec()?.chunks(3) {
        assert!(approx_eq(row.iter().sum::<f64>(), 1.0, 1e-12));
    }

    let dx = model.backward(&t(&[1., 0., 0., 0., 1., 0.], (2, 3))?)?;
    assert_eq!(dx.shape(), &input);
    let grads = model.gradients();
    assert_eq!(grads.len(), 4);
    for (p, g) in model.parameters().iter().zip(&grads) {
        assert_eq!(p.shape(), g.shape());
    }
    Ok(())
}

#[test]
fn test_mlp_gradients_match_finite_difference() -> Result<()> {
    let dev = CpuDevice;
    let mut rng = StdRng::seed_from_u64(21);
    let mut model = Sequential::<CpuBackend>::new()
        .add(Dense::new(3, 4, true, DType::F64, &dev)?)
        .add(Tanh::new(DType::F64, &dev))
        .add(Dense::new(4, 2, true, DType::F64, &dev)?)
        .add(Sigmoid::new(DType::F64, &dev));
    let shape = Shape::from((2, 3));
    model.init(&shape)?;
    let xd = random(&mut rng, 6);
    let target = t(&random(&mut rng, 4), (2, 2))?;

    let pred = model.forward(&t(&xd, shape.clone())?)?;
    let g = zeros((2, 2))?;
    mse_grad_to(&g, &pred, &target)?;
    let dx = model.backward(&g)?.to_f64_vec()?;

    let eps = 1e-6;
    for i in 0..xd.len() {
        let (mut plus, mut minus) = (xd.clone(), xd.clone());
        plus[i] += eps;
        minus[i] -= eps;
        let numeric = (loss_at(&mut model, &plus, &shape, &target)?
            - loss_at(&mut model, &minus, &shape, &target)?)
            / (2.0 * eps);
        assert!(approx_eq(dx[i], numeric, 1e-4), "dx[{i}]: {} vs {numeric}", dx[i]);
    }

    // first-layer weight gradient, perturbing the parameter in place
    let pred = model.forward(&t(&xd, shape.clone())?)?;
    mse_grad_to(&g, &pred, &target)?;
    model.backward(&g)?;
    let w = model.parameters()[0].clone();
    let dw = model.gradients()[0].to_f64_vec()?;
    for i in 0..4 {
        for j in 0..3 {
            let cell = w.narrow(0, i, 1)?.narrow(1, j, 1)?;
            ops::affine_to(&cell, &cell, 1.0, eps)?;
            let up = loss_at(&mut model, &xd, &shape, &target)?;
            ops::affine_to(&cell, &cell, 1.0, -2.0 * eps)?;
            let down = loss_at(&mut model, &xd, &shape, &target)?;
            ops::affine_to(&cell, &cell, 1.0, eps)?;
            let numeric = (up - down) / (2.0 * eps);
            let analytic = dw[i * 3 + j];
            assert!(approx_eq(analytic, numeric, 1e-4), "dw[{i},{j}]: {analytic} vs {numeric}");
        }
    }
    Ok(())
}

#[test]
fn test_pooling_stack_conserves_upstream_gradient() -> Result<()> {
    let dev = CpuDevice;
    let mut model = Sequential::<CpuBackend>::new()
        .add(AvgPool2d::new([2, 2], [2, 2], [0, 0], DType::F64, &dev)?)
        .add(AdaptiveAvgPool2d::new([2, 2], DType::F64, &dev)?)
        .add(GlobalAvgPool2d::new(DType::F64, &dev));
    let input = Shape::from((1, 2, 8, 8));
    model.init(&input)?;
    assert_eq!(model.output_shape(&input)?, Shape::from((1, 2)));

    let x = CpuTensor::randn(input, DType::F64, &dev)?;
    let y = model.forward(&x)?.to_f64_vec()?;
    // every stage is an average, so the whole stack is a plain mean per channel
    let xs = x.to_f64_vec()?;
    for (c, chunk) in xs.chunks(64).enumerate() {
        assert!(approx_eq(y[c], chunk.iter().sum::<f64>() / 64.0, 1e-12));
    }
    let dx = model.backward(&t(&[1.0, 3.0], (1, 2))?)?.to_f64_vec()?;
    assert_vec_approx(&dx[..64], &[1.0 / 64.0; 64], 1e-12);
    assert_vec_approx(&dx[64..], &[3.0 / 64.0; 64], 1e-12);
    Ok(())
}

#[test]
fn test_conv1d_sequence_model() -> Result<()> {
    let dev = CpuDevice;
    let mut model = Sequential::<CpuBackend>::new()
        .add(Conv1d::new(2, 3, 3, 1, 1, true, DType::F64, &dev)?)
        .add(ReLU::new(DType::F64, &dev))
        .add(Flatten::new(DType::F64, &dev))
        .add(Dense::new(3 * 6, 1, false, DType::F64, &dev)?);
    model.init(&Shape::from((4, 2, 6)))?;
    let x = CpuTensor::randn((4, 2, 6), DType::F64, &dev)?;
    assert_eq!(model.forward(&x)?.dims(), &[4, 1]);
    let dx = model.backward(&CpuTensor::ones((4, 1), DType::F64, &dev)?)?;
    assert_eq!(dx.dims(), &[4, 2, 6]);
    assert_eq!(model.num_parameters(), 3 * 2 * 3 + 3 + 18);
    Ok(())
}

#[test]
fn test_lstm_carries_state_between_steps() -> Result<()> {
    let dev = CpuDevice;
    let mut cell = Lstm::<CpuBackend>::new(3, 5, DType::F64, &dev)?;
    cell.init(&Shape::from((2, 3)))?;
    let x = CpuTensor::randn((2, 3), DType::F64, &dev)?;

    let first = cell.forward(&x)?.to_f64_vec()?;
    let second = cell.forward(&x)?.to_f64_vec()?;
    assert_ne!(first, second);

    cell.reset_state()?;
    let again = cell.forward(&x)?.to_f64_vec()?;
    assert_eq!(first, again);

    let dx = cell.backward(&CpuTensor::ones((2, 5), DType::F64, &dev)?)?;
    assert_eq!(dx.dims(), &[2, 3]);
    let (dh, dc) = cell.prev_state_grads()?;
    assert_eq!(dh.dims(), &[2, 5]);
    assert_eq!(dc.dims(), &[2, 5]);
    assert!(dc.to_f64_vec()?.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn test_shape_layers_feed_a_classifier() -> Result<()> {
    let dev = CpuDevice;
    let mut rng = StdRng::seed_from_u64(8);
    let mut model = Sequential::<CpuBackend>::new()
        .add(Unsqueeze::new(1, DType::F64, &dev))
        .add(Conv1d::new(1, 2, 3, 1, 1, true, DType::F64, &dev)?)
        .add(Transpose::with_order(&[0, 2, 1], DType::F64, &dev)?)
        .add(Pad::new(&[[0, 0], [1, 0], [0, 0]], 0.0, DType::F64, &dev))
        .add(Flatten::new(DType::F64, &dev))
        .add(Dropout::new(0.5, DType::F64, &dev)?)
        .add(Tanh::new(DType::F64, &dev))
        .add(Dense::new(7 * 2, 3, true, DType::F64, &dev)?)
        .add(Reshape::new((3, 1, 3), DType::F64, &dev))
        .add(Squeeze::new(DType::F64, &dev));
    let shape = Shape::from((3, 6));
    assert_eq!(model.output_shape(&shape)?, Shape::from((3, 3)));
    model.init(&shape)?;
    assert!(!model.is_training());

    // inference: dropout is the identity, so the gradient is deterministic
    let xd = random(&mut rng, 18);
    let target = t(&[1., 0., 0., 0., 0., 1., 0., 1., 0.], (3, 3))?;
    let logits = model.forward(&t(&xd, shape.clone())?)?;
    let g = zeros((3, 3))?;
    categorical_cross_entropy_grad_to(&g, &logits, &target, true)?;
    let dx = model.backward(&g)?.to_f64_vec()?;

    let eps = 1e-6;
    for i in 0..xd.len() {
        let (mut plus, mut minus) = (xd.clone(), xd.clone());
        plus[i] += eps;
        minus[i] -= eps;
        let up = model.forward(&t(&plus, shape.clone())?)?;
        let up = categorical_cross_entropy_loss(&up, &target, true)?;
        let down = model.forward(&t(&minus, shape.clone())?)?;
        let down = categorical_cross_entropy_loss(&down, &target, true)?;
        let numeric = (up - down) / (2.0 * eps);
        assert!(approx_eq(dx[i], numeric, 1e-4), "dx[{i}]: {} vs {numeric}", dx[i]);
    }

    // training mode reaches the dropout layer through the container
    model.set_training(true);
    assert!(model.is_training());
    let y = model.forward(&t(&xd, shape.clone())?)?;
    assert_eq!(y.dims(), &[3, 3]);
    Ok(())
}

// Lifecycle and configuration errors

#[test]
fn test_layer_lifecycle_errors() -> Result<()> {
    let dev = CpuDevice;
    let mut dense = Dense::<CpuBackend>::new(3, 2, true, DType::F64, &dev)?;
    let x = zeros((4, 3))?;
    assert_eq!(
        dense.forward(&x).unwrap_err().kind(),
        ErrorKind::MissingPrecomputedState
    );

    dense.init(&Shape::from((4, 3)))?;
    assert_eq!(
        dense.backward(&zeros((4, 2))?).unwrap_err().kind(),
        ErrorKind::MissingPrecomputedState
    );
    assert_eq!(
        dense.forward(&zeros((5, 3))?).unwrap_err().kind(),
        ErrorKind::ShapeMismatch
    );
    dense.forward(&x)?;
    assert_eq!(
        dense.backward(&zeros((4, 3))?).unwrap_err().kind(),
        ErrorKind::ShapeMismatch
    );

    // re-initialising for a new batch size is allowed
    dense.init(&Shape::from((5, 3)))?;
    assert_eq!(dense.forward(&zeros((5, 3))?)?.dims(), &[5, 2]);
    Ok(())
}

#[test]
fn test_invalid_windows_fail_at_construction() {
    let dev = CpuDevice;
    let conv = Conv2d::<CpuBackend>::new(1, 1, [3, 3], [0, 1], [0, 0], true, DType::F64, &dev);
    assert_eq!(conv.err().map(|e| e.kind()), Some(ErrorKind::UnsupportedConfiguration));

    let pool = MaxPool2d::<CpuBackend>::new([2, 2], [2, 2], [2, 0], DType::F64, &dev);
    assert_eq!(pool.err().map(|e| e.kind()), Some(ErrorKind::UnsupportedConfiguration));

    let adaptive = AdaptiveAvgPool2d::<CpuBackend>::new([0, 1], DType::F64, &dev);
    assert_eq!(adaptive.err().map(|e| e.kind()), Some(ErrorKind::UnsupportedConfiguration));

    assert!(marten::Window2d::from_signed([3, 3], [1, 1], [-1, 0]).is_err());
}

#[test]
fn test_window_larger_than_input_is_rejected_on_init() -> Result<()> {
    let dev = CpuDevice;
    let mut pool = AvgPool2d::<CpuBackend>::new([5, 5], [1, 1], [0, 0], DType::F64, &dev)?;
    let err = pool.init(&Shape::from((1, 1, 3, 3))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedConfiguration);
    Ok(())
}
