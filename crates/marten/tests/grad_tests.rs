// Gradient engine tests — checks the ops::*_to kernels against finite
// differences, naive loop implementations and hand-computed fixtures

use marten::prelude::*;
use marten::{
    BinaryOp, Broadcast, ConvGrads, ConvWorkspace, ErrorKind, Geometry2d, PoolIndices, Window2d,
};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// Helpers

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

/// Scratch matrices for a convolution over inputs of `input_shape`.
fn workspace(input_shape: &Shape, window: Window2d, c_out: usize) -> Result<(CpuTensor, CpuTensor)> {
    let geom = Geometry2d::resolve(input_shape, window)?;
    let (cols, rows) = ConvWorkspace::<CpuBackend>::shapes(&geom, c_out);
    Ok((zeros(cols)?, zeros(rows)?))
}

fn conv2d(x: &CpuTensor, k: &CpuTensor, b: Option<&CpuTensor>, window: Window2d) -> Result<CpuTensor> {
    let c_out = k.dims()[0];
    let geom = Geometry2d::resolve(x.shape(), window)?;
    let (cols, rows) = workspace(x.shape(), window, c_out)?;
    let out = zeros(geom.output_shape(c_out))?;
    ops::conv2d_to(&out, x, k, b, &window, &ConvWorkspace::new(&cols, &rows))?;
    Ok(out)
}

/// Direct seven-loop convolution.
fn reference_conv(
    x: &[f64],
    [n, c_in, h, w]: [usize; 4],
    k: &[f64],
    [c_out, _, kh, kw]: [usize; 4],
    bias: Option<&[f64]>,
    window: &Window2d,
) -> Vec<f64> {
    let [sh, sw] = window.stride;
    let [ph, pw] = window.padding;
    let oh = (h + 2 * ph - kh) / sh + 1;
    let ow = (w + 2 * pw - kw) / sw + 1;
    let mut out = vec![0.0; n * c_out * oh * ow];
    for b in 0..n {
        for co in 0..c_out {
            for y in 0..oh {
                for xo in 0..ow {
                    let mut acc = bias.map_or(0.0, |bs| bs[co]);
                    for ci in 0..c_in {
                        for i in 0..kh {
                            for j in 0..kw {
                                let iy = (y * sh + i) as isize - ph as isize;
                                let ix = (xo * sw + j) as isize - pw as isize;
                                if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                    continue;
                                }
                                let xi = ((b * c_in + ci) * h + iy as usize) * w + ix as usize;
                                let ki = ((co * c_in + ci) * kh + i) * kw + j;
                                acc += x[xi] * k[ki];
                            }
                        }
                    }
                    out[((b * c_out + co) * oh + y) * ow + xo] = acc;
                }
            }
        }
    }
    out
}

// Convolution forward

#[test]
fn test_conv2d_matches_reference_loops() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let configs = [
        ([2, 3, 5, 5], [4, 3, 3, 3], Window2d::square(3, 1, 0)?),
        ([1, 2, 6, 7], [3, 2, 3, 2], Window2d::new([3, 2], [2, 1], [1, 0])?),
        ([2, 1, 4, 4], [2, 1, 2, 2], Window2d::square(2, 2, 1)?),
    ];
    for (xs, ks, window) in configs {
        let xd = random(&mut rng, xs.iter().product());
        let kd = random(&mut rng, ks.iter().product());
        let bd = random(&mut rng, ks[0]);
        let x = t(&xd, xs)?;
        let k = t(&kd, ks)?;
        let b = t(&bd, ks[0])?;
        let got = conv2d(&x, &k, Some(&b), window)?.to_f64_vec()?;
        let expected = reference_conv(&xd, xs, &kd, ks, Some(&bd), &window);
        assert_vec_approx(&got, &expected, 1e-12);
    }
    Ok(())
}

#[test]
fn test_conv1d_matches_reference_loops() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(11);
    let window = Window2d::for_1d(3, 2, 1)?;
    let xd = random(&mut rng, 2 * 2 * 9);
    let kd = random(&mut rng, 4 * 2 * 3);
    let x = t(&xd, (2, 2, 9))?;
    let k = t(&kd, (4, 2, 3))?;
    let as_2d = Shape::from((2, 2, 9, 1));
    let geom = Geometry2d::resolve(&as_2d, window)?;
    let (cols, rows) = workspace(&as_2d, window, 4)?;
    let out = zeros((2, 4, geom.out_hw[0]))?;
    ops::conv1d_to(&out, &x, &k, None, &window, &ConvWorkspace::new(&cols, &rows))?;
    let expected = reference_conv(&xd, [2, 2, 9, 1], &kd, [4, 2, 3, 1], None, &window);
    assert_vec_approx(&out.to_f64_vec()?, &expected, 1e-12);
    Ok(())
}

// Convolution gradients against central differences

/// `L = Σ conv(x, k) * r` for a fixed random `r`, so `dL/dy = r`.
fn check_conv_gradients(xs: [usize; 4], ks: [usize; 4], window: Window2d, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let xd = random(&mut rng, xs.iter().product());
    let kd = random(&mut rng, ks.iter().product());
    let bd = random(&mut rng, ks[0]);
    let (x, k, b) = (t(&xd, xs)?, t(&kd, ks)?, t(&bd, ks[0])?);

    let geom = Geometry2d::resolve(x.shape(), window)?;
    let out_shape = geom.output_shape(ks[0]);
    let rd = random(&mut rng, out_shape.elem_count());
    let r = t(&rd, out_shape)?;

    let loss = |xd: &[f64], kd: &[f64]| -> Result<f64> {
        let y = conv2d(&t(xd, xs)?, &t(kd, ks)?, Some(&b), window)?.to_f64_vec()?;
        Ok(y.iter().zip(&rd).map(|(a, b)| a * b).sum())
    };

    let (cols, rows) = workspace(x.shape(), window, ks[0])?;
    let (dx, dk, db) = (zeros(xs)?, zeros(ks)?, zeros(ks[0])?);
    ops::conv2d_backward_to(
        ConvGrads {
            input: Some(&dx),
            kernel: &dk,
            bias: Some(&db),
        },
        &r,
        &x,
        &k,
        &window,
        &ConvWorkspace::new(&cols, &rows),
    )?;

    let eps = 1e-6;
    let dx = dx.to_f64_vec()?;
    for i in 0..xd.len() {
        let (mut plus, mut minus) = (xd.clone(), xd.clone());
        plus[i] += eps;
        minus[i] -= eps;
        let numeric = (loss(&plus, &kd)? - loss(&minus, &kd)?) / (2.0 * eps);
        assert!(approx_eq(dx[i], numeric, 1e-4), "dx[{i}]: {} vs {numeric}", dx[i]);
    }
    let dk = dk.to_f64_vec()?;
    for i in 0..kd.len() {
        let (mut plus, mut minus) = (kd.clone(), kd.clone());
        plus[i] += eps;
        minus[i] -= eps;
        let numeric = (loss(&xd, &plus)? - loss(&xd, &minus)?) / (2.0 * eps);
        assert!(approx_eq(dk[i], numeric, 1e-4), "dk[{i}]: {} vs {numeric}", dk[i]);
    }
    // dL/db[c] is the sum of r over channel c
    let mut expected_db = vec![0.0; ks[0]];
    for (i, v) in rd.iter().enumerate() {
        expected_db[(i / geom.positions()) % ks[0]] += v;
    }
    assert_vec_approx(&db.to_f64_vec()?, &expected_db, 1e-12);
    Ok(())
}

#[test]
fn test_conv2d_gradients_unpadded_unit_stride() -> Result<()> {
    check_conv_gradients([2, 2, 5, 5], [3, 2, 3, 3], Window2d::square(3, 1, 0)?, 1)
}

#[test]
fn test_conv2d_gradients_padded_unit_stride() -> Result<()> {
    check_conv_gradients([1, 3, 4, 4], [2, 3, 3, 3], Window2d::square(3, 1, 1)?, 2)
}

#[test]
fn test_conv2d_gradients_unpadded_strided() -> Result<()> {
    // stride 2 over width 6 with kernel 3 drops the last column
    check_conv_gradients([2, 1, 5, 6], [2, 1, 3, 3], Window2d::square(3, 2, 0)?, 3)
}

#[test]
fn test_conv2d_gradients_padded_strided_rectangular() -> Result<()> {
    check_conv_gradients([1, 2, 5, 4], [2, 2, 3, 2], Window2d::new([3, 2], [2, 1], [1, 1])?, 4)
}

#[test]
fn test_separate_gradient_ops_match_fused_backward() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(5);
    let window = Window2d::square(3, 2, 1)?;
    let (xs, ks) = ([2, 2, 5, 5], [3, 2, 3, 3]);
    let x = t(&random(&mut rng, 100), xs)?;
    let k = t(&random(&mut rng, 54), ks)?;
    let geom = Geometry2d::resolve(x.shape(), window)?;
    let out_shape = geom.output_shape(3);
    let g = t(&random(&mut rng, out_shape.elem_count()), out_shape)?;
    let (cols, rows) = workspace(x.shape(), window, 3)?;
    let ws = ConvWorkspace::new(&cols, &rows);

    let (dx, dk, db) = (zeros(xs)?, zeros(ks)?, zeros(3)?);
    ops::conv2d_backward_to(
        ConvGrads {
            input: Some(&dx),
            kernel: &dk,
            bias: Some(&db),
        },
        &g,
        &x,
        &k,
        &window,
        &ws,
    )?;

    let (dx2, dk2, db2) = (zeros(xs)?, zeros(ks)?, zeros(3)?);
    ops::conv2d_input_grad_to(&dx2, &g, &k, &window, &ws)?;
    ops::conv2d_kernel_grad_to(&dk2, &g, &x, &window, &ws)?;
    ops::conv2d_bias_grad_to(&db2, &g)?;
    assert_vec_approx(&dx.to_f64_vec()?, &dx2.to_f64_vec()?, 1e-12);
    assert_vec_approx(&dk.to_f64_vec()?, &dk2.to_f64_vec()?, 1e-12);
    assert_vec_approx(&db.to_f64_vec()?, &db2.to_f64_vec()?, 1e-12);
    Ok(())
}

#[test]
fn test_conv_workspace_of_wrong_shape_is_rejected() -> Result<()> {
    let window = Window2d::square(3, 1, 0)?;
    let x = zeros((1, 1, 4, 4))?;
    let k = zeros((1, 1, 3, 3))?;
    let (cols, _) = workspace(x.shape(), window, 1)?;
    let rows = zeros((3, 1))?;
    let out = zeros((1, 1, 2, 2))?;
    let err = ops::conv2d_to(&out, &x, &k, None, &window, &ConvWorkspace::new(&cols, &rows))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidDestination);
    Ok(())
}

// Pooling

#[test]
fn test_global_avg_pool_backward_fixture() -> Result<()> {
    let x = t(&[1., 2., 3., 4.], (1, 1, 2, 2))?;
    let y = zeros((1, 1))?;
    ops::global_avg_pool2d_to(&y, &x)?;
    assert_eq!(y.to_f64_vec()?, vec![2.5]);

    let dx = zeros((1, 1, 2, 2))?;
    ops::global_avg_pool2d_backward_to(&dx, &t(&[2.0], (1, 1))?)?;
    assert_eq!(dx.to_f64_vec()?, vec![0.5; 4]);
    Ok(())
}

#[test]
fn test_max_pool_tie_routes_to_first_maximum() -> Result<()> {
    let window = Window2d::square(2, 2, 0)?;
    let x = t(&[3., 3., 3., 3.], (1, 1, 2, 2))?;
    let y = zeros((1, 1, 1, 1))?;
    let mut idx = PoolIndices::<CpuBackend>::new((1, 1, 1, 1), &CpuDevice)?;
    ops::max_pool2d_to(&y, &mut idx, &x, &window)?;
    assert_eq!(idx.tensor().to_f64_vec()?, vec![0.0]);

    let dx = zeros((1, 1, 2, 2))?;
    ops::max_pool2d_backward_to(&dx, &t(&[1.0], (1, 1, 1, 1))?, &idx, &window)?;
    assert_eq!(dx.to_f64_vec()?, vec![1., 0., 0., 0.]);
    Ok(())
}

#[test]
fn test_avg_pool_matches_uniform_convolution() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(9);
    let window = Window2d::square(2, 2, 0)?;
    let x = t(&random(&mut rng, 2 * 6 * 6), (2, 1, 6, 6))?;
    let uniform = t(&[0.25; 4], (1, 1, 2, 2))?;

    let y = zeros((2, 1, 3, 3))?;
    ops::avg_pool2d_to(&y, &x, &window)?;
    let y_conv = conv2d(&x, &uniform, None, window)?;
    assert_vec_approx(&y.to_f64_vec()?, &y_conv.to_f64_vec()?, 1e-12);

    // backward is the transposed convolution with the same uniform kernel
    let g = t(&random(&mut rng, 18), (2, 1, 3, 3))?;
    let dx = zeros((2, 1, 6, 6))?;
    ops::avg_pool2d_backward_to(&dx, &g, &window)?;
    let (cols, rows) = workspace(dx.shape(), window, 1)?;
    let dx_conv = zeros((2, 1, 6, 6))?;
    ops::conv_transpose2d_to(&dx_conv, &g, &uniform, &window, &ConvWorkspace::new(&cols, &rows))?;
    assert_vec_approx(&dx.to_f64_vec()?, &dx_conv.to_f64_vec()?, 1e-12);
    Ok(())
}

#[test]
fn test_adaptive_pool_backward_spreads_over_region() -> Result<()> {
    // 5 -> 2 gives regions [0, 2) and [2, 5)
    let dx = zeros((1, 1, 1, 5))?;
    ops::adaptive_avg_pool2d_backward_to(&dx, &t(&[2., 3.], (1, 1, 1, 2))?)?;
    assert_vec_approx(&dx.to_f64_vec()?, &[1., 1., 1., 1., 1.], 1e-12);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_pool_backward_conserves_gradient(
        h in 2usize..7,
        w in 2usize..7,
        kernel in 1usize..3,
        stride in 1usize..3,
        padding in 0usize..2,
        seed in any::<u64>(),
    ) {
        prop_assume!(padding < kernel);
        prop_assume!(h + 2 * padding >= kernel && w + 2 * padding >= kernel);
        let window = Window2d::square(kernel, stride, padding).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let x = t(&random(&mut rng, 2 * h * w), (1, 2, h, w)).unwrap();
        let geom = Geometry2d::resolve(x.shape(), window).unwrap();
        let out_shape = geom.output_shape(2);
        let gd = random(&mut rng, out_shape.elem_count());
        let g = t(&gd, out_shape.clone()).unwrap();
        let total: f64 = gd.iter().sum();

        let dx = zeros((1, 2, h, w)).unwrap();
        ops::avg_pool2d_backward_to(&dx, &g, &window).unwrap();
        let got: f64 = dx.to_f64_vec().unwrap().iter().sum();
        prop_assert!((got - total).abs() < 1e-9);

        let y = zeros(out_shape.clone()).unwrap();
        let mut idx = PoolIndices::<CpuBackend>::new(out_shape, &CpuDevice).unwrap();
        ops::max_pool2d_to(&y, &mut idx, &x, &window).unwrap();
        ops::max_pool2d_backward_to(&dx, &g, &idx, &window).unwrap();
        let got: f64 = dx.to_f64_vec().unwrap().iter().sum();
        prop_assert!((got - total).abs() < 1e-9);
    }

    #[test]
    fn prop_pool_backward_conserves_each_window(
        oh in 1usize..4,
        ow in 1usize..4,
        kernel in 1usize..4,
        rem in (0usize..3, 0usize..3),
        seed in any::<u64>(),
    ) {
        // non-overlapping windows; the remainder rows and columns are never pooled
        let (rem_h, rem_w) = (rem.0 % kernel, rem.1 % kernel);
        let (h, w) = (oh * kernel + rem_h, ow * kernel + rem_w);
        let window = Window2d::square(kernel, kernel, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let x = t(&random(&mut rng, 2 * h * w), (1, 2, h, w)).unwrap();
        let gd = random(&mut rng, 2 * oh * ow);
        let g = t(&gd, (1, 2, oh, ow)).unwrap();

        let avg = zeros((1, 2, h, w)).unwrap();
        ops::avg_pool2d_backward_to(&avg, &g, &window).unwrap();
        let y = zeros((1, 2, oh, ow)).unwrap();
        let mut idx = PoolIndices::<CpuBackend>::new((1, 2, oh, ow), &CpuDevice).unwrap();
        ops::max_pool2d_to(&y, &mut idx, &x, &window).unwrap();
        let max = zeros((1, 2, h, w)).unwrap();
        ops::max_pool2d_backward_to(&max, &g, &idx, &window).unwrap();

        for dx in [avg.to_f64_vec().unwrap(), max.to_f64_vec().unwrap()] {
            for q in 0..2 {
                for i in 0..oh {
                    for j in 0..ow {
                        let mut sum = 0.0;
                        for a in 0..kernel {
                            for b in 0..kernel {
                                sum += dx[q * h * w + (i * kernel + a) * w + j * kernel + b];
                            }
                        }
                        let expected = gd[(q * oh + i) * ow + j];
                        prop_assert!((sum - expected).abs() < 1e-9, "window ({q}, {i}, {j}): {sum} vs {expected}");
                    }
                }
                for r in 0..h {
                    for c in 0..w {
                        if r >= oh * kernel || c >= ow * kernel {
                            prop_assert_eq!(dx[q * h * w + r * w + c], 0.0);
                        }
                    }
                }
            }
        }
    }
}

// Fused activation gradients against their unfused forms

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_fused_sigmoid_and_tanh_match_unfused(
        data in prop::collection::vec((-4.0f64..4.0, -2.0f64..2.0), 1..32),
    ) {
        let n = data.len();
        let xs: Vec<f64> = data.iter().map(|p| p.0).collect();
        let gs: Vec<f64> = data.iter().map(|p| p.1).collect();
        let x = t(&xs, n).unwrap();
        let g = t(&gs, n).unwrap();

        let y = x.sigmoid().unwrap();
        let fused = zeros(n).unwrap();
        ops::sigmoid_grad_to(&fused, &g, &y).unwrap();
        let unfused = g.mul(&y).unwrap().mul(&y.affine(-1.0, 1.0).unwrap()).unwrap();
        assert_vec_approx(&fused.to_f64_vec().unwrap(), &unfused.to_f64_vec().unwrap(), 1e-12);

        let y = x.tanh().unwrap();
        ops::tanh_grad_to(&fused, &g, &y).unwrap();
        let unfused = g.mul(&y.square().unwrap().affine(-1.0, 1.0).unwrap()).unwrap();
        assert_vec_approx(&fused.to_f64_vec().unwrap(), &unfused.to_f64_vec().unwrap(), 1e-12);

        // in place over the upstream gradient
        let inplace = g.contiguous().unwrap();
        ops::tanh_grad_to(&inplace, &inplace, &y).unwrap();
        assert_vec_approx(&inplace.to_f64_vec().unwrap(), &unfused.to_f64_vec().unwrap(), 1e-12);
    }

    #[test]
    fn prop_fused_relu_matches_mask_and_input_forms(
        data in prop::collection::vec((-4.0f64..4.0, -2.0f64..2.0), 1..32),
    ) {
        let n = data.len();
        let xs: Vec<f64> = data.iter().map(|p| p.0).collect();
        let gs: Vec<f64> = data.iter().map(|p| p.1).collect();
        let x = t(&xs, n).unwrap();
        let g = t(&gs, n).unwrap();
        let expected: Vec<f64> = xs.iter().zip(&gs).map(|(x, g)| if *x > 0.0 { *g } else { 0.0 }).collect();

        let from_input = zeros(n).unwrap();
        ops::relu_grad_to(&from_input, &g, &x).unwrap();
        prop_assert_eq!(from_input.to_f64_vec().unwrap(), expected.clone());

        let mask = CpuTensor::zeros(n, DType::U8, &CpuDevice).unwrap();
        ops::relu_mask_to(&mask, &x).unwrap();
        let from_mask = zeros(n).unwrap();
        ops::relu_grad_masked_to(&from_mask, &g, &mask).unwrap();
        prop_assert_eq!(from_mask.to_f64_vec().unwrap(), expected);
    }

    #[test]
    fn prop_fused_softmax_grad_matches_unfused(
        rows in 1usize..4,
        cols in 1usize..6,
        seed in any::<u64>(),
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = t(&random(&mut rng, rows * cols), (rows, cols)).unwrap();
        let g = t(&random(&mut rng, rows * cols), (rows, cols)).unwrap();
        let y = x.softmax(1).unwrap();
        let fused = zeros((rows, cols)).unwrap();
        ops::softmax_grad_to(&fused, &g, &y, 1).unwrap();

        let dot = g.mul(&y).unwrap().sum(&[1], true).unwrap();
        let unfused = y.mul(&g.sub(&dot).unwrap()).unwrap();
        assert_vec_approx(&fused.to_f64_vec().unwrap(), &unfused.to_f64_vec().unwrap(), 1e-12);
    }
}

// Broadcasting and destination rules

#[test]
fn test_broadcast_fixtures() -> Result<()> {
    let a = t(&[1., 2., 3., 4.], (4, 1, 1))?.broadcast_as((4, 1, 3))?.contiguous()?;
    let b = t(&(0..15).map(|i| i as f64).collect::<Vec<_>>(), (1, 5, 3))?;
    let out = zeros((4, 5, 3))?;
    ops::add_to(&out, &a, &b)?;
    let v = out.to_f64_vec()?;
    assert_eq!(v[0], 1.0);
    assert_eq!(v[3 * 5 * 3 + 14], 4.0 + 14.0);

    let err = ops::add_to(&out, &zeros((4, 2))?, &zeros(3)?).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
    Ok(())
}

#[test]
fn test_wrong_destination_leaves_contents_untouched() -> Result<()> {
    let dst = CpuTensor::full((2, 2), 7.0, DType::F64, &CpuDevice)?;
    let err = ops::add_to(&dst, &zeros(3)?, &zeros(3)?).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidDestination);
    assert_eq!(dst.to_f64_vec()?, vec![7.0; 4]);

    let wrong_dtype = CpuTensor::full(3, 7.0, DType::F32, &CpuDevice)?;
    let err = ops::add_to(&wrong_dtype, &zeros(3)?, &zeros(3)?).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidDestination);
    assert_eq!(wrong_dtype.to_f64_vec()?, vec![7.0; 3]);
    Ok(())
}

/// Run `op` against a destination pre-filled with 7 and check it is
/// rejected as a destination without being written.
fn assert_rejects_destination(
    shape: impl Into<Shape>,
    op: impl FnOnce(&CpuTensor) -> Result<()>,
) -> Result<()> {
    let dst = CpuTensor::full(shape, 7.0, DType::F64, &CpuDevice)?;
    let n = dst.elem_count();
    let err = op(&dst).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidDestination, "{err}");
    assert_eq!(dst.to_f64_vec()?, vec![7.0; n]);
    Ok(())
}

#[test]
fn test_gradient_ops_reject_wrong_destinations_untouched() -> Result<()> {
    let window = Window2d::square(3, 1, 0)?;
    let x = zeros((1, 1, 3, 3))?;
    let k = zeros((1, 1, 3, 3))?;
    let g = zeros((1, 1, 1, 1))?;
    let (cols, rows) = workspace(x.shape(), window, 1)?;
    let ws = ConvWorkspace::new(&cols, &rows);

    // spatially smaller than the kernel, mapping to another output size,
    // and with the wrong channel count
    let shapes: [(usize, usize, usize, usize); 3] = [(1, 1, 2, 2), (1, 1, 5, 5), (1, 2, 3, 3)];
    for shape in shapes {
        assert_rejects_destination(shape, |dx| {
            ops::conv2d_input_grad_to(dx, &g, &k, &window, &ws).map(drop)
        })?;
        assert_rejects_destination(shape, |dx| {
            ops::conv_transpose2d_to(dx, &g, &k, &window, &ws).map(drop)
        })?;
    }
    assert_rejects_destination((1, 1, 2, 2), |dk| {
        ops::conv2d_kernel_grad_to(dk, &g, &x, &window, &ws).map(drop)
    })?;
    assert_rejects_destination(2, |db| ops::conv2d_bias_grad_to(db, &g).map(drop))?;
    let dk = CpuTensor::full((1, 1, 3, 3), 7.0, DType::F64, &CpuDevice)?;
    assert_rejects_destination((1, 1, 2, 2), |dx| {
        let grads = ConvGrads {
            input: Some(dx),
            kernel: &dk,
            bias: None,
        };
        ops::conv2d_backward_to(grads, &g, &x, &k, &window, &ws).map(drop)
    })?;
    assert_eq!(dk.to_f64_vec()?, vec![7.0; 9]);

    let window_1d = Window2d::for_1d(3, 1, 0)?;
    let (cols, rows) = workspace(&Shape::from((1, 1, 3, 1)), window_1d, 1)?;
    let ws_1d = ConvWorkspace::new(&cols, &rows);
    assert_rejects_destination((1, 1, 2), |dx| {
        ops::conv1d_input_grad_to(dx, &zeros((1, 1, 1))?, &zeros((1, 1, 3))?, &window_1d, &ws_1d)
            .map(drop)
    })?;

    let pool = Window2d::square(2, 2, 0)?;
    let y = zeros((1, 1, 1, 1))?;
    let mut idx = PoolIndices::<CpuBackend>::new((1, 1, 1, 1), &CpuDevice)?;
    ops::max_pool2d_to(&y, &mut idx, &zeros((1, 1, 2, 2))?, &pool)?;
    let shapes: [(usize, usize, usize, usize); 3] = [(1, 1, 1, 1), (1, 1, 4, 4), (1, 2, 2, 2)];
    for shape in shapes {
        assert_rejects_destination(shape, |dx| {
            ops::max_pool2d_backward_to(dx, &g, &idx, &pool).map(drop)
        })?;
        assert_rejects_destination(shape, |dx| {
            ops::avg_pool2d_backward_to(dx, &g, &pool).map(drop)
        })?;
    }
    assert_rejects_destination((1, 2, 2, 2), |dx| {
        ops::global_avg_pool2d_backward_to(dx, &zeros((1, 1))?).map(drop)
    })?;
    assert_rejects_destination((2, 1, 4, 4), |dx| {
        ops::adaptive_avg_pool2d_backward_to(dx, &zeros((1, 1, 2, 2))?).map(drop)
    })?;
    Ok(())
}

#[test]
fn test_broadcast_view_is_not_a_destination() -> Result<()> {
    let dst = zeros((1, 3))?.broadcast_as((2, 3))?;
    let err = ops::fill(&dst, 1.0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidDestination);
    Ok(())
}

#[test]
fn test_bias_accumulation_through_binary_assign() -> Result<()> {
    let dst = t(&[1., 2., 3., 4., 5., 6.], (2, 3))?;
    ops::binary_assign(BinaryOp::Add, &dst, &t(&[10., 20., 30.], 3)?)?;
    assert_eq!(dst.to_f64_vec()?, vec![11., 22., 33., 14., 25., 36.]);
    Ok(())
}

proptest! {
    #[test]
    fn prop_broadcast_is_symmetric(
        a in prop::collection::vec(prop_oneof![Just(1usize), 2usize..4], 0..4),
        b in prop::collection::vec(prop_oneof![Just(1usize), 2usize..4], 0..4),
    ) {
        let (a, b) = (Shape::from(a), Shape::from(b));
        let ab = Broadcast::resolve(&a, &b).map(|r| r.shape);
        let ba = Broadcast::resolve(&b, &a).map(|r| r.shape);
        match (ab, ba) {
            (Ok(x), Ok(y)) => prop_assert_eq!(x, y),
            (Err(_), Err(_)) => {}
            _ => prop_assert!(false, "resolve is not symmetric"),
        }
        let aa = Broadcast::resolve(&a, &a).unwrap();
        prop_assert_eq!(aa.shape, a.clone());
        prop_assert!(aa.lhs_replicated.is_empty() && aa.rhs_replicated.is_empty());
    }
}
