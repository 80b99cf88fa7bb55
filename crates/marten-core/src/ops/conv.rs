// Convolution engine — forward and backward as patch extraction + GEMM
//
// With P = H_out * W_out output positions per sample and K = C_in*kH*kW
// elements per receptive field, the whole batch is handled by two
// workspace matrices:
//
//   columns: [N*P, K]       im2col(input), one row per output position
//   rows:    [N*P, C_out]   one output position per row, channels last
//
// FORWARD:
//
//   columns = im2col(input)
//   rows    = columns @ W^T                        W viewed as [C_out, K]
//   out     = permute(rows as [N, H_out, W_out, C_out], [0, 3, 1, 2]) + b
//
// BACKWARD, given gradOut [N, C_out, H_out, W_out]:
//
//   rows    = permute(gradOut, [0, 2, 3, 1])       re-layout, done once
//   dW      = rows^T @ im2col(input)               sums over the batch
//   db      = Σ_{n,h,w} gradOut
//   columns = rows @ W
//   dX      = col2im(columns)                      transposed convolution
//
// col2im adds each column entry back onto the input position it was read
// from and drops entries that were read from the zero padding, so dX is
// the exact adjoint of the forward patch extraction.
//
// 1-D convolution runs through the same path on `[N, C, L, 1]` views.

use crate::backend::{Backend, BinaryOp};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::window::{Geometry2d, Window2d};

use super::elementwise::{binary_assign, copy_to};
use super::linalg::matmul_to;
use super::reduce::sum_to;
use super::{check_dense, check_disjoint, check_dst, check_same_dtype};

/// Scratch matrices for one convolution layer, owned by the layer's arena.
pub struct ConvWorkspace<'a, B: Backend> {
    /// `[N*P, C_in*kH*kW]`
    pub columns: &'a Tensor<B>,
    /// `[N*P, C_out]`
    pub rows: &'a Tensor<B>,
}

impl<B: Backend> Clone for ConvWorkspace<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: Backend> Copy for ConvWorkspace<'_, B> {}

impl<'a, B: Backend> ConvWorkspace<'a, B> {
    pub fn new(columns: &'a Tensor<B>, rows: &'a Tensor<B>) -> Self {
        ConvWorkspace { columns, rows }
    }

    /// Shapes of `(columns, rows)` for a resolved geometry.
    pub fn shapes(geom: &Geometry2d, out_channels: usize) -> (Shape, Shape) {
        (
            geom.columns_shape(),
            Shape::from((geom.batch * geom.positions(), out_channels)),
        )
    }

    fn check(
        &self,
        op: &'static str,
        geom: &Geometry2d,
        out_channels: usize,
        dtype: DType,
    ) -> Result<()> {
        let (cols, rows) = Self::shapes(geom, out_channels);
        check_dst(op, self.columns, &cols, dtype)?;
        check_dense(op, self.columns)?;
        check_dst(op, self.rows, &rows, dtype)?;
        check_dense(op, self.rows)
    }

    /// `rows` viewed as `[N, H_out, W_out, C_out]`.
    fn rows_nhwc(&self, geom: &Geometry2d, out_channels: usize) -> Result<Tensor<B>> {
        self.rows
            .reshape((geom.batch, geom.out_hw[0], geom.out_hw[1], out_channels))
    }
}

/// Gradient destinations of one convolution backward pass.
///
/// `input` is optional since the first layer of a network has no use for it.
pub struct ConvGrads<'g, B: Backend> {
    pub input: Option<&'g Tensor<B>>,
    pub kernel: &'g Tensor<B>,
    pub bias: Option<&'g Tensor<B>>,
}

impl<B: Backend> Clone for ConvGrads<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: Backend> Copy for ConvGrads<'_, B> {}

// Validation helpers

fn expect_rank<B: Backend>(op: &'static str, t: &Tensor<B>, rank: usize) -> Result<()> {
    if t.rank() != rank {
        return Err(Error::RankMismatch {
            op,
            expected: rank,
            got: t.rank(),
        });
    }
    Ok(())
}

/// Resolve the geometry of `input` against a `[C_out, C_in, kH, kW]` kernel.
fn conv_geometry<B: Backend>(
    op: &'static str,
    input: &Tensor<B>,
    kernel: &Tensor<B>,
    window: &Window2d,
) -> Result<(Geometry2d, usize)> {
    expect_rank(op, input, 4)?;
    expect_rank(op, kernel, 4)?;
    let kd = kernel.dims();
    if kd[1] != input.dims()[1] || [kd[2], kd[3]] != window.kernel {
        return Err(Error::ShapeMismatch {
            op,
            lhs: input.shape().clone(),
            rhs: kernel.shape().clone(),
        });
    }
    check_same_dtype(op, input.dtype(), kernel.dtype())?;
    Ok((Geometry2d::resolve(input.shape(), *window)?, kd[0]))
}

/// Kernel viewed as `[C_out, C_in*kH*kW]`.
fn kernel_matrix<B: Backend>(kernel: &Tensor<B>) -> Result<Tensor<B>> {
    let kd = kernel.dims();
    kernel.reshape((kd[0], kd[1] * kd[2] * kd[3]))
}

// Kernel launches, called once every check has passed

fn run_im2col<B: Backend>(dst: &Tensor<B>, src: &Tensor<B>, geom: &Geometry2d) -> Result<()> {
    tracing::trace!(input = %src.shape(), columns = %dst.shape(), "im2col");
    let s = src.read_storage()?;
    let mut d = dst.write_storage()?;
    B::im2col_to(&mut d, dst.layout(), &s, src.layout(), geom)
}

fn run_col2im<B: Backend>(dst: &Tensor<B>, cols: &Tensor<B>, geom: &Geometry2d) -> Result<()> {
    tracing::trace!(columns = %cols.shape(), output = %dst.shape(), "col2im");
    let s = cols.read_storage()?;
    let mut d = dst.write_storage()?;
    B::col2im_to(&mut d, dst.layout(), &s, cols.layout(), geom)
}

/// Patch extraction: `dst[n*P + p, :]` is the receptive field of output
/// position `p` of sample `n`, zero where it covers padding.
pub fn im2col_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    input: &Tensor<B>,
    window: &Window2d,
) -> Result<&'d Tensor<B>> {
    let geom = Geometry2d::resolve(input.shape(), *window)?;
    check_dst("im2col", dst, &geom.columns_shape(), input.dtype())?;
    check_dense("im2col", dst)?;
    check_disjoint("im2col", &[dst], &[input])?;
    run_im2col(dst, input, &geom)?;
    Ok(dst)
}

/// Inverse of [`im2col_to`]: `dst` (shaped like the image) receives the sum
/// of every column entry read from each position. Padding entries are
/// discarded.
pub fn col2im_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    columns: &Tensor<B>,
    window: &Window2d,
) -> Result<&'d Tensor<B>> {
    if dst.rank() != 4 {
        return Err(Error::invalid_destination(
            "col2im",
            format!("expected an [N, C, H, W] destination, got {}", dst.shape()),
        ));
    }
    let geom = Geometry2d::resolve(dst.shape(), *window)?;
    if columns.shape() != &geom.columns_shape() {
        return Err(Error::ShapeMismatch {
            op: "col2im",
            lhs: columns.shape().clone(),
            rhs: geom.columns_shape(),
        });
    }
    check_dst("col2im", dst, &geom.input_shape(), columns.dtype())?;
    check_dense("col2im", dst)?;
    check_disjoint("col2im", &[dst], &[columns])?;
    run_col2im(dst, columns, &geom)?;
    Ok(dst)
}

/// 2-D convolution: `dst = conv(input, kernel) + bias`.
///
/// `input` is `[N, C_in, H, W]`, `kernel` is `[C_out, C_in, kH, kW]`,
/// `bias` is `[C_out]` and `dst` is `[N, C_out, H_out, W_out]`.
pub fn conv2d_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    input: &Tensor<B>,
    kernel: &Tensor<B>,
    bias: Option<&Tensor<B>>,
    window: &Window2d,
    ws: &ConvWorkspace<'_, B>,
) -> Result<&'d Tensor<B>> {
    let op = "conv2d";
    let (geom, c_out) = conv_geometry(op, input, kernel, window)?;
    let bias = match bias {
        Some(b) => {
            if b.shape() != &Shape::from(c_out) {
                return Err(Error::ShapeMismatch {
                    op,
                    lhs: b.shape().clone(),
                    rhs: Shape::from(c_out),
                });
            }
            check_same_dtype(op, input.dtype(), b.dtype())?;
            Some(b.unsqueeze(0)?.unsqueeze(2)?.unsqueeze(3)?)
        }
        None => None,
    };
    check_dst(op, dst, &geom.output_shape(c_out), input.dtype())?;
    ws.check(op, &geom, c_out, input.dtype())?;
    let mut sources = vec![input, kernel];
    if let Some(b) = &bias {
        sources.push(b);
    }
    check_disjoint(op, &[dst, ws.columns, ws.rows], &sources)?;
    let w = kernel_matrix(kernel)?;
    let rows = ws.rows_nhwc(&geom, c_out)?.permute(&[0, 3, 1, 2])?;

    run_im2col(ws.columns, input, &geom)?;
    matmul_to(ws.rows, ws.columns, &w.t()?)?;
    copy_to(dst, &rows)?;
    if let Some(b) = &bias {
        binary_assign(BinaryOp::Add, dst, b)?;
    }
    Ok(dst)
}

/// Transposed convolution: the adjoint of [`conv2d_to`] with respect to its
/// input.
///
/// `input` is `[N, C_out, H_out, W_out]` and `dst` is `[N, C_in, H, W]`.
/// The spatial size of `dst` picks the forward input size, which matters
/// when the stride dropped a remainder; it must map back onto `input`.
pub fn conv_transpose2d_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    input: &Tensor<B>,
    kernel: &Tensor<B>,
    window: &Window2d,
    ws: &ConvWorkspace<'_, B>,
) -> Result<&'d Tensor<B>> {
    let op = "conv_transpose2d";
    expect_rank(op, input, 4)?;
    expect_rank(op, kernel, 4)?;
    check_same_dtype(op, input.dtype(), kernel.dtype())?;
    let kd = kernel.dims();
    let (c_out, c_in) = (kd[0], kd[1]);
    if input.dims()[1] != c_out || [kd[2], kd[3]] != window.kernel {
        return Err(Error::ShapeMismatch {
            op,
            lhs: input.shape().clone(),
            rhs: kernel.shape().clone(),
        });
    }
    if dst.rank() != 4 || dst.dims()[0] != input.dims()[0] || dst.dims()[1] != c_in {
        return Err(Error::invalid_destination(
            op,
            format!(
                "shape {} cannot hold the input gradient of {} with kernel {}",
                dst.shape(),
                input.shape(),
                kernel.shape()
            ),
        ));
    }
    let geom = Geometry2d::resolve(dst.shape(), *window).map_err(|e| {
        Error::invalid_destination(op, format!("shape {} does not fit the window: {e}", dst.shape()))
    })?;
    if geom.out_hw != [input.dims()[2], input.dims()[3]] {
        return Err(Error::invalid_destination(
            op,
            format!(
                "spatial size {:?} maps to {:?}, not {:?}",
                geom.in_hw,
                geom.out_hw,
                &input.dims()[2..]
            ),
        ));
    }
    check_dst(op, dst, &geom.input_shape(), input.dtype())?;
    check_dense(op, dst)?;
    ws.check(op, &geom, c_out, input.dtype())?;
    check_disjoint(op, &[dst, ws.columns, ws.rows], &[input, kernel])?;
    let w = kernel_matrix(kernel)?;
    let rows = ws.rows_nhwc(&geom, c_out)?;

    copy_to(&rows, &input.permute(&[0, 2, 3, 1])?)?;
    matmul_to(ws.columns, ws.rows, &w)?;
    run_col2im(dst, ws.columns, &geom)?;
    Ok(dst)
}

/// Gradient of a 2-D convolution with respect to its input.
pub fn conv2d_input_grad_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
    kernel: &Tensor<B>,
    window: &Window2d,
    ws: &ConvWorkspace<'_, B>,
) -> Result<&'d Tensor<B>> {
    conv_transpose2d_to(dst, grad_out, kernel, window, ws)
}

/// Gradient of a 2-D convolution with respect to its kernel, summed over
/// the batch. `dst` has the kernel shape `[C_out, C_in, kH, kW]`.
pub fn conv2d_kernel_grad_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
    input: &Tensor<B>,
    window: &Window2d,
    ws: &ConvWorkspace<'_, B>,
) -> Result<&'d Tensor<B>> {
    let op = "conv2d_kernel_grad";
    if dst.rank() != 4 {
        return Err(Error::invalid_destination(
            op,
            format!("expected a [C_out, C_in, kH, kW] destination, got {}", dst.shape()),
        ));
    }
    let (geom, c_out) = conv_geometry(op, input, dst, window)
        .map_err(|e| match e {
            Error::ShapeMismatch { .. } | Error::DTypeMismatch { .. } => Error::invalid_destination(
                op,
                format!("shape {} does not fit input {}", dst.shape(), input.shape()),
            ),
            other => other,
        })?;
    check_grad_out(op, grad_out, &geom, c_out)?;
    check_dst(op, dst, dst.shape(), input.dtype())?;
    check_dense(op, dst)?;
    ws.check(op, &geom, c_out, input.dtype())?;
    check_disjoint(op, &[dst, ws.columns, ws.rows], &[grad_out, input])?;
    let dw = kernel_matrix(dst)?;
    let rows = ws.rows_nhwc(&geom, c_out)?;

    copy_to(&rows, &grad_out.permute(&[0, 2, 3, 1])?)?;
    run_im2col(ws.columns, input, &geom)?;
    matmul_to(&dw, &ws.rows.t()?, ws.columns)?;
    Ok(dst)
}

/// Gradient of a 2-D convolution with respect to its bias: `Σ_{n,h,w}`.
pub fn conv2d_bias_grad_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    expect_rank("conv2d_bias_grad", grad_out, 4)?;
    sum_to(dst, grad_out, &[0, 2, 3], false)
}

fn check_grad_out<B: Backend>(
    op: &'static str,
    grad_out: &Tensor<B>,
    geom: &Geometry2d,
    c_out: usize,
) -> Result<()> {
    let expected = geom.output_shape(c_out);
    if grad_out.shape() != &expected {
        return Err(Error::ShapeMismatch {
            op,
            lhs: grad_out.shape().clone(),
            rhs: expected,
        });
    }
    Ok(())
}

/// Every gradient of a 2-D convolution in one pass.
///
/// The channels-last re-layout of `grad_out` and the patch matrix of
/// `input` are each built once and shared by the three gradients. All
/// destinations are validated before the first write.
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(input = %input.shape(), kernel = %kernel.shape())
)]
pub fn conv2d_backward_to<'g, B: Backend>(
    grads: ConvGrads<'g, B>,
    grad_out: &Tensor<B>,
    input: &Tensor<B>,
    kernel: &Tensor<B>,
    window: &Window2d,
    ws: &ConvWorkspace<'_, B>,
) -> Result<ConvGrads<'g, B>> {
    let op = "conv2d_backward";
    let (geom, c_out) = conv_geometry(op, input, kernel, window)?;
    check_grad_out(op, grad_out, &geom, c_out)?;
    check_same_dtype(op, input.dtype(), grad_out.dtype())?;
    let dtype = input.dtype();

    check_dst(op, grads.kernel, kernel.shape(), dtype)?;
    check_dense(op, grads.kernel)?;
    let mut outputs = vec![grads.kernel, ws.columns, ws.rows];
    if let Some(db) = grads.bias {
        check_dst(op, db, &Shape::from(c_out), dtype)?;
        check_dense(op, db)?;
        outputs.push(db);
    }
    if let Some(dx) = grads.input {
        check_dst(op, dx, input.shape(), dtype)?;
        check_dense(op, dx)?;
        outputs.push(dx);
    }
    ws.check(op, &geom, c_out, dtype)?;
    check_disjoint(op, &outputs, &[grad_out, input, kernel])?;
    let w = kernel_matrix(kernel)?;
    let dw = kernel_matrix(grads.kernel)?;
    let rows = ws.rows_nhwc(&geom, c_out)?;

    copy_to(&rows, &grad_out.permute(&[0, 2, 3, 1])?)?;
    run_im2col(ws.columns, input, &geom)?;
    matmul_to(&dw, &ws.rows.t()?, ws.columns)?;
    if let Some(db) = grads.bias {
        sum_to(db, grad_out, &[0, 2, 3], false)?;
    }
    if let Some(dx) = grads.input {
        matmul_to(ws.columns, ws.rows, &w)?;
        run_col2im(dx, ws.columns, &geom)?;
    }
    Ok(grads)
}

// 1-D convolution on [N, C, L] tensors, through [N, C, L, 1] views

fn check_1d<B: Backend>(op: &'static str, window: &Window2d, tensors: &[&Tensor<B>]) -> Result<()> {
    if !window.is_1d() {
        return Err(Error::unsupported(
            op,
            format!("{:?} is not a 1-D window", window),
        ));
    }
    for t in tensors {
        expect_rank(op, t, 3)?;
    }
    Ok(())
}

fn check_dst_1d<B: Backend>(op: &'static str, dst: &Tensor<B>) -> Result<()> {
    if dst.rank() != 3 {
        return Err(Error::invalid_destination(
            op,
            format!("expected a rank-3 destination, got {}", dst.shape()),
        ));
    }
    Ok(())
}

/// 1-D convolution: `input` `[N, C_in, L]`, `kernel` `[C_out, C_in, k]`,
/// `dst` `[N, C_out, L_out]`. `window` comes from [`Window2d::for_1d`].
pub fn conv1d_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    input: &Tensor<B>,
    kernel: &Tensor<B>,
    bias: Option<&Tensor<B>>,
    window: &Window2d,
    ws: &ConvWorkspace<'_, B>,
) -> Result<&'d Tensor<B>> {
    check_1d("conv1d", window, &[input, kernel])?;
    check_dst_1d("conv1d", dst)?;
    conv2d_to(
        &dst.unsqueeze(3)?,
        &input.unsqueeze(3)?,
        &kernel.unsqueeze(3)?,
        bias,
        window,
        ws,
    )?;
    Ok(dst)
}

/// Input gradient of a 1-D convolution, `dst` `[N, C_in, L]`.
pub fn conv1d_input_grad_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
    kernel: &Tensor<B>,
    window: &Window2d,
    ws: &ConvWorkspace<'_, B>,
) -> Result<&'d Tensor<B>> {
    check_1d("conv1d_input_grad", window, &[grad_out, kernel])?;
    check_dst_1d("conv1d_input_grad", dst)?;
    conv_transpose2d_to(
        &dst.unsqueeze(3)?,
        &grad_out.unsqueeze(3)?,
        &kernel.unsqueeze(3)?,
        window,
        ws,
    )?;
    Ok(dst)
}

/// Kernel gradient of a 1-D convolution, `dst` `[C_out, C_in, k]`.
pub fn conv1d_kernel_grad_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
    input: &Tensor<B>,
    window: &Window2d,
    ws: &ConvWorkspace<'_, B>,
) -> Result<&'d Tensor<B>> {
    check_1d("conv1d_kernel_grad", window, &[grad_out, input])?;
    check_dst_1d("conv1d_kernel_grad", dst)?;
    conv2d_kernel_grad_to(
        &dst.unsqueeze(3)?,
        &grad_out.unsqueeze(3)?,
        &input.unsqueeze(3)?,
        window,
        ws,
    )?;
    Ok(dst)
}

/// Bias gradient of a 1-D convolution: `Σ_{n,l}`.
pub fn conv1d_bias_grad_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    expect_rank("conv1d_bias_grad", grad_out, 3)?;
    sum_to(dst, grad_out, &[0, 2], false)
}
