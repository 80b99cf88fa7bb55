// Pooling engine
//
// MAX POOLING:
//
//   forward:  out[n,c,oh,ow] = max over the window, and
//             idx[n,c,oh,ow] = flat offset of that max in the logical input,
//             ((n*C + c)*H + h)*W + w. Ties keep the first max in row-major
//             window order. Padding positions are never selected.
//   backward: dX = 0, then dX[idx[o]] += gradOut[o] for every output o.
//
// The index record lives in a `PoolIndices` owned by the layer. It also
// remembers which input shape it was recorded for, so a backward pass that
// does not match the last forward is reported instead of scattering into
// the wrong positions.
//
// AVERAGE POOLING:
//
//   forward:  out = mean over the non-padding positions of the window
//   backward: dX = 0, then every non-padding position of window o receives
//             gradOut[o] / count(o)
//
// Both backward passes accumulate, so overlapping windows (stride < kernel)
// sum their contributions. Within each window the distributed gradient adds
// up to exactly the routed gradOut value.
//
// GLOBAL AVERAGE POOLING is expressed with the reduction and affine kernels:
//
//   forward:  out[n,c] = mean_{h,w} x[n,c,h,w]
//   backward: dX = broadcast(gradOut / (H*W))
//
// ADAPTIVE AVERAGE POOLING splits each axis into Out regions with
// start = floor(o*In/Out) and end = floor((o+1)*In/Out).

use crate::backend::Backend;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;
use crate::window::{Geometry2d, Window2d};

use super::elementwise::affine_to;
use super::reduce::mean_to;
use super::{check_dense, check_disjoint, check_dst};

/// Max-pooling index record: an I64 tensor shaped like the pooled output,
/// plus the input shape it was recorded for.
pub struct PoolIndices<B: Backend> {
    indices: Tensor<B>,
    recorded_for: Option<Shape>,
}

impl<B: Backend> PoolIndices<B> {
    /// Allocate an empty record for outputs of `output_shape`.
    pub fn new(output_shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        Ok(PoolIndices {
            indices: Tensor::zeros(output_shape, DType::I64, device)?,
            recorded_for: None,
        })
    }

    pub fn tensor(&self) -> &Tensor<B> {
        &self.indices
    }

    /// The input shape of the forward pass that filled this record.
    pub fn recorded_for(&self) -> Option<&Shape> {
        self.recorded_for.as_ref()
    }

    /// Mark the record as stale.
    pub fn invalidate(&mut self) {
        self.recorded_for = None;
    }

    fn check_fresh(&self, op: &'static str, input_shape: &Shape) -> Result<()> {
        match &self.recorded_for {
            Some(s) if s == input_shape => Ok(()),
            Some(s) => Err(Error::missing_state(
                op,
                format!("indices were recorded for input {s}, not {input_shape}"),
            )),
            None => Err(Error::missing_state(
                op,
                "no max-pooling forward pass has been recorded",
            )),
        }
    }
}

fn expect_rank4<B: Backend>(op: &'static str, t: &Tensor<B>) -> Result<()> {
    if t.rank() != 4 {
        return Err(Error::RankMismatch {
            op,
            expected: 4,
            got: t.rank(),
        });
    }
    Ok(())
}

fn dst_rank4<B: Backend>(op: &'static str, dst: &Tensor<B>) -> Result<()> {
    if dst.rank() != 4 {
        return Err(Error::invalid_destination(
            op,
            format!("expected an [N, C, H, W] destination, got {}", dst.shape()),
        ));
    }
    Ok(())
}

/// Geometry of a pooling backward pass, where `dst` gives the input size.
fn backward_geometry<B: Backend>(
    op: &'static str,
    dst: &Tensor<B>,
    grad_out: &Tensor<B>,
    window: &Window2d,
) -> Result<Geometry2d> {
    window.check_pooling()?;
    expect_rank4(op, grad_out)?;
    dst_rank4(op, dst)?;
    let geom = Geometry2d::resolve(dst.shape(), *window).map_err(|e| {
        Error::invalid_destination(op, format!("shape {} cannot be pooled: {e}", dst.shape()))
    })?;
    let expected = geom.output_shape(geom.channels);
    if grad_out.shape() != &expected {
        return Err(Error::invalid_destination(
            op,
            format!(
                "shape {} does not pool to the gradient shape {}",
                dst.shape(),
                grad_out.shape()
            ),
        ));
    }
    check_dst(op, dst, dst.shape(), grad_out.dtype())?;
    check_dense(op, dst)?;
    check_disjoint(op, &[dst], &[grad_out])?;
    Ok(geom)
}

/// Max pooling. Records the selected input offsets into `indices`.
pub fn max_pool2d_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    indices: &mut PoolIndices<B>,
    input: &Tensor<B>,
    window: &Window2d,
) -> Result<&'d Tensor<B>> {
    let op = "max_pool2d";
    window.check_pooling()?;
    expect_rank4(op, input)?;
    let geom = Geometry2d::resolve(input.shape(), *window)?;
    let out_shape = geom.output_shape(geom.channels);
    check_dst(op, dst, &out_shape, input.dtype())?;
    check_dense(op, dst)?;
    check_dst(op, &indices.indices, &out_shape, DType::I64)?;
    check_dense(op, &indices.indices)?;
    check_disjoint(op, &[dst, &indices.indices], &[input])?;

    indices.invalidate();
    {
        let s = input.read_storage()?;
        let mut d = dst.write_storage()?;
        let mut idx = indices.indices.write_storage()?;
        B::max_pool2d_to(
            &mut d,
            dst.layout(),
            &mut idx,
            indices.indices.layout(),
            &s,
            input.layout(),
            &geom,
        )?;
    }
    indices.recorded_for = Some(input.shape().clone());
    Ok(dst)
}

/// Max-pooling backward: routes each output gradient to its recorded input
/// position. `dst` is shaped like the forward input.
#[tracing::instrument(level = "debug", skip_all, fields(input = %dst.shape()))]
pub fn max_pool2d_backward_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
    indices: &PoolIndices<B>,
    window: &Window2d,
) -> Result<&'d Tensor<B>> {
    let op = "max_pool2d_backward";
    let geom = backward_geometry(op, dst, grad_out, window)?;
    indices.check_fresh(op, dst.shape())?;
    check_disjoint(op, &[dst], &[&indices.indices])?;
    let g = grad_out.read_storage()?;
    let idx = indices.indices.read_storage()?;
    let mut d = dst.write_storage()?;
    B::max_pool2d_backward_to(
        &mut d,
        dst.layout(),
        &g,
        grad_out.layout(),
        &idx,
        indices.indices.layout(),
        &geom,
    )?;
    Ok(dst)
}

/// Average pooling over the non-padding positions of each window.
pub fn avg_pool2d_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    input: &Tensor<B>,
    window: &Window2d,
) -> Result<&'d Tensor<B>> {
    let op = "avg_pool2d";
    window.check_pooling()?;
    expect_rank4(op, input)?;
    let geom = Geometry2d::resolve(input.shape(), *window)?;
    check_dst(op, dst, &geom.output_shape(geom.channels), input.dtype())?;
    check_dense(op, dst)?;
    check_disjoint(op, &[dst], &[input])?;
    let s = input.read_storage()?;
    let mut d = dst.write_storage()?;
    B::avg_pool2d_to(&mut d, dst.layout(), &s, input.layout(), &geom)?;
    Ok(dst)
}

/// Average-pooling backward: spreads each output gradient evenly over its
/// window. Padding receives nothing.
#[tracing::instrument(level = "debug", skip_all, fields(input = %dst.shape()))]
pub fn avg_pool2d_backward_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
    window: &Window2d,
) -> Result<&'d Tensor<B>> {
    let geom = backward_geometry("avg_pool2d_backward", dst, grad_out, window)?;
    let g = grad_out.read_storage()?;
    let mut d = dst.write_storage()?;
    B::avg_pool2d_backward_to(&mut d, dst.layout(), &g, grad_out.layout(), &geom)?;
    Ok(dst)
}

/// Global average pooling: `[N, C, H, W] -> [N, C]`.
pub fn global_avg_pool2d_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    input: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    expect_rank4("global_avg_pool2d", input)?;
    mean_to(dst, input, &[2, 3], false)
}

/// Global average-pooling backward: `dst = broadcast(grad_out / (H*W))`.
///
/// `grad_out` may be `[N, C]` or `[N, C, 1, 1]`.
pub fn global_avg_pool2d_backward_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    let op = "global_avg_pool2d_backward";
    dst_rank4(op, dst)?;
    let g = match grad_out.rank() {
        2 => grad_out.unsqueeze(2)?.unsqueeze(3)?,
        4 => grad_out.clone(),
        got => {
            return Err(Error::RankMismatch {
                op,
                expected: 2,
                got,
            })
        }
    };
    let (n, c, h, w) = (dst.dims()[0], dst.dims()[1], dst.dims()[2], dst.dims()[3]);
    if g.dims() != [n, c, 1, 1] {
        return Err(Error::invalid_destination(
            op,
            format!(
                "shape {} does not pool to the gradient shape {}",
                dst.shape(),
                grad_out.shape()
            ),
        ));
    }
    let spread = g.broadcast_as(dst.shape().clone())?;
    affine_to(dst, &spread, 1.0 / (h * w) as f64, 0.0)
}

/// Adaptive average pooling; the output size is the spatial size of `dst`.
pub fn adaptive_avg_pool2d_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    input: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    let op = "adaptive_avg_pool2d";
    expect_rank4(op, input)?;
    dst_rank4(op, dst)?;
    let id = input.dims();
    let out_hw = [dst.dims()[2], dst.dims()[3]];
    if out_hw.contains(&0) {
        return Err(Error::unsupported(op, "output size must be >= 1"));
    }
    let expected = Shape::from((id[0], id[1], out_hw[0], out_hw[1]));
    check_dst(op, dst, &expected, input.dtype())?;
    check_dense(op, dst)?;
    check_disjoint(op, &[dst], &[input])?;
    let s = input.read_storage()?;
    let mut d = dst.write_storage()?;
    B::adaptive_avg_pool2d_to(&mut d, dst.layout(), &s, input.layout())?;
    Ok(dst)
}

/// Adaptive average-pooling backward; `dst` is shaped like the forward input.
pub fn adaptive_avg_pool2d_backward_to<'d, B: Backend>(
    dst: &'d Tensor<B>,
    grad_out: &Tensor<B>,
) -> Result<&'d Tensor<B>> {
    let op = "adaptive_avg_pool2d_backward";
    expect_rank4(op, grad_out)?;
    dst_rank4(op, dst)?;
    let (gd, dd) = (grad_out.dims(), dst.dims());
    if gd[0] != dd[0] || gd[1] != dd[1] {
        return Err(Error::invalid_destination(
            op,
            format!(
                "shape {} does not match gradient {}",
                dst.shape(),
                grad_out.shape()
            ),
        ));
    }
    check_dst(op, dst, dst.shape(), grad_out.dtype())?;
    check_dense(op, dst)?;
    check_disjoint(op, &[dst], &[grad_out])?;
    let g = grad_out.read_storage()?;
    let mut d = dst.write_storage()?;
    B::adaptive_avg_pool2d_backward_to(&mut d, dst.layout(), &g, grad_out.layout())?;
    Ok(dst)
}
